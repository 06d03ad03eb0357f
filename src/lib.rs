pub mod actions;
pub mod db;
pub mod engine;
pub mod entry;
pub mod error;
pub mod events;
pub mod offline;
pub mod remote;
pub mod session;
pub mod settings;
pub mod transfer;

#[cfg(test)]
mod testing;

pub use actions::{
    Action, ActionExecutor, ActionInput, ActionKind, ActionResolver, ContextualActions,
    ContextualState, MultiSelection, PickedFile, ResolvedActions, MULTI_SELECTION_LIMIT,
};
pub use db::Database;
pub use engine::Engine;
pub use entry::{Entry, EntryType, OfflineStatus};
pub use error::{Error, Result};
pub use events::{EventBus, Subscription, TransferEvent, TransferProgress};
pub use offline::{OfflineRepository, TransferDirection, TransferRecord};
pub use remote::RemoteRepository;
pub use session::{Account, Session};
pub use settings::{EngineSettings, RetryPolicy};
pub use transfer::{HttpTransferService, TransferService, TransferWorker, WorkerHandle};
