mod action;
mod contextual;
mod executor;
mod export;
mod resolver;
mod selection;

pub use action::{Action, ActionInput, ActionKind, PickedFile};
pub use contextual::{ContextualActions, ContextualState};
pub use executor::ActionExecutor;
pub use resolver::{is_move_delete_allowed, ActionResolver, ResolvedActions};
pub use selection::{MultiSelection, MULTI_SELECTION_LIMIT};
