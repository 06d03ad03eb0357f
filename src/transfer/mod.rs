pub mod service;
pub mod worker;

pub use service::{
    HttpTransferService, TransferId, TransferRequest, TransferService, TransferState,
};
pub use worker::{TransferWorker, WorkerConfig, WorkerHandle};
