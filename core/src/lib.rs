pub mod config;
pub mod destination;
pub mod error;
pub mod manager;
pub mod net;
pub mod progress;
pub mod registry;
pub mod storage;
pub mod task;
pub mod transfer;

#[cfg(test)]
mod tests;

pub use crate::config::{EngineConfig, PlatformFlags};
pub use crate::error::{CoreError, CoreResult};
pub use crate::manager::{TransferHandle, TransferManager};
pub use crate::progress::Progress;
pub use crate::task::{
    Destination, StorageCategory, TransferConfig, TransferId, TransferOutcome, TransferStatus,
};
