pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod remote;

pub use config::{ConfigProvider, ConnectionSettings, PairedFolder, SyncSettings, WorkspaceConfig};
pub use core::{ComparisonNode, ComparisonStatus, ComparisonStore, ComparisonSummary, SyncEngine};
pub use error::{Result, SyncError};
pub use remote::{ConnectionManager, ConnectionRegistry, RusshConnector};
