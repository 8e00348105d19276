pub mod comparator;
pub mod debounce;
pub mod engine;
pub mod folder_state;
pub mod hasher;
pub mod ignore;
pub mod node;
pub mod persistence;
pub mod reconcile;
pub mod remote_scan;
pub mod scanner;
pub mod store;

pub use comparator::{compare_file_nodes, derive_directory_status, ComparisonSummary};
pub use debounce::Debouncer;
pub use engine::SyncEngine;
pub use folder_state::FolderState;
pub use ignore::IgnorePolicy;
pub use node::{
    ComparisonMeta, ComparisonNode, ComparisonStatus, NodeBody, NodeKind, NodeRecord, Origin, RawMeta, RawNode,
    TreeNode,
};
pub use persistence::{BlobStore, JsonFileStore, MemoryBlobStore, Persistence};
pub use remote_scan::RemoteScanner;
pub use scanner::LocalScanner;
pub use store::{ComparisonStore, RefreshTarget, Removal};
