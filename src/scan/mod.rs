// 扫描模块入口
pub mod channel;
pub mod collector;
pub mod compose;
pub mod container;
pub mod coordinator;
pub mod grouping;
pub mod host;
pub mod probe;
pub mod retry;
pub mod session;
pub mod snapshot;

pub use coordinator::ScanCoordinator;
pub use session::ScanSession;
pub use snapshot::{HostFacts, Service, Snapshot};
