// 变更检测
pub mod change;
pub mod engine;
pub mod summary;

pub use change::{Change, Severity};
pub use engine::{diff, DiffError};
pub use summary::ChangeSummary;
