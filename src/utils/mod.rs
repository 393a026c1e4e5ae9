pub mod error;
pub mod types;

pub use error::{FleetError, Result};
pub use types::{Criticality, HostRole, ProbeCategory};
