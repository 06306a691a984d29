mod dormant_database;
mod elasticsearch;
mod service_monitor;
mod snapshot;
mod version;

pub use dormant_database::*;
pub use elasticsearch::*;
pub use service_monitor::*;
pub use snapshot::*;
pub use version::*;
