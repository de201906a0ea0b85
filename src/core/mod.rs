// Public modules
pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod executor;
pub mod hosts;
pub mod nginx;
pub mod paths;
pub mod pipeline;
pub mod probe;
pub mod provider;
pub mod site;
pub mod ssh;
pub mod step_log;
pub mod store;

// Internal modules
pub(crate) mod random;

// Re-export common types for convenience
pub use config::{Mode, SitewrightConfig};
pub use engine::{Dispatcher, Provisioner};
pub use error::{Error, ErrorCode, Result};
pub use site::{NewSite, Site, SiteId, SiteStatus};
pub use step_log::{LogStatus, Step, StepLog};
