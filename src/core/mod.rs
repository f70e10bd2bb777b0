//! Core gateway engine: health probing, background monitoring and registration.

pub mod error;
pub mod health;
pub mod health_monitor;
pub mod registration;
pub mod url_validation;

pub use error::{RegistrationError, RegistrationResult, UrlValidationError};
pub use health::{HEALTH_CHECK_PATH, HealthProber, HealthResult};
pub use health_monitor::{HealthCycleStats, HealthMonitor, MonitorStatus};
pub use registration::{RegistrationOutcome, RegistrationService};
pub use url_validation::validate_endpoint_url;
