//! linkcycle common - shared configuration, credentials, errors and domain types.
//!
//! Used by the `linkcycled` daemon and its integration tests.

pub mod config;
pub mod credentials;
pub mod error;
pub mod types;

pub use config::{
    MonitorConfig, SiteConfig, TriggerPolicy, UpsSettings, DEFAULT_CONFIG_PATH,
    UPS_REQUEST_TIMEOUT_SECS,
};
pub use credentials::{Credentials, SdwanCredentials, UpsCredentials};
pub use error::MonitorError;
pub use types::{HealthObservation, LinkState, Phase, SiteId};
