pub mod config;
pub mod credentials;

pub use config::{ConfigError, QlikConfig};
pub use credentials::{StoredCredentials, TokenResponse};
