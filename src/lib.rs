// Configuration
pub mod config;

// Error taxonomy
pub mod error;

// Credential records, storage and activation
pub mod credentials;

// OIDC service client
pub mod oidc;

// Authorization flow drivers
pub mod flows;

// Token exchange and refresh
pub mod tokens;

// Composition root
pub mod lifecycle;

pub use config::TokenLifecycleConfig;
pub use error::{LifecycleError, RefreshFailure, Result};
pub use lifecycle::TokenLifecycle;
