// Injectable clock
pub mod clock;

// Resilient provider API client
pub mod client;

// Environment-driven settings
pub mod config;

// Token encryption at rest
pub mod crypto;

// Error taxonomy
pub mod error;

// Token lifecycle orchestration
pub mod manager;

// Encrypted token storage
pub mod store;

pub use error::{Error, Result};
