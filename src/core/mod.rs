// Shared vocabulary: errors, buffer types, timing and configuration.

pub mod clock;
pub mod config;
pub mod error;
pub mod types;

pub use clock::*;
pub use config::*;
pub use error::*;
pub use types::*;
