pub mod types;
pub mod error;
pub mod data;
pub mod store;
pub mod config;
pub mod utils;
pub mod verify;
pub mod engine;

pub use types::*;
pub use config::Config;
pub use engine::VerificationEngine;
pub use error::{Result, VerifyError};
