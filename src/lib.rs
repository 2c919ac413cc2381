// Library exports for the CLI binary and integration tests

pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod shutdown;
pub mod upload;
pub mod validation;

pub use error::{ErrorCode, UploadError};
pub use upload::UploadEngine;
