//! VM backup engine library
//!
//! Streams exported VM disk images to remote storage, keeps backup metadata,
//! prunes old backups under a retention policy and consolidates delta chains.

pub mod backup;
pub mod chain;
pub mod config;
pub mod image;
pub mod remote;
pub mod retention;
pub mod task;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::BackupError;
pub type Result<T> = std::result::Result<T, BackupError>;
