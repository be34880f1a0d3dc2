//! CLI commands

mod build;
mod cache;
mod init;
mod list;

pub use build::BuildCommand;
pub use cache::CacheCommand;
pub use init::InitCommand;
pub use list::ListCommand;
