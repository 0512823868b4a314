//! CLI command handlers.
//!
//! - `build` - Respin an image: validate, mount, stage, unpack, author
//! - `clean` - Tear down leftovers of an earlier session

pub mod build;
pub mod clean;

pub use build::cmd_build;
pub use clean::cmd_clean;
