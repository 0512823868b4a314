//! Respin library exports.
//!
//! The `respin` binary is a thin CLI over [`pipeline::Pipeline`]; everything
//! it does is reachable from here for integration testing.

pub mod commands;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod lifecycle;
pub mod pipeline;
pub mod preflight;
pub mod process;
pub mod timing;

pub use error::{RespinError, Result};
