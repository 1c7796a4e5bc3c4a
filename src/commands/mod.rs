//! CLI command implementations.
//!
//! Each submodule keeps its decision logic in plain functions and does IO
//! only in its `run` entry point.

pub mod clean;
pub mod init;
pub mod run;
pub mod status;
pub mod validate;
