#![allow(unused_assignments)] // thiserror/miette proc macros trigger false positives

pub mod cli;
pub mod config;
pub mod error;
pub mod init;
pub mod logging;
pub mod marker;
pub mod paths;
pub mod progress;
pub mod provider;
pub mod provision;
pub mod readiness;
pub mod ssh_config;
pub mod transfer;
pub mod util;
pub mod workflow;
