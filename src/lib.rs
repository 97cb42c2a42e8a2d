//! projkit - manifest, workspace directory and start page for research projects

pub mod archive;
pub mod clock;
pub mod commands;
pub mod config;
pub mod deploy;
pub mod fs_util;
pub mod models;
pub mod project;
pub mod startpage;
pub mod store;
pub mod telemetry;
pub mod validation;
