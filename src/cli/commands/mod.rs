//! Command implementations for ssh-audit-proxy CLI

pub mod config;
pub mod run;
pub mod version;
