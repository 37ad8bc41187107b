//! CLI command implementations.

pub mod build;
pub mod config;
pub mod containers;
pub mod doctor;
pub mod extensions;
pub mod firewall;
pub mod run;
