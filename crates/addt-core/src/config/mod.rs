//! Configuration: key table, config files and composition.

mod file;
pub mod keys;
mod loader;
mod schema;

pub use file::ConfigFile;
pub use keys::{ConfigKey, ExtensionField, KeyDef, KeyKind, KEYS};
pub use loader::{ConfigLoader, ExtensionSelection, ALIAS_PREFIX, DEFAULT_EXTENSION};
pub use schema::*;
