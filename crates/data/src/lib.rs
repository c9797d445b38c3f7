//! Hierarchical configuration and data management.
//!
//! A [`DataManager`] composes uniquely aliased [`DataStore`] backends, each of
//! which owns a set of thematic *domains* materialized as [`DataObject`]
//! trees. Stores distinguish how data is read and written (INI files, plain
//! memory, a SQLite database), while data objects provide the uniform
//! token-addressed view over the values themselves. Reads and writes are
//! gated by the model registry of the `models` crate, and every change is
//! tracked in a taint log until it is synced back to its backend.

mod ini;
mod manager;
mod memory;
mod object;
pub mod observer;
mod sqlite;
mod store;

pub use ini::IniFileStore;
pub use manager::{DataManager, StoreHandle};
pub use memory::MemoryStore;
pub use object::{DataObject, LookupError};
pub use sqlite::SqliteStore;
pub use store::{normalize_alias, DataStore, StoreConfig, StoreError, StoreOptions, StoreState};
