//! SQLite persistence for autonomy runs and observed desktop events.

pub mod async_store;
pub mod sqlite_store;
