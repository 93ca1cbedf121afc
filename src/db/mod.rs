//! Database module: model types and the SQLite store.

mod models;
mod store;

pub use models::*;
pub use store::*;
