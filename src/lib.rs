pub mod db;

pub use db::{Db, Error};
pub use rusqlite;
pub use rusqlite_migration;
pub use serde_rusqlite;
