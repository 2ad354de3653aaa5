// Re-export all public items from the db modules
pub use self::core::{Db, DbTransaction};
pub use self::error::{Error, Result};
pub use self::paths::FieldPath;
pub use self::types::*;

pub mod bulk;
pub mod commit;
pub mod core;
pub mod entities;
pub mod error;
pub mod groups;
pub mod paths;
pub mod propose;
pub mod review;
pub mod types;
