mod driver;

pub use driver::{METADATA, SqlitePlugin};
