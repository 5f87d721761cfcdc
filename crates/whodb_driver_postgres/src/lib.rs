mod driver;

pub use driver::{METADATA, PostgresPlugin};
