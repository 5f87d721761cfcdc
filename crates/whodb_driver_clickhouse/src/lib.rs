mod driver;

pub use driver::{METADATA, ClickHousePlugin};
