mod driver;

pub use driver::{METADATA, MySqlPlugin};
