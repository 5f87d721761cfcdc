mod driver;
mod query;

pub use driver::ElasticSearchPlugin;
