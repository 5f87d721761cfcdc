pub mod fake_plugin;
pub mod fixtures;

pub use fake_plugin::{FakeOutcome, FakePlugin, FakePluginStats};
