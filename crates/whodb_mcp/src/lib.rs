mod confirmation;
mod server;

pub use confirmation::{ConfirmationStore, PendingWrite};
pub use server::{McpGateway, WriteMode, serve_stdio};
