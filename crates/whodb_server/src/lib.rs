mod auth;
mod gate;
mod graphql;
mod server;

pub use auth::{ResolvedCredential, desktop_origin, login_cookie, logout_cookie};
pub use graphql::GatewaySettings;
pub use server::{ServerState, build_router, run};
