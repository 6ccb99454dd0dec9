mod handlers;
mod routes;
mod server;
mod sse;

pub use routes::{create_router, AppState};
pub use server::RelayServer;
