pub mod config;
pub mod credential;
pub mod validation;
pub mod session;
pub mod publisher;
pub mod http;
pub mod app;

pub use app::RelayApp;
pub use config::AppConfig;
