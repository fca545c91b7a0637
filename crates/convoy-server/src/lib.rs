pub mod client;
pub mod event_bridge;
pub mod handlers;
pub mod link;
pub mod recovery;
pub mod rpc;
pub mod server;

pub use handlers::HandlerState;
pub use server::{start, AppState, ServerConfig, ServerHandle};
