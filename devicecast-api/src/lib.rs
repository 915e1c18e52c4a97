// DeviceCast API Library
//
// HTTP routing over the streaming core: WebRTC session negotiation, metadata
// broadcast control and the metadata WebSocket

pub mod http;
pub mod server;

pub use http::{create_router, AppState};
pub use server::{bootstrap, shutdown_signal, Server};
