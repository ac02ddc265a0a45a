pub mod config;
pub mod media;
pub mod models;
pub mod realtime;
pub mod relay;
pub mod store;

pub use models::*;
pub use realtime::{RealtimeSession, SessionEvent};
