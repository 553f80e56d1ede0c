//! Browser-facing surface for the Direct Line conversation relay.
//!
//! The HTTP routes drive request/response turns; `/api/session/stream` upgrades to a
//! WebSocket that carries the streaming bridge.

pub mod config;
pub mod error;
pub mod http;
pub mod tracing_init;
pub mod ws;

pub use config::{GatewayConfig, LogFormat};
pub use error::GatewayError;
pub use http::{AppState, cors_layer, router};
pub use main_logic::run;

mod main_logic;
