//! Realtime session management
//!
//! This module provides the `RealtimeSession` abstraction that wires:
//! - A transport client to application callbacks
//! - Capture streaming through the chunk streamer
//! - Session statistics and teardown

mod config;
mod session;
mod stats;

pub use config::SessionConfig;
pub use session::{RealtimeSession, SessionSink};
pub use stats::SessionStats;
