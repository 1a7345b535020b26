use crate::audio::StreamerConfig;
use crate::realtime::TransportConfig;

/// Configuration for a realtime session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Unique session identifier, used in logs and stats
    pub session_id: String,

    /// Connection settings for the realtime server
    pub transport: TransportConfig,

    /// How captured audio is sliced and paced
    pub streamer: StreamerConfig,
}

impl SessionConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            session_id: format!("session-{}", uuid::Uuid::new_v4()),
            transport: TransportConfig::new(url),
            streamer: StreamerConfig::default(),
        }
    }
}
