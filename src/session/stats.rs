use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::audio::StreamSummary;
use crate::realtime::ConnectionState;

/// Statistics about a realtime session
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub session_id: String,

    /// When the session was started
    pub started_at: DateTime<Utc>,

    /// Time since start in seconds
    pub duration_secs: f64,

    /// Connection state when the stats were taken
    pub connection_state: ConnectionState,

    /// Inbound messages delivered to the sink
    pub messages_received: usize,

    /// Whether a capture is currently streaming
    pub is_streaming: bool,

    /// Totals from the last completed streaming run, if any
    pub last_stream: Option<StreamSummary>,

    /// Error that tore the session down, if any
    pub fault: Option<String>,
}
