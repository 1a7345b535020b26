pub mod audio;
pub mod config;
pub mod error;
pub mod realtime;
pub mod session;

pub use audio::{
    ChunkCursor, ChunkStreamer, FileSource, GrowingSource, MemorySource, StreamOutcome,
    StreamSummary, StreamerConfig,
};
pub use config::Config;
pub use error::{CodecError, SessionError, StreamError, TransportError};
pub use realtime::{
    ConnectionState, InboundMessage, OutboundMessage, OutboundSender, OutboundSink,
    TransportClient, TransportConfig,
};
pub use session::{RealtimeSession, SessionConfig, SessionSink, SessionStats};
