pub mod chunk;
pub mod source;

pub use chunk::{ChunkCursor, ChunkStreamer, StreamOutcome, StreamSummary, StreamerConfig};
pub use source::{FileSource, GrowingSource, MemorySource};
