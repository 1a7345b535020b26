pub mod client;
pub mod messages;

pub use client::{ConnectionState, OutboundSender, OutboundSink, TransportClient, TransportConfig};
pub use messages::{decode, encode, ClientFrame, InboundMessage, OutboundMessage, ServerFrame};
