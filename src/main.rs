use anyhow::Result;
use clap::Parser;
use loqa_realtime::{Config, FileSource, InboundMessage, RealtimeSession, SessionSink};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Stream a capture file to a realtime server and log what comes back
#[derive(Parser, Debug)]
#[command(name = "loqa-realtime", version)]
struct Args {
    /// Config file (extension optional)
    #[arg(long, default_value = "config/loqa-realtime")]
    config: String,

    /// WebSocket URL, overrides the config file
    #[arg(long)]
    url: Option<String>,

    /// Capture file to stream
    #[arg(long)]
    file: Option<PathBuf>,

    /// Treat the file as still being recorded until Ctrl-C
    #[arg(long)]
    follow: bool,

    /// Chunk size in bytes, overrides the config file
    #[arg(long)]
    chunk_size: Option<u32>,

    /// Text message to send once connected (repeatable)
    #[arg(long = "text")]
    texts: Vec<String>,
}

struct LogSink;

impl SessionSink for LogSink {
    fn on_open(&self) {
        info!("Connected");
    }

    fn on_close(&self) {
        info!("Connection closed");
    }

    fn on_message(&self, message: InboundMessage) {
        match message {
            InboundMessage::Text { body } => info!("Text: {}", body),
            InboundMessage::Audio { payload } => info!("Audio: {} bytes", payload.len()),
            InboundMessage::AudioDone => info!("Audio done"),
            InboundMessage::Error { detail } => warn!("Server error: {}", detail),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let cfg = Config::load_with_url(&args.config, args.url.as_deref())?;

    let mut session_config = cfg.session();
    if let Some(chunk_size) = args.chunk_size {
        session_config.streamer.chunk_size = chunk_size;
    }

    info!("Loqa Realtime v{}", env!("CARGO_PKG_VERSION"));
    info!("Server: {}", session_config.transport.url);

    let mut session = RealtimeSession::new(session_config, Arc::new(LogSink));
    session.start().await?;

    for text in &args.texts {
        session.send_text(text.clone())?;
    }

    if let Some(path) = &args.file {
        let producing = Arc::new(AtomicBool::new(args.follow));
        session
            .stream(Arc::new(FileSource::new(path, Arc::clone(&producing))))
            .await?;

        if args.follow {
            info!("Following {}, press Ctrl-C to end the capture", path.display());
            tokio::signal::ctrl_c().await?;
            producing.store(false, Ordering::SeqCst);
            info!("Capture ended, sending remaining audio");
        }

        let summary = session.finish_streaming().await?;
        info!(
            "Streamed {} chunks ({} bytes)",
            summary.chunks_sent, summary.bytes_sent
        );
    }

    info!("Listening for server messages, press Ctrl-C to exit");
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        fault = session.wait_fault() => error!("Session failed: {}", fault?),
    }

    let stats = session.stop().await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);

    Ok(())
}
