use super::config::SessionConfig;
use super::stats::SessionStats;
use crate::audio::{ChunkStreamer, GrowingSource, StreamSummary};
use crate::error::{SessionError, StreamError, TransportError};
use crate::realtime::{ConnectionState, InboundMessage, TransportClient};
use anyhow::{bail, Context, Result};
use chrono::Utc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Application callbacks for a realtime session
pub trait SessionSink: Send + Sync + 'static {
    fn on_open(&self) {}

    fn on_close(&self) {}

    fn on_message(&self, message: InboundMessage);
}

struct ActiveStream {
    stop: CancellationToken,
    task: JoinHandle<Result<StreamSummary, StreamError>>,
}

/// First fatal error of a session run
///
/// Cancelling `token` stops the transport driver and any running stream,
/// so the session is torn down even if nobody is awaiting it.
#[derive(Clone, Default)]
struct Fault {
    token: CancellationToken,
    reason: Arc<Mutex<Option<SessionError>>>,
}

impl Fault {
    fn raise(&self, reason: SessionError) {
        let mut slot = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            error!("Realtime session failed, tearing down: {}", reason);
            *slot = Some(reason);
        }
        drop(slot);
        self.token.cancel();
    }

    fn reason(&self) -> Option<SessionError> {
        self.reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// A realtime session: one transport client plus at most one capture stream
pub struct RealtimeSession {
    /// Session configuration
    config: SessionConfig,

    /// Receives connection events and inbound messages
    sink: Arc<dyn SessionSink>,

    /// Transport for the current session, if started
    client: Option<TransportClient>,

    /// Capture currently being streamed
    stream: Option<ActiveStream>,

    /// Raised by a failed transport or a fatal streaming error
    fault: Fault,

    /// Tears the session down once the transport gives up
    watchdog: Option<JoinHandle<()>>,

    /// When the session was last started
    started_at: chrono::DateTime<chrono::Utc>,

    /// Inbound messages delivered to the sink
    messages_received: Arc<AtomicUsize>,

    /// Summary of the last streaming run
    last_stream: Option<StreamSummary>,
}

impl RealtimeSession {
    pub fn new(config: SessionConfig, sink: Arc<dyn SessionSink>) -> Self {
        Self {
            config,
            sink,
            client: None,
            stream: None,
            fault: Fault::default(),
            watchdog: None,
            started_at: Utc::now(),
            messages_received: Arc::new(AtomicUsize::new(0)),
            last_stream: None,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.config.session_id
    }

    /// Connect a fresh transport client
    ///
    /// A previous client is fully torn down first, so the session never
    /// holds two live connections.
    pub async fn start(&mut self) -> Result<()> {
        if self.client.is_some() {
            warn!("Realtime session already started, restarting");
            self.teardown().await;
        }

        info!(
            "Starting realtime session {} ({})",
            self.config.session_id, self.config.transport.url
        );

        self.fault = Fault::default();
        let client =
            TransportClient::with_stop(self.config.transport.clone(), self.fault.token.clone());

        let sink = Arc::clone(&self.sink);
        let received = Arc::clone(&self.messages_received);
        client.on_message(move |message| {
            received.fetch_add(1, Ordering::SeqCst);
            sink.on_message(message);
        })?;

        let sink = Arc::clone(&self.sink);
        client.on_open(move || sink.on_open())?;

        let sink = Arc::clone(&self.sink);
        client.on_close(move || sink.on_close())?;

        client.connect()?;

        let mut state = client.subscribe_state();
        let max_retries = self.config.transport.max_retries;
        let fault = self.fault.clone();
        self.watchdog = Some(tokio::spawn(async move {
            let failed = state
                .wait_for(|current| *current == ConnectionState::Failed)
                .await
                .is_ok();
            if failed {
                fault.raise(SessionError::Transport(TransportError::RetriesExhausted {
                    attempts: max_retries,
                }));
            }
        }));

        self.started_at = Utc::now();
        self.client = Some(client);

        Ok(())
    }

    pub fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.check_fault()?;
        self.client()?
            .send_text(text)
            .context("Failed to send text message")
    }

    /// Start streaming a capture over the session's transport
    ///
    /// A previous capture that has already ended is collected first, so its
    /// error is returned here rather than lost.
    pub async fn stream(&mut self, source: Arc<dyn GrowingSource>) -> Result<()> {
        if let Some(active) = self.stream.take() {
            if !active.task.is_finished() {
                self.stream = Some(active);
                bail!("A capture is already streaming in session {}", self.config.session_id);
            }
            self.collect(active.task).await?;
        }
        self.check_fault()?;

        let sender = self.client()?.sender();
        let stop = self.fault.token.child_token();
        let streamer = ChunkStreamer::with_stop(self.config.streamer.clone(), stop.clone());
        let fault = self.fault.clone();

        info!("Streaming {} for session {}", source.name(), self.config.session_id);

        let task = tokio::spawn(async move {
            let result = streamer.run(source.as_ref(), &sender).await;
            if let Err(e) = &result {
                fault.raise(SessionError::Stream(e.clone()));
            }
            result
        });
        self.stream = Some(ActiveStream { stop, task });

        Ok(())
    }

    /// Wait for the current capture to finish streaming
    ///
    /// A streaming error tears the session down, since the server's view of
    /// the audio can no longer be trusted.
    pub async fn finish_streaming(&mut self) -> Result<StreamSummary> {
        let active = self.stream.take().context("No capture is streaming")?;
        self.collect(active.task).await
    }

    /// Stop the current capture mid-stream
    pub async fn stop_streaming(&mut self) -> Result<Option<StreamSummary>> {
        match self.stream.take() {
            Some(active) => {
                active.stop.cancel();
                self.collect(active.task).await.map(Some)
            }
            None => Ok(None),
        }
    }

    /// Stop streaming, close the connection and return final stats
    pub async fn stop(&mut self) -> Result<SessionStats> {
        if self.client.is_none() {
            warn!("Realtime session not active");
            return Ok(self.stats());
        }

        info!("Stopping realtime session {}", self.config.session_id);

        if let Err(e) = self.stop_streaming().await {
            error!("Capture stream ended with error: {:#}", e);
        }

        // Snapshot before teardown so the final state is reported
        let stats = self.stats();
        self.teardown().await;

        info!("Realtime session {} stopped", self.config.session_id);

        Ok(stats)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.client
            .as_ref()
            .map(TransportClient::state)
            .unwrap_or_default()
    }

    /// Resolves once the session has been torn down by a failed transport
    /// or a fatal streaming error
    pub async fn wait_fault(&self) -> Result<SessionError> {
        self.client()?;
        self.fault.token.cancelled().await;
        self.fault
            .reason()
            .context("Session stopped without a recorded fault")
    }

    /// The error that tore the session down, if any
    pub fn fault(&self) -> Option<SessionError> {
        self.fault.reason()
    }

    pub fn stats(&self) -> SessionStats {
        let duration = Utc::now().signed_duration_since(self.started_at);

        SessionStats {
            session_id: self.config.session_id.clone(),
            started_at: self.started_at,
            duration_secs: duration.num_milliseconds() as f64 / 1000.0,
            connection_state: self.connection_state(),
            messages_received: self.messages_received.load(Ordering::SeqCst),
            is_streaming: self
                .stream
                .as_ref()
                .is_some_and(|active| !active.task.is_finished()),
            last_stream: self.last_stream.clone(),
            fault: self.fault.reason().map(|e| e.to_string()),
        }
    }

    fn client(&self) -> Result<&TransportClient> {
        self.client
            .as_ref()
            .with_context(|| format!("Session {} not started", self.config.session_id))
    }

    fn check_fault(&self) -> Result<()> {
        match self.fault.reason() {
            Some(reason) => Err(reason).with_context(|| {
                format!("Session {} was torn down", self.config.session_id)
            }),
            None => Ok(()),
        }
    }

    async fn collect(
        &mut self,
        task: JoinHandle<Result<StreamSummary, StreamError>>,
    ) -> Result<StreamSummary> {
        match task.await.context("Streaming task panicked")? {
            Ok(summary) => {
                self.last_stream = Some(summary.clone());
                Ok(summary)
            }
            Err(e) => {
                self.teardown().await;
                Err(e).context("Capture streaming failed")
            }
        }
    }

    async fn teardown(&mut self) {
        if let Some(active) = self.stream.take() {
            active.stop.cancel();
            match active.task.await {
                Ok(Ok(summary)) => self.last_stream = Some(summary),
                Ok(Err(e)) => error!("Capture stream ended with error: {}", e),
                Err(e) => error!("Streaming task panicked: {}", e),
            }
        }

        if let Some(watchdog) = self.watchdog.take() {
            watchdog.abort();
        }

        if let Some(client) = self.client.take() {
            client.shutdown().await;
        }
    }
}
