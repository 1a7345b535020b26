use std::collections::VecDeque;
use std::future::{pending, Future};
use std::pin::Pin;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::messages::{self, InboundMessage, OutboundMessage};
use crate::error::TransportError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type ConnectFuture = Pin<Box<dyn Future<Output = Result<WsStream, tungstenite::Error>> + Send>>;

pub type MessageHandler = Box<dyn Fn(InboundMessage) + Send>;
pub type EventHandler = Box<dyn Fn() + Send>;

/// Transport client configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// WebSocket URL of the realtime server
    pub url: String,
    /// Delay before reconnecting after the connection drops
    pub reconnect_interval: Duration,
    /// Consecutive connection attempts allowed before giving up
    pub max_retries: u32,
}

impl TransportConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect_interval: Duration::from_millis(5000),
            max_retries: 5,
        }
    }

    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// Connection lifecycle
///
/// ```text
///  Disconnected ──connect()──► Connecting ──established──► Open
///       ▲                          │                        │
///       └──── retry timer ◄────────┴──────── closed ◄───────┘
///                  │
///                  └── budget exhausted ──► Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Open,
    /// Retry budget exhausted. Terminal.
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Open => write!(f, "Open"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Anything that accepts outbound messages without blocking
pub trait OutboundSink: Send + Sync {
    fn send(&self, message: OutboundMessage) -> Result<(), TransportError>;
}

enum Command {
    Connect,
    Disconnect,
    Send(OutboundMessage),
    OnMessage(MessageHandler),
    OnOpen(EventHandler),
    OnClose(EventHandler),
    Shutdown,
}

/// Send-only handle onto a [`TransportClient`]
///
/// Cloned into producers (such as the chunk streamer) so they can feed the
/// outbound path without being able to drive the connection.
#[derive(Clone)]
pub struct OutboundSender {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    max_retries: u32,
}

impl OutboundSink for OutboundSender {
    fn send(&self, message: OutboundMessage) -> Result<(), TransportError> {
        refuse_if_failed(&self.state, self.max_retries)?;
        self.commands
            .send(Command::Send(message))
            .map_err(|_| TransportError::Shutdown)
    }
}

/// A failed client can never deliver, so producers are told immediately
fn refuse_if_failed(
    state: &watch::Receiver<ConnectionState>,
    max_retries: u32,
) -> Result<(), TransportError> {
    if *state.borrow() == ConnectionState::Failed {
        return Err(TransportError::RetriesExhausted {
            attempts: max_retries,
        });
    }
    Ok(())
}

/// Client side of the realtime WebSocket protocol
///
/// Owns at most one live connection. Every operation is a command to a
/// single driver task, so state transitions, sends and the queue flush on
/// open are applied strictly in the order they were issued. Must be created
/// inside a tokio runtime.
///
/// Once the retry budget is exhausted the client is `Failed`: its queue is
/// dropped and every further send returns
/// [`TransportError::RetriesExhausted`].
pub struct TransportClient {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    max_retries: u32,
    task: Option<JoinHandle<()>>,
}

impl TransportClient {
    pub fn new(config: TransportConfig) -> Self {
        Self::with_stop(config, CancellationToken::new())
    }

    /// Client whose driver disconnects and exits when `stop` is cancelled.
    /// Later sends fail with [`TransportError::Shutdown`].
    pub fn with_stop(config: TransportConfig, stop: CancellationToken) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let max_retries = config.max_retries;

        let driver = Driver::new(config, state_tx, stop);
        let task = tokio::spawn(driver.run(command_rx));

        Self {
            commands,
            state,
            max_retries,
            task: Some(task),
        }
    }

    /// Start connecting. No effect while already connecting or open.
    pub fn connect(&self) -> Result<(), TransportError> {
        self.command(Command::Connect)
    }

    /// Close the connection and cancel any pending reconnect
    pub fn disconnect(&self) -> Result<(), TransportError> {
        self.command(Command::Disconnect)
    }

    /// Write the message now if open, otherwise queue it for the next open
    pub fn send(&self, message: OutboundMessage) -> Result<(), TransportError> {
        refuse_if_failed(&self.state, self.max_retries)?;
        self.command(Command::Send(message))
    }

    pub fn send_text(&self, text: impl Into<String>) -> Result<(), TransportError> {
        self.send(OutboundMessage::text(text))
    }

    /// Replace the inbound message handler
    pub fn on_message<F>(&self, handler: F) -> Result<(), TransportError>
    where
        F: Fn(InboundMessage) + Send + 'static,
    {
        self.command(Command::OnMessage(Box::new(handler)))
    }

    /// Replace the handler fired each time the connection opens
    pub fn on_open<F>(&self, handler: F) -> Result<(), TransportError>
    where
        F: Fn() + Send + 'static,
    {
        self.command(Command::OnOpen(Box::new(handler)))
    }

    /// Replace the handler fired each time the connection closes or a
    /// connection attempt fails
    pub fn on_close<F>(&self, handler: F) -> Result<(), TransportError>
    where
        F: Fn() + Send + 'static,
    {
        self.command(Command::OnClose(Box::new(handler)))
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Wait until the connection reaches `target`
    pub async fn wait_for(&self, target: ConnectionState) -> Result<(), TransportError> {
        let mut state = self.state.clone();
        let reached = state.wait_for(|current| *current == target).await.is_ok();
        if reached {
            Ok(())
        } else {
            Err(TransportError::Shutdown)
        }
    }

    /// Resolves once the retry budget is exhausted
    pub async fn failed(&self) -> TransportError {
        match self.wait_for(ConnectionState::Failed).await {
            Ok(()) => TransportError::RetriesExhausted {
                attempts: self.max_retries,
            },
            Err(e) => e,
        }
    }

    pub fn sender(&self) -> OutboundSender {
        OutboundSender {
            commands: self.commands.clone(),
            state: self.state.clone(),
            max_retries: self.max_retries,
        }
    }

    /// Disconnect and wait for the driver task and socket to be torn down
    pub async fn shutdown(mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("Transport driver task panicked: {}", e);
            }
        }
    }

    fn command(&self, command: Command) -> Result<(), TransportError> {
        self.commands
            .send(command)
            .map_err(|_| TransportError::Shutdown)
    }
}

impl OutboundSink for TransportClient {
    fn send(&self, message: OutboundMessage) -> Result<(), TransportError> {
        TransportClient::send(self, message)
    }
}

impl Drop for TransportClient {
    fn drop(&mut self) {
        // Outstanding OutboundSenders keep the channel open, so ask explicitly
        if self.task.is_some() {
            let _ = self.commands.send(Command::Shutdown);
        }
    }
}

enum Event {
    Command(Option<Command>),
    Connected(Result<WsStream, tungstenite::Error>),
    Frame(Option<Result<Message, tungstenite::Error>>),
    RetryDue,
    Stopped,
}

/// Connection state owned by the driver task
struct Driver {
    config: TransportConfig,
    state: watch::Sender<ConnectionState>,
    queue: VecDeque<OutboundMessage>,
    retries_left: u32,
    connecting: Option<ConnectFuture>,
    writer: Option<SplitSink<WsStream, Message>>,
    reader: Option<SplitStream<WsStream>>,
    retry_at: Option<Instant>,
    on_message: Option<MessageHandler>,
    on_open: Option<EventHandler>,
    on_close: Option<EventHandler>,
    stop: CancellationToken,
}

impl Driver {
    fn new(
        config: TransportConfig,
        state: watch::Sender<ConnectionState>,
        stop: CancellationToken,
    ) -> Self {
        Self {
            retries_left: config.max_retries,
            config,
            state,
            queue: VecDeque::new(),
            connecting: None,
            writer: None,
            reader: None,
            retry_at: None,
            on_message: None,
            on_open: None,
            on_close: None,
            stop,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            let event = tokio::select! {
                command = commands.recv() => Event::Command(command),
                result = next_connection(&mut self.connecting) => Event::Connected(result),
                frame = next_frame(&mut self.reader) => Event::Frame(frame),
                () = retry_timer(self.retry_at) => Event::RetryDue,
                () = self.stop.cancelled() => Event::Stopped,
            };

            match event {
                Event::Command(None) => {
                    self.disconnect().await;
                    break;
                }
                Event::Command(Some(command)) => {
                    if !self.handle_command(command).await {
                        break;
                    }
                }
                Event::Connected(result) => {
                    self.connecting = None;
                    match result {
                        Ok(stream) => self.open(stream).await,
                        Err(e) => {
                            warn!("Failed to connect to {}: {}", self.config.url, e);
                            self.connection_lost();
                        }
                    }
                }
                Event::Frame(Some(Ok(message))) => self.handle_frame(message),
                Event::Frame(Some(Err(e))) => {
                    warn!("WebSocket error on {}: {}", self.config.url, e);
                    self.connection_lost();
                }
                Event::Frame(None) => {
                    info!("WebSocket connection to {} closed", self.config.url);
                    self.connection_lost();
                }
                Event::RetryDue => {
                    self.retry_at = None;
                    self.begin_connect();
                }
                Event::Stopped => {
                    info!("Transport to {} stopped", self.config.url);
                    self.disconnect().await;
                    break;
                }
            }
        }

        if !self.queue.is_empty() {
            warn!(
                "Transport shut down with {} undelivered messages",
                self.queue.len()
            );
        }
        debug!("Transport driver stopped");
    }

    /// Returns `false` once the driver should stop
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Connect => match self.current_state() {
                ConnectionState::Disconnected => self.begin_connect(),
                ConnectionState::Failed => {
                    warn!("Retries exhausted for {}, ignoring connect", self.config.url)
                }
                state => info!("Connect requested while {}", state),
            },
            Command::Disconnect => self.disconnect().await,
            Command::Send(message) => self.send(message).await,
            Command::OnMessage(handler) => self.on_message = Some(handler),
            Command::OnOpen(handler) => self.on_open = Some(handler),
            Command::OnClose(handler) => self.on_close = Some(handler),
            Command::Shutdown => {
                self.disconnect().await;
                return false;
            }
        }
        true
    }

    fn begin_connect(&mut self) {
        if self.retries_left == 0 {
            self.fail();
            return;
        }

        self.retries_left -= 1;
        self.retry_at = None;
        self.set_state(ConnectionState::Connecting);

        info!(
            "Connecting to {} ({} attempts left)",
            self.config.url, self.retries_left
        );

        let url = self.config.url.clone();
        self.connecting = Some(Box::pin(async move {
            connect_async(url).await.map(|(stream, _response)| stream)
        }));
    }

    async fn open(&mut self, stream: WsStream) {
        let (writer, reader) = stream.split();
        self.writer = Some(writer);
        self.reader = Some(reader);
        self.retries_left = self.config.max_retries;
        self.set_state(ConnectionState::Open);

        info!("WebSocket connection to {} established", self.config.url);

        if let Some(handler) = &self.on_open {
            handler();
        }

        self.flush().await;
    }

    /// Drain the queue in insertion order. Stops at the first failed write,
    /// leaving that message at the front for the next open.
    async fn flush(&mut self) {
        if self.queue.is_empty() {
            return;
        }

        let pending = self.queue.len();
        debug!("Flushing {} queued messages", pending);

        while let Some(message) = self.queue.pop_front() {
            if let Err(e) = self.write(&message).await {
                warn!("Flush to {} interrupted: {}", self.config.url, e);
                self.queue.push_front(message);
                self.connection_lost();
                return;
            }
        }

        info!("Flushed {} queued messages", pending);
    }

    async fn send(&mut self, message: OutboundMessage) {
        match self.current_state() {
            ConnectionState::Open => {}
            ConnectionState::Failed => {
                debug!("Connection failed, dropping message");
                return;
            }
            _ => {
                self.queue.push_back(message);
                debug!(
                    "Connection not open, queued message ({} pending)",
                    self.queue.len()
                );
                return;
            }
        }

        if let Err(e) = self.write(&message).await {
            warn!("Send to {} failed, requeueing: {}", self.config.url, e);
            self.queue.push_back(message);
            self.connection_lost();
        }
    }

    async fn write(&mut self, message: &OutboundMessage) -> Result<(), tungstenite::Error> {
        let frame = match messages::encode(message) {
            Ok(frame) => frame,
            Err(e) => {
                error!("Dropping message that failed to encode: {}", e);
                return Ok(());
            }
        };

        match &mut self.writer {
            Some(writer) => writer.send(Message::Text(frame.into())).await,
            None => Err(tungstenite::Error::ConnectionClosed),
        }
    }

    fn handle_frame(&mut self, message: Message) {
        match message {
            Message::Text(text) => self.dispatch(text.as_str()),
            Message::Binary(data) => match std::str::from_utf8(&data) {
                Ok(text) => self.dispatch(text),
                Err(e) => warn!("Dropping non UTF-8 binary frame: {}", e),
            },
            Message::Close(frame) => debug!("Server sent close: {:?}", frame),
            _ => {}
        }
    }

    fn dispatch(&self, frame: &str) {
        match messages::decode(frame) {
            Ok(message) => match &self.on_message {
                Some(handler) => handler(message),
                None => debug!("No message handler registered, dropping message"),
            },
            Err(e) => warn!("Error parsing message from server: {}", e),
        }
    }

    /// The socket or connect attempt went away without being asked to
    fn connection_lost(&mut self) {
        self.writer = None;
        self.reader = None;
        self.connecting = None;

        if let Some(handler) = &self.on_close {
            handler();
        }

        if self.retries_left == 0 {
            self.fail();
            return;
        }

        self.set_state(ConnectionState::Disconnected);
        self.retry_at = Some(Instant::now() + self.config.reconnect_interval);

        info!(
            "Reconnecting to {} in {:?}",
            self.config.url, self.config.reconnect_interval
        );
    }

    fn fail(&mut self) {
        error!(
            "Max retries reached for {}, giving up after {} attempts",
            self.config.url, self.config.max_retries
        );
        self.retry_at = None;
        self.set_state(ConnectionState::Failed);

        if !self.queue.is_empty() {
            warn!(
                "Dropping {} undelivered messages for {}",
                self.queue.len(),
                self.config.url
            );
            self.queue.clear();
        }
    }

    async fn disconnect(&mut self) {
        self.retry_at = None;
        self.connecting = None;
        self.reader = None;

        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.close().await {
                debug!("Close handshake with {} failed: {}", self.config.url, e);
            }
            if let Some(handler) = &self.on_close {
                handler();
            }
        }

        if self.current_state() != ConnectionState::Failed {
            self.set_state(ConnectionState::Disconnected);
        }

        info!("Disconnected from {}", self.config.url);
    }

    fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }
}

async fn next_connection(
    connecting: &mut Option<ConnectFuture>,
) -> Result<WsStream, tungstenite::Error> {
    match connecting {
        Some(attempt) => attempt.await,
        None => pending().await,
    }
}

async fn next_frame(
    reader: &mut Option<SplitStream<WsStream>>,
) -> Option<Result<Message, tungstenite::Error>> {
    match reader {
        Some(reader) => reader.next().await,
        None => pending().await,
    }
}

async fn retry_timer(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => pending().await,
    }
}
