// Integration tests for the realtime transport client
//
// Each test runs a local WebSocket server on 127.0.0.1 and drives the
// client through connect, queue flush, inbound dispatch, reconnect and
// retry exhaustion.

use anyhow::{bail, Result};
use futures::{SinkExt, StreamExt};
use loqa_realtime::realtime::ClientFrame;
use loqa_realtime::{
    ChunkStreamer, ConnectionState, InboundMessage, MemorySource, OutboundMessage, StreamError,
    StreamerConfig, TransportClient, TransportConfig, TransportError,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tokio_util::sync::CancellationToken;

const STEP: Duration = Duration::from_secs(5);

async fn server() -> Result<(TcpListener, String)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let url = format!("ws://{}/session", listener.local_addr()?);
    Ok((listener, url))
}

async fn accept(listener: &TcpListener) -> Result<WebSocketStream<TcpStream>> {
    let (stream, _) = timeout(STEP, listener.accept()).await??;
    Ok(accept_async(stream).await?)
}

async fn next_client_frame(ws: &mut WebSocketStream<TcpStream>) -> Result<ClientFrame> {
    loop {
        match timeout(STEP, ws.next()).await? {
            Some(Ok(Message::Text(text))) => return Ok(serde_json::from_str(text.as_str())?),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
            None => bail!("client closed the connection"),
        }
    }
}

fn text_frame(data: &str) -> ClientFrame {
    ClientFrame::Text {
        data: data.to_string(),
    }
}

fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + 'static) {
    let count = Arc::new(AtomicUsize::new(0));
    let handle = Arc::clone(&count);
    (count, move || {
        handle.fetch_add(1, Ordering::SeqCst);
    })
}

/// Port with nothing listening on it
async fn closed_port_url() -> Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    drop(listener);
    Ok(format!("ws://{}/session", addr))
}

#[tokio::test]
async fn test_queued_messages_flush_in_order() -> Result<()> {
    let (listener, url) = server().await?;
    let client = TransportClient::new(TransportConfig::new(url));

    client.send_text("first")?;
    client.send(OutboundMessage::audio(vec![1, 2, 3]))?;
    client.send_text("second")?;
    assert_eq!(client.state(), ConnectionState::Disconnected);

    client.connect()?;
    // Sent while the connection is still being established
    client.send_text("third")?;

    let mut ws = accept(&listener).await?;
    assert_eq!(next_client_frame(&mut ws).await?, text_frame("first"));
    assert_eq!(
        next_client_frame(&mut ws).await?,
        ClientFrame::Audio {
            data: Some("AQID".to_string()),
            commit: None
        }
    );
    assert_eq!(next_client_frame(&mut ws).await?, text_frame("second"));
    assert_eq!(next_client_frame(&mut ws).await?, text_frame("third"));

    timeout(STEP, client.wait_for(ConnectionState::Open)).await??;
    client.send_text("fourth")?;
    assert_eq!(next_client_frame(&mut ws).await?, text_frame("fourth"));

    client.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_connect_is_idempotent() -> Result<()> {
    let (listener, url) = server().await?;
    let client = TransportClient::new(TransportConfig::new(url));
    let (opens, on_open) = counter();
    client.on_open(on_open)?;

    client.connect()?;
    client.connect()?;
    let _ws = accept(&listener).await?;
    timeout(STEP, client.wait_for(ConnectionState::Open)).await??;
    client.connect()?;

    // No second connection is attempted
    assert!(timeout(Duration::from_millis(300), listener.accept())
        .await
        .is_err());
    assert_eq!(opens.load(Ordering::SeqCst), 1);

    client.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_inbound_messages_dispatch_and_malformed_frames_drop() -> Result<()> {
    let (listener, url) = server().await?;
    let client = TransportClient::new(TransportConfig::new(url));

    let (tx, mut rx) = mpsc::unbounded_channel();
    client.on_message(move |message| {
        let _ = tx.send(message);
    })?;
    client.connect()?;

    let mut ws = accept(&listener).await?;
    timeout(STEP, client.wait_for(ConnectionState::Open)).await??;

    for frame in [
        "garbage",
        r#"{"type":"text"}"#,
        r#"{"type":"audio","data":"%%%"}"#,
        r#"{"type":"hologram","data":"x"}"#,
        r#"{"type":"text","data":"hello"}"#,
        r#"{"type":"audio","data":"AQID"}"#,
        r#"{"type":"audio_done"}"#,
        r#"{"type":"error","message":"slow down"}"#,
    ] {
        ws.send(Message::Text(frame.to_string().into())).await?;
    }

    let mut received = Vec::new();
    for _ in 0..4 {
        received.push(timeout(STEP, rx.recv()).await?.expect("handler channel open"));
    }
    assert_eq!(
        received,
        vec![
            InboundMessage::Text {
                body: "hello".to_string()
            },
            InboundMessage::Audio {
                payload: vec![1, 2, 3]
            },
            InboundMessage::AudioDone,
            InboundMessage::Error {
                detail: "slow down".to_string()
            },
        ]
    );
    assert_eq!(client.state(), ConnectionState::Open);

    client.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_message_handler_is_replaced() -> Result<()> {
    let (listener, url) = server().await?;
    let client = TransportClient::new(TransportConfig::new(url));

    let (first_tx, mut first_rx) = mpsc::unbounded_channel();
    client.on_message(move |message| {
        let _ = first_tx.send(message);
    })?;
    let (second_tx, mut second_rx) = mpsc::unbounded_channel();
    client.on_message(move |message| {
        let _ = second_tx.send(message);
    })?;
    client.connect()?;

    let mut ws = accept(&listener).await?;
    ws.send(Message::Text(r#"{"type":"text","data":"hi"}"#.to_string().into()))
        .await?;

    let message = timeout(STEP, second_rx.recv()).await?;
    assert_eq!(
        message,
        Some(InboundMessage::Text {
            body: "hi".to_string()
        })
    );
    // The first handler was dropped when replaced
    assert_eq!(first_rx.recv().await, None);

    client.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_retries_exhausted_enters_failed() -> Result<()> {
    let url = closed_port_url().await?;
    let client = TransportClient::new(
        TransportConfig::new(url)
            .with_reconnect_interval(Duration::from_millis(20))
            .with_max_retries(3),
    );
    let (closes, on_close) = counter();
    client.on_close(on_close)?;
    client.send_text("never delivered")?;
    client.connect()?;

    let err = timeout(STEP, client.failed()).await?;
    assert_eq!(err, TransportError::RetriesExhausted { attempts: 3 });
    assert_eq!(closes.load(Ordering::SeqCst), 3);

    // Nothing further is scheduled, and connect() no longer revives it
    client.connect()?;
    sleep(Duration::from_millis(150)).await;
    assert_eq!(client.state(), ConnectionState::Failed);
    assert_eq!(closes.load(Ordering::SeqCst), 3);

    // A failed client refuses sends instead of queueing them
    assert_eq!(
        client.send_text("never delivered either"),
        Err(TransportError::RetriesExhausted { attempts: 3 })
    );

    client.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_streaming_into_failed_client_ends_run() -> Result<()> {
    let url = closed_port_url().await?;
    let client = TransportClient::new(
        TransportConfig::new(url)
            .with_reconnect_interval(Duration::from_millis(20))
            .with_max_retries(2),
    );
    client.connect()?;
    timeout(STEP, client.failed()).await?;

    let source = MemorySource::finished_with(&vec![0u8; 100_000]);
    let streamer = ChunkStreamer::new(
        StreamerConfig::new(1024, Duration::from_millis(1)).with_start_delay(Duration::ZERO),
    );
    let err = timeout(STEP, streamer.run(&source, &client.sender()))
        .await?
        .unwrap_err();
    assert!(matches!(
        err,
        StreamError::SinkClosed(TransportError::RetriesExhausted { attempts: 2 })
    ));

    client.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_retry_budget_resets_after_each_open() -> Result<()> {
    let (listener, url) = server().await?;
    let client = TransportClient::new(
        TransportConfig::new(url)
            .with_reconnect_interval(Duration::from_millis(20))
            .with_max_retries(2),
    );
    let (open_tx, mut open_rx) = mpsc::unbounded_channel();
    client.on_open(move || {
        let _ = open_tx.send(());
    })?;
    client.connect()?;

    // Without the reset, the third drop would exhaust a budget of two
    for _ in 0..3 {
        let mut ws = accept(&listener).await?;
        timeout(STEP, open_rx.recv()).await?;
        ws.close(None).await?;
        drop(ws);
    }

    let _ws = accept(&listener).await?;
    timeout(STEP, open_rx.recv()).await?;
    timeout(STEP, client.wait_for(ConnectionState::Open)).await??;
    assert_eq!(client.state(), ConnectionState::Open);

    client.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_stop_token_shuts_driver_down() -> Result<()> {
    let (listener, url) = server().await?;
    let stop = CancellationToken::new();
    let client = TransportClient::with_stop(TransportConfig::new(url), stop.clone());
    client.connect()?;

    let mut ws = accept(&listener).await?;
    timeout(STEP, client.wait_for(ConnectionState::Open)).await??;
    stop.cancel();

    loop {
        match timeout(STEP, ws.next()).await? {
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
            Some(Ok(_)) => continue,
        }
    }
    timeout(STEP, client.wait_for(ConnectionState::Failed))
        .await?
        .unwrap_err();
    assert_eq!(client.send_text("late"), Err(TransportError::Shutdown));

    client.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_disconnect_cancels_pending_reconnect() -> Result<()> {
    let (listener, url) = server().await?;
    let client = TransportClient::new(
        TransportConfig::new(url).with_reconnect_interval(Duration::from_millis(200)),
    );

    let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
    client.on_close(move || {
        let _ = closed_tx.send(());
    })?;
    client.connect()?;

    let mut ws = accept(&listener).await?;
    ws.close(None).await?;
    drop(ws);

    timeout(STEP, closed_rx.recv()).await?;
    client.disconnect()?;

    // The reconnect would have fired after 200ms
    assert!(timeout(Duration::from_millis(600), listener.accept())
        .await
        .is_err());
    assert_eq!(client.state(), ConnectionState::Disconnected);

    client.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_disconnect_from_open_does_not_reconnect() -> Result<()> {
    let (listener, url) = server().await?;
    let client = TransportClient::new(
        TransportConfig::new(url).with_reconnect_interval(Duration::from_millis(50)),
    );
    let (closes, on_close) = counter();
    client.on_close(on_close)?;
    client.connect()?;

    let mut ws = accept(&listener).await?;
    timeout(STEP, client.wait_for(ConnectionState::Open)).await??;
    client.disconnect()?;

    // Server sees the close frame
    loop {
        match timeout(STEP, ws.next()).await? {
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
            Some(Ok(_)) => continue,
        }
    }

    assert!(timeout(Duration::from_millis(300), listener.accept())
        .await
        .is_err());
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(closes.load(Ordering::SeqCst), 1);

    // Messages queue again and go out on an explicit reconnect
    client.send_text("after reconnect")?;
    client.connect()?;
    let mut ws = accept(&listener).await?;
    assert_eq!(
        next_client_frame(&mut ws).await?,
        text_frame("after reconnect")
    );

    client.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_reconnect_does_not_reflush_sent_messages() -> Result<()> {
    let (listener, url) = server().await?;
    let client = TransportClient::new(
        TransportConfig::new(url).with_reconnect_interval(Duration::from_millis(50)),
    );

    let (open_tx, mut open_rx) = mpsc::unbounded_channel();
    client.on_open(move || {
        let _ = open_tx.send(());
    })?;
    let (closes, on_close) = counter();
    client.on_close(on_close)?;

    client.send_text("one")?;
    client.send_text("two")?;
    client.connect()?;

    let mut first = accept(&listener).await?;
    timeout(STEP, open_rx.recv()).await?;
    assert_eq!(next_client_frame(&mut first).await?, text_frame("one"));
    assert_eq!(next_client_frame(&mut first).await?, text_frame("two"));
    first.close(None).await?;
    drop(first);

    let mut second = accept(&listener).await?;
    timeout(STEP, open_rx.recv()).await?;
    assert_eq!(closes.load(Ordering::SeqCst), 1);

    client.send_text("three")?;
    assert_eq!(next_client_frame(&mut second).await?, text_frame("three"));

    client.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_shutdown_stops_sender_handles() -> Result<()> {
    let (_listener, url) = server().await?;
    let client = TransportClient::new(TransportConfig::new(url));
    let sender = client.sender();

    client.shutdown().await;

    let err = loqa_realtime::OutboundSink::send(&sender, OutboundMessage::text("late"));
    assert_eq!(err, Err(TransportError::Shutdown));

    Ok(())
}
