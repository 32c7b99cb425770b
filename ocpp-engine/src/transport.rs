//! Text-message transports a session runs over
//!
//! The session only needs three operations from a connection, so every
//! socket flavour is wrapped behind [`Transport`]:
//! - [`WsTransport`]: any tokio-tungstenite WebSocket stream, server-accepted
//!   or client-connected
//! - [`ChannelTransport`]: an in-process duplex pair, for embedding behind
//!   another socket owner and for tests
//!
//! One sender and one receiver may use a transport concurrently; the send and
//! receive halves are locked independently.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::OcppError;

/// Duplex text-message channel
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one logical message
    async fn send(&self, text: String) -> Result<(), OcppError>;

    /// Wait for the next message; `Err(ConnectionClosed)` once the peer is gone
    async fn receive(&self) -> Result<String, OcppError>;

    /// Close the connection. Repeated calls are no-ops.
    async fn close(&self) -> Result<(), OcppError>;
}

/// WebSocket transport over a split tokio-tungstenite stream
pub struct WsTransport<S> {
    sink: Mutex<SplitSink<WebSocketStream<S>, Message>>,
    stream: Mutex<SplitStream<WebSocketStream<S>>>,
    closed: AtomicBool,
}

impl<S> WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(ws: WebSocketStream<S>) -> Self {
        let (sink, stream) = ws.split();
        Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl<S> Transport for WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&self, text: String) -> Result<(), OcppError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(OcppError::ConnectionClosed);
        }

        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn receive(&self) -> Result<String, OcppError> {
        let mut stream = self.stream.lock().await;

        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(text.to_string()),
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => return Ok(text),
                    Err(_) => warn!("Dropping non UTF-8 binary frame ({} bytes)", data.len()),
                },
                Some(Ok(Message::Close(frame))) => {
                    debug!("WebSocket closed by peer: {:?}", frame);
                    return Err(OcppError::ConnectionClosed);
                }
                // Ping/pong are answered by tungstenite itself
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
                None => return Err(OcppError::ConnectionClosed),
            }
        }
    }

    async fn close(&self) -> Result<(), OcppError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut sink = self.sink.lock().await;
        match sink.close().await {
            Ok(()) => Ok(()),
            Err(e) => match OcppError::from(e) {
                OcppError::ConnectionClosed => Ok(()),
                other => Err(other),
            },
        }
    }
}

/// One end of an in-process duplex channel
///
/// Closing either end closes the link for both; messages already queued
/// are still delivered before `receive` reports the closure.
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<String>,
    rx: Mutex<mpsc::UnboundedReceiver<String>>,
    link: CancellationToken,
}

impl ChannelTransport {
    /// Create two connected ends
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let link = CancellationToken::new();

        let a = Self {
            tx: b_tx,
            rx: Mutex::new(a_rx),
            link: link.clone(),
        };
        let b = Self {
            tx: a_tx,
            rx: Mutex::new(b_rx),
            link,
        };
        (a, b)
    }

    pub fn is_closed(&self) -> bool {
        self.link.is_cancelled()
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, text: String) -> Result<(), OcppError> {
        if self.link.is_cancelled() {
            return Err(OcppError::ConnectionClosed);
        }
        self.tx.send(text).map_err(|_| OcppError::ConnectionClosed)
    }

    async fn receive(&self) -> Result<String, OcppError> {
        let mut rx = self.rx.lock().await;

        tokio::select! {
            biased;
            msg = rx.recv() => msg.ok_or(OcppError::ConnectionClosed),
            _ = self.link.cancelled() => Err(OcppError::ConnectionClosed),
        }
    }

    async fn close(&self) -> Result<(), OcppError> {
        self.link.cancel();
        Ok(())
    }
}
