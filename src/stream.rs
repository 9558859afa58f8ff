/// stream.rs – WebSocket transport for the session stream and chat.
///
/// A connection is a pair of channel ends:
///  - `StreamHandle` is what the session side holds (events in, text out, close)
///  - `StreamRemote` is driven by the socket task (or by a test double)
///
/// Dropping the `StreamControl` closes the socket, so an owner that replaces
/// its handle never leaves the previous connection open.
use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::api::require;
use crate::config::BackendConfig;
use crate::error::ClientError;

const EVENT_BUFFER: usize = 512;
const OUTBOUND_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Opened,
    /// One text frame, unparsed.
    Frame(String),
    Closed,
    Error(String),
}

// ---------------------------------------------------------------------------
// Channel ends
// ---------------------------------------------------------------------------

/// Write/close side of a connection.
#[derive(Debug)]
pub struct StreamControl {
    outbound: mpsc::Sender<String>,
    close_tx: Option<oneshot::Sender<()>>,
}

impl StreamControl {
    pub fn send_text(&self, text: impl Into<String>) -> Result<(), ClientError> {
        self.outbound
            .try_send(text.into())
            .map_err(|_| ClientError::NotConnected)
    }

    pub fn close(mut self) {
        if let Some(tx) = self.close_tx.take() {
            let _ = tx.send(());
        }
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

#[derive(Debug)]
pub struct StreamHandle {
    pub events: mpsc::Receiver<StreamEvent>,
    pub control: StreamControl,
}

impl StreamHandle {
    pub fn split(self) -> (StreamControl, mpsc::Receiver<StreamEvent>) {
        (self.control, self.events)
    }
}

/// The socket-facing end of a connection.
#[derive(Debug)]
pub struct StreamRemote {
    pub events: mpsc::Sender<StreamEvent>,
    pub outbound: mpsc::Receiver<String>,
    pub closed: oneshot::Receiver<()>,
}

impl StreamRemote {
    /// True once the owner closed or dropped its `StreamControl`.
    pub fn close_requested(&mut self) -> bool {
        !matches!(
            self.closed.try_recv(),
            Err(oneshot::error::TryRecvError::Empty)
        )
    }
}

/// A connected pair of channel ends.
pub fn stream_pair() -> (StreamHandle, StreamRemote) {
    let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
    let (out_tx, out_rx) = mpsc::channel(OUTBOUND_BUFFER);
    let (close_tx, close_rx) = oneshot::channel();
    (
        StreamHandle {
            events: event_rx,
            control: StreamControl {
                outbound: out_tx,
                close_tx: Some(close_tx),
            },
        },
        StreamRemote {
            events: event_tx,
            outbound: out_rx,
            closed: close_rx,
        },
    )
}

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

/// Opens stream connections. Returns immediately; `Opened` or `Error`
/// arrives on the event channel once the socket settles.
pub trait StreamConnector: Send + Sync {
    fn session_stream(&self, session_id: &str) -> Result<StreamHandle, ClientError>;

    fn chat_stream(&self) -> Result<StreamHandle, ClientError>;
}

#[derive(Debug, Clone)]
pub struct WsConnector {
    ws_base_url: String,
    sim_base_path: String,
}

impl WsConnector {
    pub fn new(backend: &BackendConfig) -> Self {
        Self {
            ws_base_url: backend.ws_base_url(),
            sim_base_path: backend.sim_base_path.clone(),
        }
    }

    pub fn session_url(&self, session_id: &str) -> Result<String, ClientError> {
        require("session_id", session_id)?;
        Ok(format!(
            "{}{}/stream/{}",
            self.ws_base_url, self.sim_base_path, session_id
        ))
    }

    pub fn chat_url(&self) -> String {
        format!("{}/ws/chat", self.ws_base_url)
    }
}

impl StreamConnector for WsConnector {
    fn session_stream(&self, session_id: &str) -> Result<StreamHandle, ClientError> {
        let url = self.session_url(session_id)?;
        Ok(spawn_socket(url))
    }

    fn chat_stream(&self) -> Result<StreamHandle, ClientError> {
        Ok(spawn_socket(self.chat_url()))
    }
}

fn spawn_socket(url: String) -> StreamHandle {
    let (handle, remote) = stream_pair();
    tokio::spawn(async move {
        let StreamRemote {
            events,
            mut outbound,
            closed,
        } = remote;
        match ws_run(&url, &events, &mut outbound, closed).await {
            Ok(()) => info!("WebSocket closed: {url}"),
            Err(e) => {
                warn!("WebSocket error on {url}: {e:#}");
                let _ = events.send(StreamEvent::Error(format!("{e:#}"))).await;
            }
        }
        let _ = events.send(StreamEvent::Closed).await;
    });
    handle
}

async fn ws_run(
    url: &str,
    events: &mpsc::Sender<StreamEvent>,
    outbound: &mut mpsc::Receiver<String>,
    mut closed: oneshot::Receiver<()>,
) -> Result<()> {
    info!("Connecting to WebSocket: {url}");
    let (ws, _) = connect_async(url).await.context("WebSocket connect")?;
    let (mut sink, mut stream) = ws.split();
    let _ = events.send(StreamEvent::Opened).await;

    loop {
        tokio::select! {
            // Explicit close or the owner dropped its control
            _ = &mut closed => {
                sink.send(Message::Close(None)).await.ok();
                break;
            }
            Some(text) = outbound.recv() => {
                sink.send(Message::Text(text)).await.context("WebSocket send")?;
            }
            msg = stream.next() => {
                let Some(msg) = msg else { break };
                match msg.context("WebSocket read error")? {
                    Message::Text(text) => {
                        if events.send(StreamEvent::Frame(text)).await.is_err() {
                            debug!("Stream owner gone; closing {url}");
                            break;
                        }
                    }
                    Message::Ping(data) => {
                        sink.send(Message::Pong(data)).await.ok();
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }
    Ok(())
}
