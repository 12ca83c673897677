//! WebSocket bridge to a browser shim that embeds the simulator frame.
//!
//! The shim page owns the real `<iframe>`. It opens one WebSocket per frame,
//! announces the frame id, relays every `postMessage` it receives together
//! with the sender's origin, and forwards our posts into the frame. To the rest
//! of the host the bridge is just a [`FrameHost`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use frame_channel::{FrameElement, FrameHost, FrameWindow, RawInbound};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::reconcile::LocationSource;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("bridge io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Messages the shim sends us.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ShimInbound {
    Hello {
        #[serde(rename = "frameId")]
        frame_id: String,
        #[serde(default)]
        location: Option<String>,
    },
    Message {
        origin: String,
        #[serde(default)]
        data: Value,
    },
    Location {
        location: String,
    },
}

/// Messages we send the shim.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ShimOutbound {
    Post {
        #[serde(rename = "targetOrigin")]
        target_origin: String,
        message: Value,
    },
}

pub struct FrameBridge {
    frames: RwLock<HashMap<String, Arc<BridgeFrame>>>,
    inbound: broadcast::Sender<RawInbound>,
    location: RwLock<Option<String>>,
    next_connection: AtomicU64,
}

impl FrameBridge {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            frames: RwLock::new(HashMap::new()),
            inbound: broadcast::channel(256).0,
            location: RwLock::new(None),
            next_connection: AtomicU64::new(1),
        })
    }

    pub async fn bind(addr: &str) -> Result<(Arc<Self>, TcpListener), BridgeError> {
        let listener = TcpListener::bind(addr).await?;
        info!(target: "sim.bridge", addr = %listener.local_addr()?, "frame bridge listening");
        Ok((Self::new(), listener))
    }

    pub fn frame_ids(&self) -> Vec<String> {
        self.frames.read().keys().cloned().collect()
    }

    /// Accept loop. Runs until the listener fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), BridgeError> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let bridge = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(err) = bridge.handle_connection(stream, peer).await {
                    warn!(target: "sim.bridge", peer = %peer, error = %err, "shim connection failed");
                }
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), BridgeError> {
        let ws = tokio_tungstenite::accept_async(stream).await?;
        let connection_id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        debug!(target: "sim.bridge", peer = %peer, connection_id, "shim connected");

        let (mut ws_sender, mut ws_receiver) = ws.split();
        let (tx_out, mut rx_out) = mpsc::unbounded_channel::<String>();
        let send_task = tokio::spawn(async move {
            while let Some(text) = rx_out.recv().await {
                if ws_sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        let mut bound: Option<Arc<BridgeFrame>> = None;
        while let Some(message) = ws_receiver.next().await {
            let text = match message {
                Ok(Message::Text(text)) => text,
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(_) => continue,
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(err) => {
                    debug!(target: "sim.bridge", connection_id, error = %err, "shim read failed");
                    break;
                }
            };
            match serde_json::from_str::<ShimInbound>(&text) {
                Ok(ShimInbound::Hello { frame_id, location }) => {
                    if let Some(location) = location {
                        *self.location.write() = Some(location);
                    }
                    let frame = BridgeFrame::new(&frame_id, connection_id, tx_out.clone());
                    if let Some(previous) = self.frames.write().insert(frame_id.clone(), Arc::clone(&frame)) {
                        previous.window.close();
                    }
                    if let Some(stale) = bound.replace(frame) {
                        self.release(&stale);
                    }
                    info!(target: "sim.bridge", frame_id = %frame_id, connection_id, "frame announced");
                }
                Ok(ShimInbound::Message { origin, data }) => {
                    let _ = self.inbound.send(RawInbound { origin, data });
                }
                Ok(ShimInbound::Location { location }) => {
                    *self.location.write() = Some(location);
                }
                Err(err) => {
                    debug!(target: "sim.bridge", connection_id, error = %err, "ignoring malformed shim message");
                }
            }
        }

        if let Some(frame) = bound {
            self.release(&frame);
        }
        send_task.abort();
        debug!(target: "sim.bridge", connection_id, "shim disconnected");
        Ok(())
    }

    /// Unmounts `frame` unless a newer connection already replaced it.
    fn release(&self, frame: &Arc<BridgeFrame>) {
        frame.window.close();
        let mut frames = self.frames.write();
        if frames
            .get(&frame.element_id)
            .is_some_and(|current| current.connection_id == frame.connection_id)
        {
            frames.remove(&frame.element_id);
            info!(target: "sim.bridge", frame_id = %frame.element_id, "frame gone");
        }
    }
}

impl FrameHost for FrameBridge {
    fn find_element(&self, element_id: &str) -> Option<Arc<dyn FrameElement>> {
        self.frames
            .read()
            .get(element_id)
            .map(|frame| Arc::clone(frame) as Arc<dyn FrameElement>)
    }

    fn inbound(&self) -> broadcast::Receiver<RawInbound> {
        self.inbound.subscribe()
    }
}

impl LocationSource for FrameBridge {
    fn current_location(&self) -> Option<String> {
        self.location.read().clone()
    }
}

struct BridgeFrame {
    element_id: String,
    connection_id: u64,
    window: Arc<BridgeWindow>,
}

impl BridgeFrame {
    fn new(element_id: &str, connection_id: u64, outbound: mpsc::UnboundedSender<String>) -> Arc<Self> {
        Arc::new(Self {
            element_id: element_id.to_string(),
            connection_id,
            window: Arc::new(BridgeWindow {
                outbound,
                open: AtomicBool::new(true),
            }),
        })
    }
}

impl FrameElement for BridgeFrame {
    fn element_id(&self) -> &str {
        &self.element_id
    }

    fn content_window(&self) -> Option<Arc<dyn FrameWindow>> {
        if self.window.is_open() {
            Some(Arc::clone(&self.window) as Arc<dyn FrameWindow>)
        } else {
            None
        }
    }
}

struct BridgeWindow {
    outbound: mpsc::UnboundedSender<String>,
    open: AtomicBool,
}

impl BridgeWindow {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.outbound.is_closed()
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

impl FrameWindow for BridgeWindow {
    fn post_message(&self, message: Value, target_origin: &str) -> Result<(), String> {
        if !self.is_open() {
            return Err("frame window closed".into());
        }
        let text = serde_json::to_string(&ShimOutbound::Post {
            target_origin: target_origin.to_string(),
            message,
        })
        .map_err(|err| err.to_string())?;
        self.outbound.send(text).map_err(|_| "shim connection closed".to_string())
    }
}
