use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::broadcast;

/// Raw cross-document message as delivered by the embedding page.
#[derive(Debug, Clone, PartialEq)]
pub struct RawInbound {
    pub origin: String,
    pub data: Value,
}

/// The document that hosts simulator frames.
pub trait FrameHost: Send + Sync {
    /// Looks up a frame element by id. `None` while the element is not mounted.
    fn find_element(&self, element_id: &str) -> Option<Arc<dyn FrameElement>>;

    /// Stream of every message posted to the host document, from any frame.
    fn inbound(&self) -> broadcast::Receiver<RawInbound>;
}

pub trait FrameElement: Send + Sync {
    fn element_id(&self) -> &str;

    /// The frame's inner window. `None` until the frame has booted.
    fn content_window(&self) -> Option<Arc<dyn FrameWindow>>;
}

pub trait FrameWindow: Send + Sync {
    fn post_message(&self, message: Value, target_origin: &str) -> Result<(), String>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct PostedMessage {
    pub message: Value,
    pub target_origin: String,
}

/// In-memory frame host for tests and loopback wiring.
pub struct LocalFrameHost {
    elements: RwLock<HashMap<String, Arc<LocalFrame>>>,
    inbound: broadcast::Sender<RawInbound>,
    lookups: AtomicUsize,
}

impl Default for LocalFrameHost {
    fn default() -> Self {
        Self {
            elements: RwLock::new(HashMap::new()),
            inbound: broadcast::channel(64).0,
            lookups: AtomicUsize::new(0),
        }
    }
}

impl LocalFrameHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Mounts (or replaces) a frame element with a live window.
    pub fn mount(&self, element_id: &str) -> Arc<LocalFrame> {
        let frame = Arc::new(LocalFrame::new(element_id));
        self.elements
            .write()
            .insert(element_id.to_string(), Arc::clone(&frame));
        frame
    }

    pub fn unmount(&self, element_id: &str) -> Option<Arc<LocalFrame>> {
        self.elements.write().remove(element_id)
    }

    /// Posts a message to the host document as if it came from `origin`.
    pub fn deliver(&self, origin: &str, data: Value) -> usize {
        self.inbound
            .send(RawInbound {
                origin: origin.to_string(),
                data,
            })
            .unwrap_or(0)
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

impl FrameHost for LocalFrameHost {
    fn find_element(&self, element_id: &str) -> Option<Arc<dyn FrameElement>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.elements
            .read()
            .get(element_id)
            .map(|frame| Arc::clone(frame) as Arc<dyn FrameElement>)
    }

    fn inbound(&self) -> broadcast::Receiver<RawInbound> {
        self.inbound.subscribe()
    }
}

pub struct LocalFrame {
    element_id: String,
    window: Arc<LocalWindow>,
}

impl LocalFrame {
    fn new(element_id: &str) -> Self {
        Self {
            element_id: element_id.to_string(),
            window: Arc::new(LocalWindow {
                live: AtomicBool::new(true),
                posted: Mutex::new(Vec::new()),
                taps: broadcast::channel(64).0,
            }),
        }
    }

    pub fn set_window_live(&self, live: bool) {
        self.window.live.store(live, Ordering::SeqCst);
    }

    pub fn posted(&self) -> Vec<PostedMessage> {
        self.window.posted.lock().clone()
    }

    /// Messages posted into this frame from now on.
    pub fn watch_posts(&self) -> broadcast::Receiver<PostedMessage> {
        self.window.taps.subscribe()
    }
}

impl FrameElement for LocalFrame {
    fn element_id(&self) -> &str {
        &self.element_id
    }

    fn content_window(&self) -> Option<Arc<dyn FrameWindow>> {
        if self.window.live.load(Ordering::SeqCst) {
            Some(Arc::clone(&self.window) as Arc<dyn FrameWindow>)
        } else {
            None
        }
    }
}

struct LocalWindow {
    live: AtomicBool,
    posted: Mutex<Vec<PostedMessage>>,
    taps: broadcast::Sender<PostedMessage>,
}

impl FrameWindow for LocalWindow {
    fn post_message(&self, message: Value, target_origin: &str) -> Result<(), String> {
        if !self.live.load(Ordering::SeqCst) {
            return Err("window closed".into());
        }
        let posted = PostedMessage {
            message,
            target_origin: target_origin.to_string(),
        };
        self.posted.lock().push(posted.clone());
        let _ = self.taps.send(posted);
        Ok(())
    }
}
