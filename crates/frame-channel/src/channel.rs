use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use sim_proto::{Envelope, EventKind, HostCommand, SimulatorEvent};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::frame::{FrameElement, FrameHost, FrameWindow, RawInbound};
use crate::registry::{Handler, HandlerRegistry};
use crate::{ChannelError, ChannelResult};

pub const DEFAULT_ELEMENT_ID: &str = "robot-game-iframe";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub const fn new(max_retries: u32, delay: Duration) -> Self {
        Self { max_retries, delay }
    }

    pub const fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Origins whose messages are accepted; everything else is dropped.
    pub allowed_origins: Vec<String>,
    /// Origin passed along with every outbound post.
    pub target_origin: String,
    /// Element used when `send` has to auto-connect.
    pub default_element_id: String,
    /// Tag written into outbound envelopes.
    pub host_source: String,
    /// Tag inbound envelopes must carry.
    pub peer_source: String,
    pub attach_retry: RetryPolicy,
    pub window_retry: RetryPolicy,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec![
                "http://localhost:5173".to_string(),
                "https://phaser-map-three.vercel.app".to_string(),
            ],
            target_origin: "*".to_string(),
            default_element_id: DEFAULT_ELEMENT_ID.to_string(),
            host_source: sim_proto::HOST_SOURCE.to_string(),
            peer_source: sim_proto::SIMULATOR_SOURCE.to_string(),
            attach_retry: RetryPolicy::new(10, Duration::from_millis(200)),
            window_retry: RetryPolicy::new(3, Duration::from_millis(300)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    /// The channel bound to a new element.
    Attached,
    /// The element was already bound; nothing changed.
    Unchanged,
}

#[derive(Default)]
struct Binding {
    element_id: Option<String>,
    element: Option<Arc<dyn FrameElement>>,
    connected: bool,
}

/// Connection to a single simulator frame.
pub struct CommunicationChannel {
    host: Arc<dyn FrameHost>,
    config: ChannelConfig,
    binding: Mutex<Binding>,
    registry: HandlerRegistry,
    pump: OnceLock<JoinHandle<()>>,
}

impl CommunicationChannel {
    pub fn new(host: Arc<dyn FrameHost>, config: ChannelConfig) -> Arc<Self> {
        Arc::new(Self {
            host,
            config,
            binding: Mutex::new(Binding::default()),
            registry: HandlerRegistry::new(),
            pump: OnceLock::new(),
        })
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.binding.lock().connected
    }

    pub fn element_id(&self) -> Option<String> {
        self.binding.lock().element_id.clone()
    }

    /// Binds to `element_id`, polling the frame host until the element shows up.
    pub async fn attach(
        &self,
        element_id: &str,
        policy: RetryPolicy,
    ) -> ChannelResult<AttachOutcome> {
        let mut retries = 0;
        loop {
            if let Some(element) = self.host.find_element(element_id) {
                return Ok(self.bind(element_id, element, retries));
            }
            if retries >= policy.max_retries {
                warn!(
                    target: "sim.channel",
                    element_id,
                    attempts = retries + 1,
                    "frame element not found"
                );
                return Err(ChannelError::ElementNotFound {
                    element_id: element_id.to_string(),
                    attempts: retries + 1,
                });
            }
            retries += 1;
            debug!(
                target: "sim.channel",
                element_id,
                retry = retries,
                max_retries = policy.max_retries,
                "frame element not found, retrying"
            );
            sleep(policy.delay).await;
        }
    }

    fn bind(&self, element_id: &str, element: Arc<dyn FrameElement>, retries: u32) -> AttachOutcome {
        let mut binding = self.binding.lock();
        let unchanged = binding.connected
            && binding.element_id.as_deref() == Some(element_id)
            && binding
                .element
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, &element));
        binding.element_id = Some(element_id.to_string());
        binding.element = Some(element);
        binding.connected = true;
        drop(binding);

        if unchanged {
            debug!(target: "sim.channel", element_id, "frame already attached");
            AttachOutcome::Unchanged
        } else {
            info!(target: "sim.channel", element_id, retries, "frame attached");
            AttachOutcome::Attached
        }
    }

    /// Re-attaches to the last known element when the current binding went stale.
    pub async fn refresh(&self) -> ChannelResult<AttachOutcome> {
        let (element_id, element) = {
            let binding = self.binding.lock();
            (binding.element_id.clone(), binding.element.clone())
        };
        let Some(element_id) = element_id else {
            return Err(ChannelError::ElementNotFound {
                element_id: self.config.default_element_id.clone(),
                attempts: 0,
            });
        };
        let stale = match (&element, self.host.find_element(&element_id)) {
            (Some(current), Some(found)) => {
                !Arc::ptr_eq(current, &found) || current.content_window().is_none()
            }
            _ => true,
        };
        if !stale {
            return Ok(AttachOutcome::Unchanged);
        }
        debug!(target: "sim.channel", element_id = %element_id, "refreshing stale frame binding");
        self.binding.lock().connected = false;
        self.attach(&element_id, self.config.attach_retry).await
    }

    /// Posts a command into the frame.
    pub async fn send(&self, command: &HostCommand) -> ChannelResult<()> {
        if !self.is_connected() {
            let element_id = self
                .element_id()
                .unwrap_or_else(|| self.config.default_element_id.clone());
            warn!(
                target: "sim.channel",
                element_id = %element_id,
                command = command.name(),
                "send on detached channel; auto-connecting"
            );
            self.attach(&element_id, RetryPolicy::none()).await?;
        }

        let window = self.acquire_window().await?;
        let envelope = command
            .to_envelope(&self.config.host_source)
            .map_err(|err| ChannelError::Encode(err.to_string()))?;
        window
            .post_message(envelope, &self.config.target_origin)
            .map_err(|reason| ChannelError::Delivery {
                command: command.name(),
                reason,
            })?;
        debug!(target: "sim.channel", command = command.name(), "command posted");
        Ok(())
    }

    async fn acquire_window(&self) -> ChannelResult<Arc<dyn FrameWindow>> {
        let policy = self.config.window_retry;
        let mut attempts = 0;
        loop {
            let (element_id, element) = {
                let binding = self.binding.lock();
                (binding.element_id.clone(), binding.element.clone())
            };
            if let Some(window) = element.as_ref().and_then(|element| element.content_window()) {
                return Ok(window);
            }
            if attempts >= policy.max_retries {
                return Err(ChannelError::TargetUnavailable { attempts });
            }

            // The embedding page may have re-rendered the frame under the same id.
            if let Some(element_id) = element_id {
                if let Some(found) = self.host.find_element(&element_id) {
                    if let Some(window) = found.content_window() {
                        let mut binding = self.binding.lock();
                        if binding.element_id.as_deref() == Some(element_id.as_str()) {
                            binding.element = Some(found);
                        }
                        return Ok(window);
                    }
                }
            }

            attempts += 1;
            warn!(
                target: "sim.channel",
                attempt = attempts,
                max_attempts = policy.max_retries,
                "frame window not available"
            );
            sleep(policy.delay).await;
        }
    }

    pub fn on(&self, kind: EventKind, handler: &Handler) -> bool {
        self.registry.add(kind, handler)
    }

    pub fn off(&self, kind: EventKind, handler: &Handler) -> bool {
        self.registry.remove(kind, handler)
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.registry.len(kind)
    }

    /// Validates and dispatches one raw inbound message. Returns how many handlers ran.
    pub fn dispatch_raw(&self, raw: RawInbound) -> usize {
        if !self
            .config
            .allowed_origins
            .iter()
            .any(|allowed| allowed == &raw.origin)
        {
            debug!(target: "sim.channel", origin = %raw.origin, "dropping message from unlisted origin");
            return 0;
        }
        let envelope = match Envelope::from_value(raw.data) {
            Ok(envelope) => envelope,
            Err(err) => {
                debug!(target: "sim.channel", origin = %raw.origin, error = %err, "dropping non-envelope message");
                return 0;
            }
        };
        if envelope.source != self.config.peer_source {
            debug!(
                target: "sim.channel",
                source = %envelope.source,
                kind = %envelope.kind,
                "dropping message with foreign source tag"
            );
            return 0;
        }
        let event = match SimulatorEvent::decode(&envelope.kind, envelope.data) {
            Ok(event) => event,
            Err(err) => {
                warn!(target: "sim.channel", kind = %envelope.kind, error = %err, "dropping undecodable event");
                return 0;
            }
        };
        self.registry.dispatch(&event)
    }

    /// Starts the inbound pump. Messages are dispatched one at a time, in arrival order.
    pub fn listen(self: &Arc<Self>) {
        if self.pump.get().is_some() {
            return;
        }
        let mut rx = self.host.inbound();
        let channel = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(raw) => {
                        let Some(channel) = channel.upgrade() else {
                            break;
                        };
                        channel.dispatch_raw(raw);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(target: "sim.channel", skipped, "inbound pump lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        if let Err(handle) = self.pump.set(handle) {
            handle.abort();
        }
    }

    /// Drops the frame binding and every registered handler.
    pub fn disconnect(&self) {
        let mut binding = self.binding.lock();
        let was_connected = binding.connected;
        *binding = Binding::default();
        drop(binding);
        self.registry.clear();
        if was_connected {
            info!(target: "sim.channel", "channel disconnected");
        }
    }
}

impl Drop for CommunicationChannel {
    fn drop(&mut self) {
        if let Some(handle) = self.pump.get() {
            handle.abort();
        }
    }
}
