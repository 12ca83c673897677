use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sim_proto::{EventKind, GameSnapshot, HostCommand, SimulatorEvent};
use tokio::sync::oneshot;
use tracing::debug;

use crate::channel::CommunicationChannel;
use crate::registry::Handler;
use crate::RequestError;

pub const DEFAULT_STATUS_TIMEOUT: Duration = Duration::from_secs(5);

/// Turns a command plus its expected reply kind into a single awaitable call.
///
/// Replies carry no correlation id, so the first matching event after the send
/// resolves the call. Concurrent requests expecting the same kind all resolve
/// on that one event.
#[derive(Clone)]
pub struct Correlator {
    channel: Arc<CommunicationChannel>,
}

impl Correlator {
    pub fn new(channel: Arc<CommunicationChannel>) -> Self {
        Self { channel }
    }

    pub fn channel(&self) -> &Arc<CommunicationChannel> {
        &self.channel
    }

    pub async fn request(
        &self,
        command: &HostCommand,
        expect: EventKind,
        timeout: Duration,
    ) -> Result<SimulatorEvent, RequestError> {
        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(Mutex::new(Some(tx)));
        let handler = {
            let slot = Arc::clone(&slot);
            Handler::new(move |event| {
                if let Some(tx) = slot.lock().take() {
                    let _ = tx.send(event.clone());
                }
                Ok(())
            })
        };

        // Registered before sending so a fast reply is not missed.
        let _registration = Registration::new(&self.channel, expect, handler);
        self.await_reply(command, expect, timeout, rx).await
    }

    async fn await_reply(
        &self,
        command: &HostCommand,
        expect: EventKind,
        timeout: Duration,
        rx: oneshot::Receiver<SimulatorEvent>,
    ) -> Result<SimulatorEvent, RequestError> {
        self.channel.send(command).await?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(event)) if event.kind() == expect => Ok(event),
            Ok(Ok(event)) => Err(RequestError::UnexpectedReply(event.kind())),
            Ok(Err(_)) | Err(_) => {
                debug!(
                    target: "sim.channel",
                    command = command.name(),
                    expect = %expect,
                    ?timeout,
                    "request timed out"
                );
                Err(RequestError::Timeout {
                    expect,
                    after: timeout,
                })
            }
        }
    }

    /// Asks the simulator for its current snapshot.
    pub async fn status(&self, timeout: Duration) -> Result<GameSnapshot, RequestError> {
        match self
            .request(&HostCommand::GetStatus {}, EventKind::Status, timeout)
            .await?
        {
            SimulatorEvent::Status(snapshot) => Ok(snapshot),
            other => Err(RequestError::UnexpectedReply(other.kind())),
        }
    }
}

/// Keeps the reply handler registered for exactly as long as the request is alive,
/// including when the request future is dropped before it resolves.
struct Registration<'a> {
    channel: &'a CommunicationChannel,
    kind: EventKind,
    handler: Handler,
}

impl<'a> Registration<'a> {
    fn new(channel: &'a CommunicationChannel, kind: EventKind, handler: Handler) -> Self {
        channel.on(kind, &handler);
        Self {
            channel,
            kind,
            handler,
        }
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.channel.off(self.kind, &self.handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelConfig, RetryPolicy};
    use crate::frame::LocalFrameHost;
    use crate::ChannelError;
    use serde_json::json;
    use sim_proto::{Position, ProgramStatus};

    const ORIGIN: &str = "http://localhost:5173";

    async fn connected() -> (Arc<LocalFrameHost>, Arc<crate::LocalFrame>, Correlator) {
        let host = LocalFrameHost::new();
        let frame = host.mount("frame-x");
        let channel = CommunicationChannel::new(host.clone(), ChannelConfig::default());
        channel.attach("frame-x", RetryPolicy::none()).await.unwrap();
        channel.listen();
        (host, frame, Correlator::new(channel))
    }

    #[tokio::test]
    async fn status_resolves_with_reply_snapshot() {
        let (host, frame, correlator) = connected().await;
        let mut posts = frame.watch_posts();
        let responder = tokio::spawn(async move {
            let posted = posts.recv().await.expect("command posted");
            assert_eq!(posted.message["type"], "GET_STATUS");
            host.deliver(
                ORIGIN,
                json!({
                    "source": "simulator",
                    "type": "STATUS",
                    "data": {
                        "mapKey": "basic1",
                        "robotPosition": {"x": 2, "y": 3},
                        "programStatus": "running",
                        "currentStep": 4,
                        "totalSteps": 9
                    }
                }),
            );
        });

        let snapshot = correlator.status(Duration::from_secs(5)).await.unwrap();
        responder.await.unwrap();

        assert_eq!(snapshot.map_key.as_deref(), Some("basic1"));
        assert_eq!(snapshot.robot_position, Position { x: 2, y: 3 });
        assert_eq!(snapshot.program_status, ProgramStatus::Running);
        assert_eq!(correlator.channel().handler_count(EventKind::Status), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_simulator_times_out() {
        let (_host, frame, correlator) = connected().await;

        let err = correlator
            .status(Duration::from_millis(1500))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            RequestError::Timeout {
                expect: EventKind::Status,
                after: Duration::from_millis(1500)
            }
        );
        assert_eq!(frame.posted().len(), 1);
        assert_eq!(correlator.channel().handler_count(EventKind::Status), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn send_failure_rejects_and_cleans_up() {
        let host = LocalFrameHost::new();
        let channel = CommunicationChannel::new(host, ChannelConfig::default());
        let correlator = Correlator::new(channel);

        let err = correlator
            .request(&HostCommand::GetStatus {}, EventKind::Status, Duration::from_secs(5))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            RequestError::Channel(ChannelError::ElementNotFound { .. })
        ));
        assert_eq!(correlator.channel().handler_count(EventKind::Status), 0);
    }

    #[tokio::test]
    async fn other_handlers_survive_a_request() {
        let (host, frame, correlator) = connected().await;
        let observed = Arc::new(Mutex::new(0usize));
        let observer = {
            let observed = Arc::clone(&observed);
            Handler::new(move |_| {
                *observed.lock() += 1;
                Ok(())
            })
        };
        correlator.channel().on(EventKind::Status, &observer);

        let mut posts = frame.watch_posts();
        tokio::spawn(async move {
            let _ = posts.recv().await;
            host.deliver(ORIGIN, json!({"source": "simulator", "type": "STATUS", "data": {}}));
        });
        correlator.status(Duration::from_secs(5)).await.unwrap();

        assert_eq!(*observed.lock(), 1);
        assert_eq!(correlator.channel().handler_count(EventKind::Status), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_requests_leave_no_handlers_behind() {
        let (_host, _frame, correlator) = connected().await;

        for _ in 0..3 {
            let cancelled =
                tokio::time::timeout(Duration::from_millis(10), correlator.status(Duration::from_secs(5)))
                    .await;
            assert!(cancelled.is_err());
        }

        assert_eq!(correlator.channel().handler_count(EventKind::Status), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_mid_request_ends_in_timeout() {
        let (host, frame, correlator) = connected().await;
        let channel = Arc::clone(correlator.channel());
        let mut posts = frame.watch_posts();

        let interrupt = async {
            posts.recv().await.expect("command posted");
            channel.disconnect();
            host.deliver(
                ORIGIN,
                json!({"source": "simulator", "type": "STATUS", "data": {"mapKey": "basic1"}}),
            );
        };
        let (result, ()) = tokio::join!(correlator.status(Duration::from_secs(1)), interrupt);

        assert_eq!(
            result.unwrap_err(),
            RequestError::Timeout {
                expect: EventKind::Status,
                after: Duration::from_secs(1)
            }
        );
        assert_eq!(channel.handler_count(EventKind::Status), 0);
    }
}
