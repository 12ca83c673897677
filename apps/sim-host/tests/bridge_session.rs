use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use frame_channel::{ChannelConfig, CommunicationChannel, RetryPolicy};
use futures_util::{SinkExt, StreamExt};
use progress_sdk::{
    CachedMapCatalog, InMemoryCompletionStore, InMemoryLevelHintStore, MapCatalog, MapCatalogEntry,
    StaticMapSource,
};
use serde_json::{json, Value};
use sim_host_core::{
    FrameBridge, MapKeySource, ReconcileOutcome, Reconciler, SessionError, SessionEvent,
    SessionSettings, SimulatorSession,
};
use sim_proto::{GameSnapshot, SimulatorEvent, VictoryEvent, SIMULATOR_SOURCE};
use test_timeout::sim_test;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

const FRAME: &str = "robot-game-iframe";
const ORIGIN: &str = "http://localhost:5173";

/// Stands in for the browser page that embeds the simulator.
struct Shim {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Shim {
    async fn connect(addr: SocketAddr, location: Option<&str>) -> Self {
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .expect("connect shim");
        let hello = json!({"kind": "hello", "frameId": FRAME, "location": location});
        ws.send(Message::Text(hello.to_string())).await.expect("send hello");
        Self { ws }
    }

    async fn emit_from(&mut self, origin: &str, event: &SimulatorEvent) {
        let relay = json!({
            "kind": "message",
            "origin": origin,
            "data": event.to_envelope(SIMULATOR_SOURCE),
        });
        self.ws
            .send(Message::Text(relay.to_string()))
            .await
            .expect("relay message");
    }

    async fn emit(&mut self, event: &SimulatorEvent) {
        self.emit_from(ORIGIN, event).await;
    }

    /// Next message the host posted into the frame.
    async fn next_post(&mut self) -> Value {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(2), self.ws.next())
                .await
                .expect("post within 2s")
                .expect("stream open")
                .expect("websocket frame");
            if let Message::Text(text) = message {
                let post: Value = serde_json::from_str(&text).expect("post json");
                assert_eq!(post["kind"], "post");
                assert_eq!(post["targetOrigin"], "*");
                return post["message"].clone();
            }
        }
    }
}

struct Host {
    addr: SocketAddr,
    bridge: Arc<FrameBridge>,
    session: Arc<SimulatorSession>,
    store: Arc<InMemoryCompletionStore>,
    basic3: Uuid,
}

impl Host {
    async fn start(use_location: bool) -> Self {
        let (bridge, listener) = FrameBridge::bind("127.0.0.1:0").await.expect("bind bridge");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(Arc::clone(&bridge).serve(listener));

        let basic3 = Uuid::new_v4();
        let catalog = CachedMapCatalog::new(StaticMapSource::new(vec![MapCatalogEntry {
            id: basic3,
            key: "basic3".into(),
            kind: None,
            category: None,
        }]));
        catalog.refresh().await.expect("seed catalog");
        let store = InMemoryCompletionStore::new();
        let mut reconciler = Reconciler::new(catalog, store.clone());
        if use_location {
            reconciler = reconciler.with_location(bridge.clone());
        }

        let channel = CommunicationChannel::new(bridge.clone(), ChannelConfig::default());
        let session = SimulatorSession::new(
            channel,
            SessionSettings {
                element_id: FRAME.to_string(),
                attach_retry: RetryPolicy::new(50, Duration::from_millis(20)),
                request_timeout: Duration::from_secs(2),
            },
            Some(Arc::new(reconciler)),
            Some(InMemoryLevelHintStore::new()),
        );
        Self {
            addr,
            bridge,
            session,
            store,
            basic3,
        }
    }

    async fn wait_ready(&self) {
        let mut state = self.session.subscribe();
        tokio::time::timeout(Duration::from_secs(2), state.wait_for(|state| state.ready))
            .await
            .expect("ready within 2s")
            .expect("session alive");
    }

    async fn next_reconciled(&self, events: &mut tokio::sync::broadcast::Receiver<SessionEvent>) -> ReconcileOutcome {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(3), events.recv())
                .await
                .expect("event within 3s")
                .expect("event stream open");
            if let SessionEvent::Reconciled(outcome) = event {
                return outcome;
            }
        }
    }
}

#[sim_test(20)]
async fn victory_through_bridge_records_active_map() {
    let host = Host::start(false).await;
    let mut shim = Shim::connect(host.addr, None).await;

    host.session.connect().await.expect("attach to shim frame");
    shim.emit(&SimulatorEvent::Ready).await;
    host.wait_ready().await;

    host.session.load_map("basic3").await.expect("load map");
    let start = shim.next_post().await;
    assert_eq!(start["type"], "START_MAP");
    assert_eq!(start["source"], "host");
    assert_eq!(start["data"]["mapKey"], "basic3");

    let mut events = host.session.events();
    shim.emit(&SimulatorEvent::Victory(VictoryEvent {
        is_victory: Some(true),
        ..VictoryEvent::default()
    }))
    .await;

    assert_eq!(
        host.next_reconciled(&mut events).await,
        ReconcileOutcome::Recorded {
            map_key: "basic3".into(),
            map_id: host.basic3,
            source: MapKeySource::Session,
        }
    );
    assert_eq!(host.store.writes().await, vec![host.basic3]);
    assert!(host.session.state().victory.is_some());
}

#[sim_test(20)]
async fn status_request_round_trips_through_shim() {
    let host = Host::start(false).await;
    let mut shim = Shim::connect(host.addr, None).await;
    host.session.connect().await.expect("attach to shim frame");

    let reply = async {
        let request = shim.next_post().await;
        assert_eq!(request["type"], "GET_STATUS");
        let mut snapshot = GameSnapshot::fresh("basic3");
        snapshot.collected_batteries = 2;
        shim.emit(&SimulatorEvent::Status(snapshot)).await;
    };
    let (status, ()) = tokio::join!(host.session.get_status(), reply);

    let status = status.expect("status reply");
    assert_eq!(status.map_key.as_deref(), Some("basic3"));
    assert_eq!(status.collected_batteries, 2);
    assert_eq!(host.session.state().game, Some(status));
}

#[sim_test(20)]
async fn location_fallback_uses_shim_page_url() {
    let host = Host::start(true).await;
    let mut shim = Shim::connect(host.addr, Some("http://localhost:5173/play/basic3?lang=en")).await;
    host.session.connect().await.expect("attach to shim frame");

    let mut events = host.session.events();
    shim.emit(&SimulatorEvent::Victory(VictoryEvent::default())).await;

    assert_eq!(
        host.next_reconciled(&mut events).await,
        ReconcileOutcome::Recorded {
            map_key: "basic3".into(),
            map_id: host.basic3,
            source: MapKeySource::Location,
        }
    );
}

#[sim_test(20)]
async fn foreign_origin_is_dropped_at_the_bridge() {
    let host = Host::start(false).await;
    let mut shim = Shim::connect(host.addr, None).await;
    host.session.connect().await.expect("attach to shim frame");

    shim.emit_from("https://evil.example", &SimulatorEvent::Ready).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!host.session.state().ready);

    shim.emit(&SimulatorEvent::Ready).await;
    host.wait_ready().await;
}

#[sim_test(20)]
async fn closed_shim_unmounts_the_frame() {
    let host = Host::start(false).await;
    let mut shim = Shim::connect(host.addr, None).await;
    host.session.connect().await.expect("attach to shim frame");
    assert_eq!(host.bridge.frame_ids(), vec![FRAME.to_string()]);

    shim.ws.close(None).await.expect("close shim");
    drop(shim);
    for _ in 0..100 {
        if host.bridge.frame_ids().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(host.bridge.frame_ids().is_empty());

    let err = host.session.load_map("basic3").await.unwrap_err();
    assert!(matches!(err, SessionError::Channel(_)), "{err:?}");
    assert_eq!(host.session.state().last_error, Some(err));
}
