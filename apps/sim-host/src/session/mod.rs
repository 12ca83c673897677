//! Simulator session state machine.
//!
//! The session owns the channel, reduces inbound events into a
//! [`SessionState`] published on a `watch` channel, and exposes the imperative
//! commands the host UI needs. Victory and defeat are also broadcast as
//! [`SessionEvent`]s so a presenter can show a modal exactly once.

mod state;
mod view;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use frame_channel::{
    AttachOutcome, CommunicationChannel, Correlator, Handler, HandlerResult, RetryPolicy,
};
use progress_sdk::LevelHintStore;
use serde_json::Value;
use sim_proto::{
    ErrorEvent, EventKind, GameSnapshot, HostCommand, LoadLevel, LoadMapAndChallenge, LoseEvent,
    Program, ProgramStatus, SimulatorEvent, VictoryEvent,
};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::reconcile::{ReconcileOutcome, Reconciler};

pub use state::{Phase, SessionError, SessionState};
pub use view::{DefeatView, FailureCategory, VictoryView};

const SESSION_EVENTS: [EventKind; 9] = [
    EventKind::Ready,
    EventKind::Progress,
    EventKind::Victory,
    EventKind::Lose,
    EventKind::Error,
    EventKind::Status,
    EventKind::ProgramStarted,
    EventKind::ProgramPaused,
    EventKind::ProgramStopped,
];

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Ready,
    Victory(VictoryView),
    Defeat(DefeatView),
    Reconciled(ReconcileOutcome),
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub element_id: String,
    pub attach_retry: RetryPolicy,
    pub request_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            element_id: frame_channel::DEFAULT_ELEMENT_ID.to_string(),
            attach_retry: RetryPolicy::new(10, Duration::from_millis(200)),
            request_timeout: Duration::from_secs(5),
        }
    }
}

pub struct SimulatorSession {
    channel: Arc<CommunicationChannel>,
    correlator: Correlator,
    settings: SessionSettings,
    state: watch::Sender<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    reconciler: Option<Arc<Reconciler>>,
    hints: Option<Arc<dyn LevelHintStore>>,
    handler: Handler,
    /// READY seen while still connecting.
    early_ready: AtomicBool,
    /// Bumped on every disconnect so an attach that outlives it is discarded.
    generation: AtomicU64,
}

impl SimulatorSession {
    pub fn new(
        channel: Arc<CommunicationChannel>,
        settings: SessionSettings,
        reconciler: Option<Arc<Reconciler>>,
        hints: Option<Arc<dyn LevelHintStore>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<SimulatorSession>| {
            let weak = weak.clone();
            let handler = Handler::new(move |event| match weak.upgrade() {
                Some(session) => session.handle_event(event),
                None => Ok(()),
            });
            Self {
                correlator: Correlator::new(Arc::clone(&channel)),
                channel,
                settings,
                state: watch::Sender::new(SessionState::default()),
                events: broadcast::channel(32).0,
                reconciler,
                hints,
                handler,
                early_ready: AtomicBool::new(false),
                generation: AtomicU64::new(0),
            }
        })
    }

    pub fn channel(&self) -> &Arc<CommunicationChannel> {
        &self.channel
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn update(&self, f: impl FnOnce(&mut SessionState)) {
        self.state.send_modify(f);
    }

    fn fail(&self, err: SessionError) -> SessionError {
        warn!(target: "sim.session", error = %err, "session command failed");
        let recorded = err.clone();
        self.update(|state| state.last_error = Some(recorded));
        err
    }

    fn require_connected(&self) -> Result<(), SessionError> {
        if self.state.borrow().is_connected() {
            Ok(())
        } else {
            Err(self.fail(SessionError::NotConnected))
        }
    }

    async fn send(&self, command: &HostCommand) -> Result<(), SessionError> {
        self.channel
            .send(command)
            .await
            .map_err(|err| self.fail(err.into()))
    }

    /// Attaches to the frame. A call made while another attach is in flight
    /// waits for that attach and reports its result.
    pub async fn connect(self: &Arc<Self>) -> Result<(), SessionError> {
        let mut current = Phase::Disconnected;
        let mut generation = 0;
        self.state.send_if_modified(|state| {
            current = state.phase;
            generation = self.generation.load(Ordering::SeqCst);
            if state.phase != Phase::Disconnected {
                return false;
            }
            state.phase = Phase::Connecting;
            state.last_error = None;
            true
        });
        match current {
            Phase::Connected => return Ok(()),
            Phase::Connecting => return self.join_connect().await,
            Phase::Disconnected => {}
        }
        self.early_ready.store(false, Ordering::SeqCst);
        for kind in SESSION_EVENTS {
            self.channel.on(kind, &self.handler);
        }
        self.channel.listen();

        let attached = self
            .channel
            .attach(&self.settings.element_id, self.settings.attach_retry)
            .await;

        let mut ready = false;
        let applied = self.state.send_if_modified(|state| {
            if self.generation.load(Ordering::SeqCst) != generation || state.phase != Phase::Connecting {
                return false;
            }
            match &attached {
                Ok(_) => {
                    ready = self.early_ready.swap(false, Ordering::SeqCst);
                    state.phase = Phase::Connected;
                    state.ready = ready;
                }
                Err(err) => {
                    state.phase = Phase::Disconnected;
                    state.last_error = Some(err.clone().into());
                }
            }
            true
        });

        if !applied {
            // Disconnected while attaching. Undo the binding unless a newer connect owns it.
            if self.state.borrow().phase == Phase::Disconnected {
                self.channel.disconnect();
            }
            info!(target: "sim.session", element_id = %self.settings.element_id, "connect abandoned by disconnect");
            return Err(SessionError::NotConnected);
        }
        match attached {
            Ok(_) => {
                info!(target: "sim.session", element_id = %self.settings.element_id, ready, "simulator connected");
                if ready {
                    let _ = self.events.send(SessionEvent::Ready);
                }
                Ok(())
            }
            Err(err) => {
                warn!(target: "sim.session", error = %err, "simulator attach failed");
                Err(err.into())
            }
        }
    }

    async fn join_connect(&self) -> Result<(), SessionError> {
        let mut rx = self.state.subscribe();
        let settled = rx
            .wait_for(|state| state.phase != Phase::Connecting)
            .await
            .map_err(|_| SessionError::NotConnected)?;
        match settled.phase {
            Phase::Connected => Ok(()),
            _ => Err(settled.last_error.clone().unwrap_or(SessionError::NotConnected)),
        }
    }

    pub fn disconnect(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.channel.disconnect();
        self.early_ready.store(false, Ordering::SeqCst);
        self.state.send_replace(SessionState::default());
        info!(target: "sim.session", "simulator session disconnected");
    }

    /// Re-binds the frame if the page swapped it out underneath us.
    pub async fn refresh(&self) -> Result<AttachOutcome, SessionError> {
        self.require_connected()?;
        self.channel.refresh().await.map_err(|err| self.fail(err.into()))
    }

    pub async fn load_map(&self, map_key: &str) -> Result<(), SessionError> {
        self.require_connected()?;
        self.send(&HostCommand::start_map(map_key)).await?;
        self.after_map_load(Some(map_key));
        Ok(())
    }

    pub async fn load_level(
        &self,
        level_id: &str,
        map_key: &str,
        metadata: Value,
    ) -> Result<(), SessionError> {
        self.require_connected()?;
        self.send(&HostCommand::LoadLevel(LoadLevel {
            level_id: level_id.to_string(),
            map_key: map_key.to_string(),
            metadata,
        }))
        .await?;
        self.after_map_load(Some(map_key));
        Ok(())
    }

    /// Loads an inline map. The session loses track of which catalog map is active.
    pub async fn load_map_and_challenge(
        &self,
        map_json: Value,
        challenge_json: Value,
    ) -> Result<(), SessionError> {
        self.require_connected()?;
        self.send(&HostCommand::LoadMapAndChallenge(LoadMapAndChallenge {
            map_json,
            challenge_json,
        }))
        .await?;
        self.after_map_load(None);
        Ok(())
    }

    fn after_map_load(&self, map_key: Option<&str>) {
        self.update(|state| {
            state.game = Some(match map_key {
                Some(key) => GameSnapshot::fresh(key),
                None => GameSnapshot::default(),
            });
            state.program_status = ProgramStatus::Idle;
            state.active_program = None;
            state.active_map_key = map_key.map(str::to_string);
            state.victory = None;
            state.defeat = None;
        });
        if let (Some(key), Some(hints)) = (map_key, &self.hints) {
            if let Err(err) = hints.remember(key) {
                warn!(target: "sim.session", map_key = key, error = %err, "failed to persist level hint");
            }
        }
    }

    pub async fn run_program(&self, program: Program) -> Result<(), SessionError> {
        program
            .validate()
            .map_err(|err| self.fail(SessionError::Validation(err)))?;
        self.require_connected()?;
        self.send(&HostCommand::RunProgram {
            program: program.clone(),
        })
        .await?;
        self.update(|state| {
            state.program_status = ProgramStatus::Running;
            state.active_program = Some(program);
            state.victory = None;
            state.defeat = None;
        });
        Ok(())
    }

    pub async fn pause_program(&self) -> Result<(), SessionError> {
        self.require_connected()?;
        self.send(&HostCommand::PauseProgram {}).await
    }

    pub async fn stop_program(&self) -> Result<(), SessionError> {
        self.require_connected()?;
        self.send(&HostCommand::StopProgram {}).await?;
        self.update(|state| {
            state.program_status = ProgramStatus::Idle;
            state.active_program = None;
        });
        Ok(())
    }

    pub async fn get_status(&self) -> Result<GameSnapshot, SessionError> {
        self.require_connected()?;
        let snapshot = self
            .correlator
            .status(self.settings.request_timeout)
            .await
            .map_err(|err| self.fail(err.into()))?;
        let recorded = snapshot.clone();
        self.update(|state| {
            state.program_status = recorded.program_status;
            state.game = Some(recorded);
        });
        Ok(snapshot)
    }

    pub fn dismiss_victory(&self) {
        self.update(|state| state.victory = None);
    }

    pub fn dismiss_defeat(&self) {
        self.update(|state| state.defeat = None);
    }

    pub fn clear_error(&self) {
        self.update(|state| state.last_error = None);
    }

    fn handle_event(self: Arc<Self>, event: &SimulatorEvent) -> HandlerResult {
        match event {
            SimulatorEvent::Ready => self.on_ready(),
            SimulatorEvent::Progress(patch) => self.update(|state| {
                state.game.get_or_insert_with(GameSnapshot::default).apply(patch);
                if let Some(status) = patch.program_status {
                    state.program_status = status;
                }
            }),
            SimulatorEvent::Status(snapshot) => self.update(|state| {
                state.program_status = snapshot.program_status;
                state.game = Some(snapshot.clone());
            }),
            SimulatorEvent::ProgramStarted => {
                self.update(|state| state.program_status = ProgramStatus::Running)
            }
            SimulatorEvent::ProgramPaused => {
                self.update(|state| state.program_status = ProgramStatus::Paused)
            }
            SimulatorEvent::ProgramStopped => self.update(|state| {
                state.program_status = ProgramStatus::Idle;
                state.active_program = None;
            }),
            SimulatorEvent::Victory(victory) => self.on_victory(victory),
            SimulatorEvent::Lose(lose) => self.on_defeat(DefeatSource::Lose(lose)),
            SimulatorEvent::Error(error) => self.on_defeat(DefeatSource::Error(error)),
            SimulatorEvent::Unknown { kind, .. } => {
                debug!(target: "sim.session", kind = %kind, "ignoring unknown simulator event");
            }
        }
        Ok(())
    }

    fn on_ready(&self) {
        let phase = self.state.borrow().phase;
        match phase {
            Phase::Connecting => self.early_ready.store(true, Ordering::SeqCst),
            Phase::Connected => {
                let mut changed = false;
                self.update(|state| {
                    changed = !state.ready;
                    state.ready = true;
                });
                if changed {
                    info!(target: "sim.session", "simulator ready");
                    let _ = self.events.send(SessionEvent::Ready);
                }
            }
            Phase::Disconnected => {}
        }
    }

    fn on_victory(self: Arc<Self>, victory: &VictoryEvent) {
        if victory.is_victory == Some(false) {
            debug!(target: "sim.session", "victory event flagged as not a victory");
            return;
        }
        let view = VictoryView::from_event(victory);
        let mut session_key = None;
        self.update(|state| {
            state.program_status = ProgramStatus::Completed;
            state.victory = Some(view.clone());
            session_key = state.active_map_key.clone();
        });
        info!(target: "sim.session", map_key = ?session_key.as_ref().or(victory.map_key.as_ref()), "victory");
        let _ = self.events.send(SessionEvent::Victory(view));

        let Some(reconciler) = self.reconciler.clone() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(target: "sim.session", "no runtime to reconcile victory on");
            return;
        };
        let events = self.events.clone();
        let victory = victory.clone();
        runtime.spawn(async move {
            let outcome = reconciler.reconcile(session_key.as_deref(), &victory).await;
            let _ = events.send(SessionEvent::Reconciled(outcome));
        });
    }

    fn on_defeat(&self, source: DefeatSource<'_>) {
        let view = match source {
            DefeatSource::Lose(lose) => DefeatView::from_lose(lose),
            DefeatSource::Error(error) => DefeatView::from_error(error),
        };
        let mut opened = false;
        self.update(|state| {
            if state.defeat.is_some() {
                return;
            }
            state.program_status = ProgramStatus::Error;
            state.active_program = None;
            state.defeat = Some(view.clone());
            opened = true;
        });
        if !opened {
            debug!(target: "sim.session", reason = %view.reason, "defeat already shown; ignoring");
            return;
        }
        info!(target: "sim.session", category = ?view.category, reason = %view.reason, "defeat");
        let _ = self.events.send(SessionEvent::Defeat(view));
    }
}

enum DefeatSource<'a> {
    Lose(&'a LoseEvent),
    Error(&'a ErrorEvent),
}
