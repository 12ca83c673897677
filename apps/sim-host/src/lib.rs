//! Host side of the embedded robot simulator.
//!
//! Wires a [`frame_channel::CommunicationChannel`] to a [`session::SimulatorSession`]
//! and reconciles victories into learner progress through [`reconcile::Reconciler`].

pub mod bridge;
pub mod config;
pub mod logging;
pub mod reconcile;
pub mod session;

pub use bridge::{BridgeError, FrameBridge};
pub use config::{ConfigError, HostConfig};
pub use reconcile::{LocationSource, MapKeySource, ReconcileOutcome, Reconciler, ReconcilerSettings};
pub use session::{
    DefeatView, FailureCategory, Phase, SessionError, SessionEvent, SessionSettings, SessionState,
    SimulatorSession, VictoryView,
};
