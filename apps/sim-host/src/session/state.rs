use frame_channel::{ChannelError, RequestError};
use sim_proto::{GameSnapshot, Program, ProgramStatus, ValidationError};
use thiserror::Error;

use super::view::{DefeatView, VictoryView};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Phase {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SessionError {
    #[error("simulator is not connected")]
    NotConnected,
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Observable snapshot of the session. Cloned into every watcher.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionState {
    pub phase: Phase,
    /// The simulator has announced READY. Never true while disconnected.
    pub ready: bool,
    /// Last simulator-reported status. Only STATUS, PROGRESS and map loads touch it.
    pub game: Option<GameSnapshot>,
    pub program_status: ProgramStatus,
    pub active_program: Option<Program>,
    pub active_map_key: Option<String>,
    pub last_error: Option<SessionError>,
    pub victory: Option<VictoryView>,
    pub defeat: Option<DefeatView>,
}

impl SessionState {
    pub fn is_connected(&self) -> bool {
        self.phase == Phase::Connected
    }
}
