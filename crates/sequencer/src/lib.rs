//! Live board session.
//!
//! Board-update messages are applied one at a time, in arrival order, by a
//! dedicated worker thread; listeners see each message only once its changes
//! are visible through the sector and texture caches. Pixels-available
//! messages only touch cooldown state and are published immediately.

use std::fmt;
use std::sync::Arc;

use board_protocol::{BoardUpdate, PixelsAvailable, PlacementReceipt, ProtocolError, ShapeMismatch};
use shape::ShapeError;

mod backend;
mod clock;
mod config;
pub mod memory;
mod session;
mod undo;

pub use backend::{BackendError, BoardBackend};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SessionConfig;
pub use session::Session;
pub use undo::{UndoEntry, UndoList};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequencerError {
    ShapeChangeUnsupported(ShapeMismatch),
}

impl fmt::Display for SequencerError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SequencerError::ShapeChangeUnsupported(mismatch) => {
                write!(formatter, "unsupported mid-session change: {mismatch}")
            }
        }
    }
}

impl std::error::Error for SequencerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SequencerError::ShapeChangeUnsupported(mismatch) => Some(mismatch),
        }
    }
}

#[derive(Debug)]
pub enum SessionError {
    Shape(ShapeError),
    Backend(BackendError),
    Spawn(std::io::Error),
}

impl fmt::Display for SessionError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Shape(error) => write!(formatter, "cannot address board: {error}"),
            SessionError::Backend(error) => write!(formatter, "cannot open session: {error}"),
            SessionError::Spawn(error) => write!(formatter, "cannot start sequencer: {error}"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Shape(error) => Some(error),
            SessionError::Backend(error) => Some(error),
            SessionError::Spawn(error) => Some(error),
        }
    }
}

impl From<BackendError> for SessionError {
    fn from(error: BackendError) -> Self {
        match error {
            BackendError::Protocol(ProtocolError::Shape(error)) => SessionError::Shape(error),
            error => SessionError::Backend(error),
        }
    }
}

/// What listeners receive, in the order it happened.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A board-update whose changes are fully applied.
    BoardUpdate(Arc<BoardUpdate>),
    PixelsAvailable(PixelsAvailable),
    /// The session stopped applying board updates.
    Fatal(SequencerError),
    ConnectionLost { attempts: u32 },
}

impl SessionEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            SessionEvent::BoardUpdate(_) => "board-update",
            SessionEvent::PixelsAvailable(_) => "pixels-available",
            SessionEvent::Fatal(_) => "fatal",
            SessionEvent::ConnectionLost { .. } => "connection-lost",
        }
    }
}

#[derive(Debug)]
pub enum PlaceOutcome {
    Placed(PlacementReceipt),
    /// The pixel already had the requested color; nothing was sent.
    Unchanged,
    Rejected(BackendError),
}
