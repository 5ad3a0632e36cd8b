use std::fmt;

use board_protocol::{
    BoardInfo, PixelsAvailable, PlaceOverrides, Placement, PlacementReceipt, ProtocolError,
};

/// The board's request/response surface. Sector data goes through
/// [`sectors::SectorSource`], implemented by the same collaborator.
pub trait BoardBackend: Send + Sync {
    fn fetch_info(&self) -> Result<BoardInfo, BackendError>;

    fn fetch_cooldown(&self) -> Result<PixelsAvailable, BackendError>;

    fn place(
        &self,
        position: u64,
        color: u32,
        overrides: PlaceOverrides,
    ) -> Result<PlacementReceipt, BackendError>;

    /// Last placement at `position`, `None` if it was never placed.
    fn lookup(&self, position: u64) -> Result<Option<Placement>, BackendError>;

    /// Re-establishes the event stream after a disconnect.
    fn reconnect(&self) -> Result<(), BackendError>;
}

#[derive(Debug)]
pub enum BackendError {
    Transport(String),
    /// The server understood the request and refused it.
    Refused(String),
    Protocol(ProtocolError),
}

impl fmt::Display for BackendError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Transport(message) => write!(formatter, "transport error: {message}"),
            BackendError::Refused(reason) => write!(formatter, "request refused: {reason}"),
            BackendError::Protocol(error) => write!(formatter, "{error}"),
        }
    }
}

impl std::error::Error for BackendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BackendError::Protocol(error) => Some(error),
            BackendError::Transport(_) | BackendError::Refused(_) => None,
        }
    }
}

impl From<ProtocolError> for BackendError {
    fn from(error: ProtocolError) -> Self {
        BackendError::Protocol(error)
    }
}
