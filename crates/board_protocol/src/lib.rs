//! Wire models shared by the board caches, the sequencer and the replay tool.

use std::fmt;

use shape::ShapeError;

mod channel;
mod event;
mod info;
pub mod legacy;
mod placement;

pub use channel::{Channel, ChannelSet, decode_timestamps, encode_timestamps};
pub use event::{BoardDataUpdate, BoardEvent, BoardUpdate, Change, PixelsAvailable, parse_event};
pub use info::{BoardInfo, BoardInfoPatch, Color, Palette, parse_board_info};
pub use placement::{PlaceOverrides, Placement, PlacementReceipt};

#[derive(Debug)]
pub enum ProtocolError {
    Malformed(serde_json::Error),
    Shape(ShapeError),
    EmptyChange { channel: Channel, index: usize },
    ChangeOverflow { channel: Channel, index: usize },
    ValueOutOfRange { channel: Channel, index: usize },
    LegacyLength { heatmap: usize, virginmap: usize },
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Malformed(error) => write!(formatter, "malformed message: {error}"),
            ProtocolError::Shape(error) => write!(formatter, "{error}"),
            ProtocolError::EmptyChange { channel, index } => {
                write!(formatter, "{channel:?} change {index} is empty")
            }
            ProtocolError::ChangeOverflow { channel, index } => {
                write!(formatter, "{channel:?} change {index} overflows the position space")
            }
            ProtocolError::ValueOutOfRange { channel, index } => write!(
                formatter,
                "{channel:?} change {index} carries a value wider than the channel"
            ),
            ProtocolError::LegacyLength { heatmap, virginmap } => write!(
                formatter,
                "heatmap has {heatmap} bytes but virginmap has {virginmap}"
            ),
        }
    }
}

impl std::error::Error for ProtocolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProtocolError::Malformed(error) => Some(error),
            ProtocolError::Shape(error) => Some(error),
            _ => None,
        }
    }
}

impl BoardInfo {
    /// Applies a partial update field by field. The shape is never replaced:
    /// an identical shape is accepted and a differing one is reported back
    /// without touching any other field.
    pub fn apply_patch(&mut self, patch: &BoardInfoPatch) -> Result<(), ShapeMismatch> {
        if let Some(shape) = &patch.shape
            && **shape != *self.shape
        {
            return Err(ShapeMismatch {
                current: self.shape.to_string(),
                proposed: shape.to_string(),
            });
        }
        if let Some(name) = &patch.name {
            self.name.clone_from(name);
        }
        if let Some(palette) = &patch.palette {
            self.palette.clone_from(palette);
        }
        if let Some(max_pixels_available) = patch.max_pixels_available {
            self.max_pixels_available = max_pixels_available;
        }
        if let Some(created_at) = patch.created_at {
            self.created_at = created_at;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeMismatch {
    pub current: String,
    pub proposed: String,
}

impl fmt::Display for ShapeMismatch {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            formatter,
            "board shape changed from {} to {}",
            self.current, self.proposed
        )
    }
}

impl std::error::Error for ShapeMismatch {}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use shape::Shape;

    use super::*;

    fn info() -> BoardInfo {
        BoardInfo {
            name: "main".to_owned(),
            shape: Arc::new(Shape::from_pairs(&[[2, 2], [4, 4]]).expect("shape")),
            palette: Palette::default(),
            max_pixels_available: 6,
            created_at: 100,
        }
    }

    #[test]
    fn patch_updates_only_present_fields() {
        let mut info = info();
        let patch = BoardInfoPatch {
            name: Some("renamed".to_owned()),
            max_pixels_available: Some(2),
            ..BoardInfoPatch::default()
        };
        info.apply_patch(&patch).expect("apply patch");
        assert_eq!(info.name, "renamed");
        assert_eq!(info.max_pixels_available, 2);
        assert_eq!(info.created_at, 100);
    }

    #[test]
    fn identical_shape_is_accepted_and_different_shape_refused() {
        let mut info = info();
        let same = BoardInfoPatch {
            shape: Some(Arc::new(Shape::from_pairs(&[[2, 2], [4, 4]]).expect("shape"))),
            ..BoardInfoPatch::default()
        };
        assert_eq!(info.apply_patch(&same), Ok(()));

        let different = BoardInfoPatch {
            shape: Some(Arc::new(Shape::from_pairs(&[[4, 4], [4, 4]]).expect("shape"))),
            name: Some("ignored".to_owned()),
            ..BoardInfoPatch::default()
        };
        let mismatch = info.apply_patch(&different).expect_err("shape change");
        assert_eq!(mismatch.current, "[[2, 2], [4, 4]]");
        assert_eq!(mismatch.proposed, "[[4, 4], [4, 4]]");
        assert_eq!(info.name, "main");
    }
}
