use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::{BoardInfoPatch, Channel, ChannelSet, ProtocolError};

/// A modified run of pixels starting at an absolute board position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Change {
    /// New values for `values.len()` consecutive pixels.
    Values { position: u64, values: Vec<u32> },
    /// The run changed but the new values are not carried.
    Invalidate { position: u64, length: u64 },
}

impl Change {
    pub fn position(&self) -> u64 {
        match self {
            Change::Values { position, .. } | Change::Invalidate { position, .. } => *position,
        }
    }

    pub fn len(&self) -> u64 {
        match self {
            Change::Values { values, .. } => values.len() as u64,
            Change::Invalidate { length, .. } => *length,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn range(&self) -> Range<u64> {
        let start = self.position();
        let end = start
            .checked_add(self.len())
            .expect("change range overflow checked at parse time");
        start..end
    }

    pub fn values(&self) -> Option<&[u32]> {
        match self {
            Change::Values { values, .. } => Some(values),
            Change::Invalidate { .. } => None,
        }
    }

    fn validate(&self, channel: Channel, index: usize) -> Result<(), ProtocolError> {
        if self.is_empty() {
            return Err(ProtocolError::EmptyChange { channel, index });
        }
        if self.position().checked_add(self.len()).is_none() {
            return Err(ProtocolError::ChangeOverflow { channel, index });
        }
        if let Some(values) = self.values()
            && values
                .iter()
                .any(|value| channel.encode_value(*value).is_none())
        {
            return Err(ProtocolError::ValueOutOfRange { channel, index });
        }
        Ok(())
    }
}

/// Per-channel change lists of a board-update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardDataUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub colors: Option<Vec<Change>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamps: Option<Vec<Change>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask: Option<Vec<Change>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial: Option<Vec<Change>>,
}

impl BoardDataUpdate {
    /// Invalidates every pixel of every channel. Sent after a reconnect since
    /// any number of updates may have been missed.
    pub fn full_board(pixel_count: u64) -> Self {
        let all = || {
            Some(vec![Change::Invalidate {
                position: 0,
                length: pixel_count,
            }])
        };
        Self {
            colors: all(),
            timestamps: all(),
            mask: all(),
            initial: all(),
        }
    }

    pub fn changes(&self, channel: Channel) -> &[Change] {
        let changes = match channel {
            Channel::Colors => &self.colors,
            Channel::Timestamps => &self.timestamps,
            Channel::Mask => &self.mask,
            Channel::Initial => &self.initial,
        };
        changes.as_deref().unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Channel, &Change)> {
        Channel::ALL.into_iter().flat_map(move |channel| {
            self.changes(channel)
                .iter()
                .map(move |change| (channel, change))
        })
    }

    pub fn channels(&self) -> ChannelSet {
        Channel::ALL
            .into_iter()
            .filter(|channel| !self.changes(*channel).is_empty())
            .fold(ChannelSet::empty(), |set, channel| set | channel.flag())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<BoardInfoPatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<BoardDataUpdate>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelsAvailable {
    pub count: u32,
    /// Unix seconds at which the next pixel becomes available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<u64>,
}

/// One message of the live event stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum BoardEvent {
    BoardUpdate(BoardUpdate),
    PixelsAvailable(PixelsAvailable),
}

impl BoardEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            BoardEvent::BoardUpdate(_) => "board-update",
            BoardEvent::PixelsAvailable(_) => "pixels-available",
        }
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        let BoardEvent::BoardUpdate(BoardUpdate {
            data: Some(data), ..
        }) = self
        else {
            return Ok(());
        };
        for channel in Channel::ALL {
            for (index, change) in data.changes(channel).iter().enumerate() {
                change.validate(channel, index)?;
            }
        }
        Ok(())
    }
}

/// Parses and validates one event-stream message.
pub fn parse_event(text: &str) -> Result<BoardEvent, ProtocolError> {
    let event: BoardEvent = serde_json::from_str(text).map_err(ProtocolError::Malformed)?;
    event.validate()?;
    Ok(event)
}
