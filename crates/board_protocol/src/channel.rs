use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// One of the four parallel per-pixel planes of a board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Colors,
    Timestamps,
    Mask,
    Initial,
}

impl Channel {
    pub const ALL: [Channel; 4] = [
        Channel::Colors,
        Channel::Timestamps,
        Channel::Mask,
        Channel::Initial,
    ];

    pub const fn bytes_per_pixel(self) -> u64 {
        match self {
            Channel::Timestamps => 4,
            Channel::Colors | Channel::Mask | Channel::Initial => 1,
        }
    }

    /// Resource path of the channel below the board location.
    pub const fn path(self) -> &'static str {
        match self {
            Channel::Colors => "data/colors",
            Channel::Timestamps => "data/timestamps",
            Channel::Mask => "data/mask",
            Channel::Initial => "data/initial",
        }
    }

    pub const fn flag(self) -> ChannelSet {
        match self {
            Channel::Colors => ChannelSet::COLORS,
            Channel::Timestamps => ChannelSet::TIMESTAMPS,
            Channel::Mask => ChannelSet::MASK,
            Channel::Initial => ChannelSet::INITIAL,
        }
    }

    /// Encodes one pixel value in the channel's byte layout. `None` when the
    /// value does not fit the element width.
    pub fn encode_value(self, value: u32) -> Option<[u8; 4]> {
        match self {
            Channel::Timestamps => Some(value.to_le_bytes()),
            Channel::Colors | Channel::Mask | Channel::Initial => {
                let byte = u8::try_from(value).ok()?;
                Some([byte, 0, 0, 0])
            }
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ChannelSet: u8 {
        const COLORS = 1 << 0;
        const TIMESTAMPS = 1 << 1;
        const MASK = 1 << 2;
        const INITIAL = 1 << 3;
    }
}

impl ChannelSet {
    pub fn channels(self) -> impl Iterator<Item = Channel> {
        Channel::ALL
            .into_iter()
            .filter(move |channel| self.contains(channel.flag()))
    }
}

/// Decodes a timestamps-channel buffer (little-endian `u32` per pixel).
pub fn decode_timestamps(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

pub fn encode_timestamps(timestamps: &[u32]) -> Vec<u8> {
    timestamps
        .iter()
        .flat_map(|timestamp| timestamp.to_le_bytes())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_widths_and_flags() {
        assert_eq!(Channel::Colors.bytes_per_pixel(), 1);
        assert_eq!(Channel::Timestamps.bytes_per_pixel(), 4);
        let set = ChannelSet::COLORS | ChannelSet::INITIAL;
        assert_eq!(
            set.channels().collect::<Vec<_>>(),
            vec![Channel::Colors, Channel::Initial]
        );
    }

    #[test]
    fn values_outside_byte_channels_are_refused() {
        assert_eq!(Channel::Colors.encode_value(255), Some([255, 0, 0, 0]));
        assert_eq!(Channel::Mask.encode_value(256), None);
        assert_eq!(
            Channel::Timestamps.encode_value(0x0A0B_0C0D),
            Some([0x0D, 0x0C, 0x0B, 0x0A])
        );
    }

    #[test]
    fn timestamps_are_little_endian() {
        let bytes = encode_timestamps(&[1, 0x0100_0000]);
        assert_eq!(bytes, vec![1, 0, 0, 0, 0, 0, 0, 1]);
        assert_eq!(decode_timestamps(&bytes), vec![1, 0x0100_0000]);
    }
}
