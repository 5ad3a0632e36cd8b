use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use shape::{Level, Shape};

use crate::ProtocolError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Color {
    pub name: String,
    /// `0xRRGGBBAA`.
    pub value: u32,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub system_only: bool,
}

impl Color {
    pub fn rgba(&self) -> [u8; 4] {
        self.value.to_be_bytes()
    }
}

/// Palette indexed by the byte stored in the colors channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Palette(pub BTreeMap<u32, Color>);

impl Palette {
    pub fn get(&self, index: u32) -> Option<&Color> {
        self.0.get(&index)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// RGBA lookup table with one entry per index up to the highest defined
    /// one; gaps are transparent black.
    pub fn lookup_table(&self) -> Vec<u8> {
        let entries = self
            .0
            .keys()
            .next_back()
            .map_or(0, |highest| *highest as usize + 1);
        let mut table = vec![0u8; entries * 4];
        for (index, color) in &self.0 {
            let start = *index as usize * 4;
            table[start..start + 4].copy_from_slice(&color.rgba());
        }
        table
    }
}

/// Board metadata. Timestamps in the data channels and in placements are
/// seconds relative to `created_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardInfo {
    pub name: String,
    #[serde(
        serialize_with = "serialize_shape",
        deserialize_with = "deserialize_shape"
    )]
    pub shape: Arc<Shape>,
    pub palette: Palette,
    pub max_pixels_available: u32,
    /// Unix seconds.
    pub created_at: u64,
}

impl BoardInfo {
    /// Converts a board-relative timestamp to unix seconds.
    pub fn unix_time(&self, relative_seconds: u32) -> u64 {
        self.created_at + relative_seconds as u64
    }
}

#[derive(Deserialize)]
struct RawBoardInfo {
    name: String,
    shape: Vec<[u32; 2]>,
    palette: Palette,
    max_pixels_available: u32,
    created_at: u64,
}

/// Parses board metadata, reporting a degenerate shape as
/// [`ProtocolError::Shape`] rather than as a generic parse failure.
pub fn parse_board_info(text: &str) -> Result<BoardInfo, ProtocolError> {
    let raw: RawBoardInfo = serde_json::from_str(text).map_err(ProtocolError::Malformed)?;
    let shape = Shape::from_pairs(&raw.shape).map_err(ProtocolError::Shape)?;
    Ok(BoardInfo {
        name: raw.name,
        shape: Arc::new(shape),
        palette: raw.palette,
        max_pixels_available: raw.max_pixels_available,
        created_at: raw.created_at,
    })
}

/// Partial metadata carried by a board-update; absent fields are unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardInfoPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_optional_shape",
        deserialize_with = "deserialize_optional_shape"
    )]
    pub shape: Option<Arc<Shape>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub palette: Option<Palette>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pixels_available: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<u64>,
}

impl BoardInfoPatch {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

pub(crate) fn shape_to_pairs(shape: &Shape) -> Vec<[u32; 2]> {
    shape
        .levels()
        .iter()
        .map(|Level { width, height }| [*width, *height])
        .collect()
}

fn serialize_shape<S: Serializer>(shape: &Arc<Shape>, serializer: S) -> Result<S::Ok, S::Error> {
    shape_to_pairs(shape).serialize(serializer)
}

fn deserialize_shape<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Arc<Shape>, D::Error> {
    let pairs = Vec::<[u32; 2]>::deserialize(deserializer)?;
    Shape::from_pairs(&pairs)
        .map(Arc::new)
        .map_err(serde::de::Error::custom)
}

fn serialize_optional_shape<S: Serializer>(
    shape: &Option<Arc<Shape>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    shape.as_deref().map(shape_to_pairs).serialize(serializer)
}

fn deserialize_optional_shape<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Arc<Shape>>, D::Error> {
    let pairs = Option::<Vec<[u32; 2]>>::deserialize(deserializer)?;
    pairs
        .map(|pairs| {
            Shape::from_pairs(&pairs)
                .map(Arc::new)
                .map_err(serde::de::Error::custom)
        })
        .transpose()
}
