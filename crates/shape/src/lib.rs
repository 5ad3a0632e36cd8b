//! Board geometry.
//!
//! A board is described by an ordered list of levels, coarsest first. Every
//! level but the last is a grouping factor (how many sub-cells a parent cell
//! is split into along each axis); the last level is the pixel size of one
//! leaf block, a "sector".
//!
//! Cells are numbered with a mixed-radix scheme: at each level the sub-cells
//! are enumerated row-major (`y * width + x`) and that index becomes one digit
//! whose place value is the footprint of everything nested below it. For
//! levels `[[2, 2], [2, 2]]` viewed as sectors the numbering is
//!
//! ```text
//!  0  1  4  5
//!  2  3  6  7
//!  8  9 12 13
//! 10 11 14 15
//! ```

use std::fmt;

use smallvec::SmallVec;

mod merge;
mod viewport;

pub use merge::{MergeError, MergeInstructions};
pub use viewport::ViewBox;

/// Per-level digits of a hierarchical address, coarsest first.
pub type IndexArray = SmallVec<[u64; 8]>;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Level {
    pub width: u32,
    pub height: u32,
}

impl Level {
    pub const UNIT: Self = Self {
        width: 1,
        height: 1,
    };

    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub const fn is_unit(self) -> bool {
        self.width == 1 && self.height == 1
    }

    pub const fn cells(self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Extent {
    pub width: u64,
    pub height: u64,
}

impl Extent {
    pub const fn area(self) -> u64 {
        self.width * self.height
    }
}

impl From<Level> for Extent {
    fn from(level: Level) -> Self {
        Self {
            width: level.width as u64,
            height: level.height as u64,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TilePos {
    pub x: u64,
    pub y: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeError {
    /// No levels at all: the board cannot be addressed.
    Empty,
    ZeroDimension { level: usize },
    /// The board's pixel count does not fit in 64 bits.
    Overflow,
    OutOfBounds,
    AddressTooLong { depth: usize, length: usize },
}

impl fmt::Display for ShapeError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShapeError::Empty => write!(formatter, "degenerate board shape: no levels"),
            ShapeError::ZeroDimension { level } => {
                write!(formatter, "board shape level {level} has a zero dimension")
            }
            ShapeError::Overflow => write!(formatter, "board shape is too large to address"),
            ShapeError::OutOfBounds => write!(formatter, "coordinates or address out of bounds"),
            ShapeError::AddressTooLong { depth, length } => write!(
                formatter,
                "address of length {length} is deeper than the shape ({depth} levels)"
            ),
        }
    }
}

impl std::error::Error for ShapeError {}

/// Immutable board geometry. Always at least two levels deep.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shape {
    levels: Box<[Level]>,
}

impl Shape {
    /// Builds a shape from wire levels. A single level is normalized by
    /// prepending `(1, 1)`.
    pub fn new(levels: Vec<Level>) -> Result<Self, ShapeError> {
        if levels.is_empty() {
            return Err(ShapeError::Empty);
        }
        if let Some(level) = levels.iter().position(|l| l.width == 0 || l.height == 0) {
            return Err(ShapeError::ZeroDimension { level });
        }
        let levels = if levels.len() == 1 {
            vec![Level::UNIT, levels[0]]
        } else {
            levels
        };

        let mut width = 1u64;
        let mut height = 1u64;
        for level in &levels {
            width = width
                .checked_mul(level.width as u64)
                .ok_or(ShapeError::Overflow)?;
            height = height
                .checked_mul(level.height as u64)
                .ok_or(ShapeError::Overflow)?;
        }
        width.checked_mul(height).ok_or(ShapeError::Overflow)?;

        Ok(Self {
            levels: levels.into_boxed_slice(),
        })
    }

    pub fn from_pairs(pairs: &[[u32; 2]]) -> Result<Self, ShapeError> {
        Self::new(pairs.iter().map(|[w, h]| Level::new(*w, *h)).collect())
    }

    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    pub fn level(&self, index: usize) -> Option<Level> {
        self.levels.get(index).copied()
    }

    pub fn as_slice(&self) -> ShapeSlice<'_> {
        ShapeSlice {
            levels: &self.levels,
        }
    }

    /// Levels `[start, end)`. Panics when the range is outside the shape.
    pub fn slice(&self, start: usize, end: usize) -> ShapeSlice<'_> {
        ShapeSlice {
            levels: &self.levels[start..end],
        }
    }

    /// The hierarchy with the leaf pixel level stripped: every unit is a sector.
    pub fn sectors(&self) -> ShapeSlice<'_> {
        self.as_slice().sectors()
    }

    pub fn size(&self) -> Extent {
        self.as_slice().size()
    }

    pub fn leaf_size(&self) -> Level {
        self.levels[self.levels.len() - 1]
    }

    pub fn leaf_pixels(&self) -> u64 {
        self.leaf_size().cells()
    }

    pub fn pixel_count(&self) -> u64 {
        self.size().area()
    }

    pub fn sector_count(&self) -> u64 {
        self.sectors().size().area()
    }

    /// `(sector index, offset within sector)` for an absolute pixel position.
    pub fn position_to_sector(&self, position: u64) -> (u64, u64) {
        let leaf_pixels = self.leaf_pixels();
        (position / leaf_pixels, position % leaf_pixels)
    }

    pub fn coordinates_to_index_array(&self, x: u64, y: u64) -> Result<IndexArray, ShapeError> {
        self.as_slice().coordinates_to_index_array(x, y)
    }

    /// Absolute pixel position of an address; a short address yields the first
    /// pixel of the node it selects.
    pub fn index_array_to_position(&self, address: &[u64]) -> Result<u64, ShapeError> {
        self.as_slice().index_array_to_position(address)
    }

    /// Sector index of an address over the sectors-only view.
    pub fn index_array_to_sector(&self, address: &[u64]) -> Result<u64, ShapeError> {
        self.sectors().index_array_to_position(address)
    }

    pub fn position_to_coordinates(&self, position: u64) -> Result<TilePos, ShapeError> {
        self.as_slice().position_to_coordinates(position)
    }

    pub fn coordinates_to_position(&self, x: u64, y: u64) -> Result<u64, ShapeError> {
        let address = self.coordinates_to_index_array(x, y)?;
        self.index_array_to_position(&address)
    }

    /// Grid of super-tiles visible at `detail_level`: product of the levels
    /// above it.
    pub fn detail_grid(&self, detail_level: usize) -> Extent {
        self.slice(0, detail_level).size()
    }

    /// Pixel footprint of one super-tile at `detail_level`.
    pub fn footprint(&self, detail_level: usize) -> Extent {
        self.slice(detail_level, self.depth()).size()
    }

    /// Lists, row-major, every leaf sector below the node selected by
    /// `prefix`.
    pub fn merge_sectors(&self, prefix: &[u64]) -> Result<MergeInstructions, ShapeError> {
        let sector_depth = self.depth() - 1;
        if prefix.len() > sector_depth {
            return Err(ShapeError::AddressTooLong {
                depth: sector_depth,
                length: prefix.len(),
            });
        }
        let first_sector = self.index_array_to_sector(prefix)?;

        let subsection = self.slice(prefix.len(), self.depth());
        let subsection_sectors = subsection.sectors();
        let sectors = subsection_sectors.size();

        let mut sector_indices = Vec::with_capacity(sectors.area() as usize);
        for y in 0..sectors.height {
            for x in 0..sectors.width {
                let address = subsection_sectors.coordinates_to_index_array(x, y)?;
                let offset = subsection_sectors.index_array_to_position(&address)?;
                sector_indices.push(first_sector + offset);
            }
        }

        Ok(MergeInstructions::new(
            subsection.size(),
            self.leaf_size(),
            sector_indices,
        ))
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "[")?;
        for (index, level) in self.levels.iter().enumerate() {
            if index > 0 {
                write!(formatter, ", ")?;
            }
            write!(formatter, "[{}, {}]", level.width, level.height)?;
        }
        write!(formatter, "]")
    }
}

/// A borrowed run of levels. Slices may be empty or a single level deep; an
/// empty slice addresses exactly one cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShapeSlice<'a> {
    levels: &'a [Level],
}

impl<'a> ShapeSlice<'a> {
    pub fn depth(self) -> usize {
        self.levels.len()
    }

    pub fn levels(self) -> &'a [Level] {
        self.levels
    }

    pub fn sectors(self) -> ShapeSlice<'a> {
        match self.levels.split_last() {
            Some((_, rest)) => ShapeSlice { levels: rest },
            None => self,
        }
    }

    pub fn size(self) -> Extent {
        self.levels
            .iter()
            .fold(Extent { width: 1, height: 1 }, |extent, level| Extent {
                width: extent.width * level.width as u64,
                height: extent.height * level.height as u64,
            })
    }

    pub fn coordinates_to_index_array(self, x: u64, y: u64) -> Result<IndexArray, ShapeError> {
        let mut below = self.size();
        if x >= below.width || y >= below.height {
            return Err(ShapeError::OutOfBounds);
        }

        let mut x = x;
        let mut y = y;
        let mut address = IndexArray::with_capacity(self.levels.len());
        for level in self.levels {
            below = Extent {
                width: below.width / level.width as u64,
                height: below.height / level.height as u64,
            };
            let cell_x = x / below.width;
            let cell_y = y / below.height;
            address.push(cell_y * level.width as u64 + cell_x);
            x %= below.width;
            y %= below.height;
        }
        Ok(address)
    }

    pub fn index_array_to_position(self, address: &[u64]) -> Result<u64, ShapeError> {
        if address.len() > self.levels.len() {
            return Err(ShapeError::AddressTooLong {
                depth: self.levels.len(),
                length: address.len(),
            });
        }

        let mut below = self.size().area();
        let mut position = 0u64;
        for (digit, level) in address.iter().zip(self.levels) {
            if *digit >= level.cells() {
                return Err(ShapeError::OutOfBounds);
            }
            below /= level.cells();
            position += digit * below;
        }
        Ok(position)
    }

    pub fn position_to_coordinates(self, position: u64) -> Result<TilePos, ShapeError> {
        let mut below = self.size();
        if position >= below.area() {
            return Err(ShapeError::OutOfBounds);
        }

        let mut remainder = position;
        let mut coordinates = TilePos { x: 0, y: 0 };
        for level in self.levels {
            below = Extent {
                width: below.width / level.width as u64,
                height: below.height / level.height as u64,
            };
            let place = below.area();
            let digit = remainder / place;
            remainder %= place;
            coordinates.x += (digit % level.width as u64) * below.width;
            coordinates.y += (digit / level.width as u64) * below.height;
        }
        Ok(coordinates)
    }
}
