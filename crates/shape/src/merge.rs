use std::fmt;

use crate::{Extent, Level};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeError {
    BufferCount {
        expected: usize,
        actual: usize,
    },
    /// The first buffer is empty or not a whole number of elements per pixel.
    ElementWidth {
        length: usize,
        leaf_pixels: u64,
    },
    BufferLength {
        index: usize,
        expected: usize,
        actual: usize,
    },
    OutputTooLarge,
}

impl fmt::Display for MergeError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeError::BufferCount { expected, actual } => write!(
                formatter,
                "merge expected {expected} sector buffers, got {actual}"
            ),
            MergeError::ElementWidth {
                length,
                leaf_pixels,
            } => write!(
                formatter,
                "sector buffer of {length} bytes does not hold {leaf_pixels} whole pixels"
            ),
            MergeError::BufferLength {
                index,
                expected,
                actual,
            } => write!(
                formatter,
                "sector buffer {index} is {actual} bytes, expected {expected}"
            ),
            MergeError::OutputTooLarge => write!(formatter, "merged buffer does not fit in memory"),
        }
    }
}

impl std::error::Error for MergeError {}

/// Which leaf sectors, in row-major block order, cover a sub-region of the
/// board. A recipe only; holds no pixel data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeInstructions {
    output_size: Extent,
    leaf_size: Level,
    sector_indices: Vec<u64>,
}

impl MergeInstructions {
    pub fn new(output_size: Extent, leaf_size: Level, sector_indices: Vec<u64>) -> Self {
        assert!(
            leaf_size.width > 0 && leaf_size.height > 0,
            "leaf size must be non-empty"
        );
        assert!(
            output_size.width % leaf_size.width as u64 == 0
                && output_size.height % leaf_size.height as u64 == 0,
            "output size must be a whole number of leaf blocks"
        );
        let blocks = (output_size.width / leaf_size.width as u64)
            * (output_size.height / leaf_size.height as u64);
        assert!(
            sector_indices.len() as u64 <= blocks,
            "{} sectors do not fit in {blocks} leaf blocks",
            sector_indices.len()
        );
        Self {
            output_size,
            leaf_size,
            sector_indices,
        }
    }

    pub fn output_size(&self) -> Extent {
        self.output_size
    }

    pub fn leaf_size(&self) -> Level {
        self.leaf_size
    }

    pub fn sector_indices(&self) -> &[u64] {
        &self.sector_indices
    }

    pub fn sectors_per_row(&self) -> u64 {
        self.output_size.width / self.leaf_size.width as u64
    }

    /// Concatenates leaf buffers into one row-major buffer of
    /// `output_size` pixels. Buffer `i` belongs to `sector_indices[i]` and
    /// lands at block `(i % sectors_per_row, i / sectors_per_row)`; for a
    /// contiguous run `i` equals `sector_indices[i] - sector_indices[0]`.
    pub fn merge<B: AsRef<[u8]>>(&self, buffers: &[B]) -> Result<Vec<u8>, MergeError> {
        if buffers.len() != self.sector_indices.len() {
            return Err(MergeError::BufferCount {
                expected: self.sector_indices.len(),
                actual: buffers.len(),
            });
        }
        let Some(first) = buffers.first() else {
            return Ok(Vec::new());
        };

        let leaf_pixels = self.leaf_size.cells();
        let sector_length = first.as_ref().len();
        if sector_length == 0 || sector_length as u64 % leaf_pixels != 0 {
            return Err(MergeError::ElementWidth {
                length: sector_length,
                leaf_pixels,
            });
        }
        let element_width = sector_length / leaf_pixels as usize;
        for (index, buffer) in buffers.iter().enumerate() {
            let actual = buffer.as_ref().len();
            if actual != sector_length {
                return Err(MergeError::BufferLength {
                    index,
                    expected: sector_length,
                    actual,
                });
            }
        }

        let leaf_row_bytes = self.leaf_size.width as usize * element_width;
        let leaf_height = self.leaf_size.height as usize;
        let output_row_bytes = usize::try_from(self.output_size.width)
            .ok()
            .and_then(|width| width.checked_mul(element_width))
            .ok_or(MergeError::OutputTooLarge)?;
        let output_length = usize::try_from(self.output_size.height)
            .ok()
            .and_then(|height| height.checked_mul(output_row_bytes))
            .ok_or(MergeError::OutputTooLarge)?;
        let sectors_per_row = self.sectors_per_row() as usize;

        let mut output = vec![0u8; output_length];
        for (index, buffer) in buffers.iter().enumerate() {
            let buffer = buffer.as_ref();
            let block_x = index % sectors_per_row;
            let block_y = index / sectors_per_row;
            let start = block_x * leaf_row_bytes + block_y * leaf_height * output_row_bytes;
            for row in 0..leaf_height {
                let source = &buffer[row * leaf_row_bytes..(row + 1) * leaf_row_bytes];
                let destination = start + row * output_row_bytes;
                output[destination..destination + leaf_row_bytes].copy_from_slice(source);
            }
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled_sectors(indices: &[u64], bytes_per_sector: usize) -> Vec<Vec<u8>> {
        indices
            .iter()
            .map(|index| vec![*index as u8; bytes_per_sector])
            .collect()
    }

    #[test]
    fn merge_places_two_by_two_block_byte_for_byte() {
        let instructions = MergeInstructions::new(
            Extent {
                width: 4,
                height: 4,
            },
            Level::new(2, 2),
            vec![8, 9, 10, 11],
        );
        let sectors = filled_sectors(instructions.sector_indices(), 4);

        let merged = instructions.merge(&sectors).expect("merge");

        #[rustfmt::skip]
        let expected = vec![
            8, 8, 9, 9,
            8, 8, 9, 9,
            10, 10, 11, 11,
            10, 10, 11, 11,
        ];
        assert_eq!(merged, expected);
    }

    #[test]
    fn merge_keeps_four_byte_elements_together() {
        let instructions = MergeInstructions::new(
            Extent {
                width: 2,
                height: 1,
            },
            Level::new(1, 1),
            vec![0, 1],
        );
        let sectors = vec![
            0x0102_0304u32.to_le_bytes().to_vec(),
            0x0506_0708u32.to_le_bytes().to_vec(),
        ];

        let merged = instructions.merge(&sectors).expect("merge");

        assert_eq!(merged, vec![4, 3, 2, 1, 8, 7, 6, 5]);
    }

    #[test]
    fn merge_rejects_wrong_buffer_count_and_lengths() {
        let instructions = MergeInstructions::new(
            Extent {
                width: 2,
                height: 2,
            },
            Level::new(1, 2),
            vec![0, 1],
        );

        assert_eq!(
            instructions.merge(&[vec![0u8; 2]]),
            Err(MergeError::BufferCount {
                expected: 2,
                actual: 1
            })
        );
        assert_eq!(
            instructions.merge(&[vec![0u8; 3], vec![0u8; 3]]),
            Err(MergeError::ElementWidth {
                length: 3,
                leaf_pixels: 2
            })
        );
        assert_eq!(
            instructions.merge(&[vec![0u8; 2], vec![0u8; 4]]),
            Err(MergeError::BufferLength {
                index: 1,
                expected: 2,
                actual: 4
            })
        );
    }

    #[test]
    #[should_panic(expected = "3 sectors do not fit in 2 leaf blocks")]
    fn more_sectors_than_blocks_are_refused() {
        MergeInstructions::new(
            Extent {
                width: 4,
                height: 2,
            },
            Level::new(2, 2),
            vec![0, 1, 2],
        );
    }
}
