//! Detail-level selection for a view over the unit board.
//!
//! View boxes are expressed relative to the board: `(0, 0)` is the top-left
//! corner and `(1, 1)` the bottom-right one.

use crate::{Shape, TilePos};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewBox {
    pub left: f64,
    pub top: f64,
    pub right: f64,
    pub bottom: f64,
}

impl ViewBox {
    pub const BOARD: Self = Self {
        left: 0.0,
        top: 0.0,
        right: 1.0,
        bottom: 1.0,
    };

    pub fn width(&self) -> f64 {
        self.right - self.left
    }

    pub fn height(&self) -> f64 {
        self.bottom - self.top
    }
}

impl Shape {
    /// The coarsest detail level whose super-tiles are still at least as large
    /// as the view along both axes.
    pub fn detail_level(&self, visible: &ViewBox) -> usize {
        let max_detail = self.depth() - 1;
        let mut tile_width = 1.0f64;
        let mut tile_height = 1.0f64;
        for (detail, level) in self.levels()[..max_detail].iter().enumerate() {
            tile_width /= level.width as f64;
            tile_height /= level.height as f64;
            if visible.width() > tile_width || visible.height() > tile_height {
                return detail;
            }
        }
        max_detail
    }

    /// Detail level used for rendering. Level 0 is never rendered directly
    /// since it always covers the whole board in a single bundle.
    pub fn render_detail_level(&self, visible: &ViewBox) -> usize {
        self.detail_level(visible).clamp(1, self.depth() - 1)
    }

    /// Super-tiles at `detail_level` intersecting the view, row-major.
    pub fn visible_tiles(&self, detail_level: usize, visible: &ViewBox) -> Vec<TilePos> {
        let grid = self.detail_grid(detail_level);
        let clamp = |value: f64, max: u64| -> u64 {
            if value.is_nan() || value <= 0.0 {
                0
            } else {
                (value as u64).min(max)
            }
        };
        let left = clamp((visible.left * grid.width as f64).floor(), grid.width);
        let right = clamp((visible.right * grid.width as f64).ceil(), grid.width);
        let top = clamp((visible.top * grid.height as f64).floor(), grid.height);
        let bottom = clamp((visible.bottom * grid.height as f64).ceil(), grid.height);

        let mut tiles = Vec::new();
        for y in top..bottom {
            for x in left..right {
                tiles.push(TilePos { x, y });
            }
        }
        tiles
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape() -> Shape {
        Shape::from_pairs(&[[1, 1], [3, 2], [2, 2], [4, 4]]).expect("shape")
    }

    #[test]
    fn whole_board_view_selects_coarsest_level() {
        // the leading (1, 1) level never splits the view
        assert_eq!(shape().detail_level(&ViewBox::BOARD), 1);

        let quartered = Shape::from_pairs(&[[2, 2], [2, 2], [4, 4]]).expect("shape");
        assert_eq!(quartered.detail_level(&ViewBox::BOARD), 0);
        assert_eq!(quartered.render_detail_level(&ViewBox::BOARD), 1);
    }

    #[test]
    fn tiny_view_selects_finest_level() {
        let view = ViewBox {
            left: 0.5,
            top: 0.5,
            right: 0.5001,
            bottom: 0.5001,
        };
        assert_eq!(shape().detail_level(&view), 3);
    }

    #[test]
    fn visible_tiles_are_clamped_to_the_grid() {
        let view = ViewBox {
            left: -0.5,
            top: 0.25,
            right: 0.4,
            bottom: 2.0,
        };
        let tiles = shape().visible_tiles(2, &view);
        // grid at level 2 is 3x2; columns 0..2 (ceil of 1.2), rows 0..2
        assert_eq!(
            tiles,
            vec![
                TilePos { x: 0, y: 0 },
                TilePos { x: 1, y: 0 },
                TilePos { x: 0, y: 1 },
                TilePos { x: 1, y: 1 },
            ]
        );
    }
}
