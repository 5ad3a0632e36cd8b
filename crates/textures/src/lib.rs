//! Assembled super-tile buffers per detail level.
//!
//! A bundle at detail level `d` covers one cell of `shape.detail_grid(d)` and
//! is keyed by its node index, the mixed-radix index of that cell, which is
//! `position / footprint(d)` for every pixel inside it. Levels only separated
//! by `(1, 1)` grouping factors share bundles.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use board_protocol::{Change, Channel};
use lru::LruCache;
use sectors::{FetchError, SectorStore};
use shape::{MergeError, Shape, ShapeError};

mod bundle;

pub use bundle::SectorTextures;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextureError {
    OutOfBounds { level: usize, x: u64, y: u64 },
    Fetch(FetchError),
    Merge(MergeError),
}

impl fmt::Display for TextureError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TextureError::OutOfBounds { level, x, y } => {
                write!(formatter, "tile ({x}, {y}) is outside detail level {level}")
            }
            TextureError::Fetch(error) => write!(formatter, "{error}"),
            TextureError::Merge(error) => write!(formatter, "{error}"),
        }
    }
}

impl std::error::Error for TextureError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TextureError::OutOfBounds { .. } => None,
            TextureError::Fetch(error) => Some(error),
            TextureError::Merge(error) => Some(error),
        }
    }
}

impl From<FetchError> for TextureError {
    fn from(error: FetchError) -> Self {
        TextureError::Fetch(error)
    }
}

impl From<MergeError> for TextureError {
    fn from(error: MergeError) -> Self {
        TextureError::Merge(error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct BundleKey {
    level: usize,
    node: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TextureStats {
    pub bundles: usize,
    pub built_buffers: usize,
    pub touched_since_prune: usize,
    pub evicted_total: u64,
}

struct CacheState {
    bundles: LruCache<BundleKey, Arc<SectorTextures>>,
    touched: HashSet<BundleKey>,
    evicted_total: u64,
}

pub struct SectorTextureCache {
    shape: Arc<Shape>,
    store: Arc<SectorStore>,
    canonical_levels: Vec<usize>,
    max_bundles: usize,
    state: Mutex<CacheState>,
}

impl SectorTextureCache {
    /// `max_bundles` is the number of bundles kept after a prune, not counting
    /// bundles requested since the previous prune.
    pub fn new(store: Arc<SectorStore>, max_bundles: usize) -> Self {
        assert!(max_bundles > 0, "texture bundle budget must be positive");
        let shape = Arc::clone(store.shape());
        let canonical_levels = canonical_levels(&shape);
        Self {
            shape,
            store,
            canonical_levels,
            max_bundles,
            state: Mutex::new(CacheState {
                bundles: LruCache::unbounded(),
                touched: HashSet::new(),
                evicted_total: 0,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn shape(&self) -> &Arc<Shape> {
        &self.shape
    }

    /// Lowest detail level rendering identically to `level`. Panics when
    /// `level` is not below the shape's depth.
    pub fn canonical_level(&self, level: usize) -> usize {
        self.canonical_levels[level]
    }

    /// Bundle of the super-tile at `(x, y)` of `detail_grid(level)`. Buffers
    /// are not built until accessed.
    pub fn get(&self, level: usize, x: u64, y: u64) -> Result<Arc<SectorTextures>, TextureError> {
        let out_of_bounds = TextureError::OutOfBounds { level, x, y };
        if level >= self.shape.depth() {
            return Err(out_of_bounds);
        }
        let level = self.canonical_level(level);
        let grid = self.shape.slice(0, level);
        let prefix = match grid.coordinates_to_index_array(x, y) {
            Ok(prefix) => prefix,
            Err(ShapeError::OutOfBounds) => return Err(out_of_bounds),
            Err(error) => panic!("tile address of an in-range level failed: {error}"),
        };
        let node = grid
            .index_array_to_position(&prefix)
            .expect("address built from in-bounds coordinates");
        let key = BundleKey { level, node };

        let mut state = self.state();
        state.touched.insert(key);
        if let Some(bundle) = state.bundles.get(&key) {
            return Ok(Arc::clone(bundle));
        }

        let instructions = self
            .shape
            .merge_sectors(&prefix)
            .expect("prefix is shorter than the sector depth");
        let bundle = Arc::new(SectorTextures::new(
            level,
            node,
            instructions,
            Arc::clone(&self.store),
        ));
        state.bundles.put(key, Arc::clone(&bundle));
        Ok(bundle)
    }

    /// Marks `channel` dirty on every resident bundle whose footprint overlaps
    /// the change. Returns the number of bundles marked.
    pub fn apply_change(&self, channel: Channel, change: &Change) -> usize {
        let range = change.range();
        if range.is_empty() {
            return 0;
        }
        let last = range.end - 1;

        let state = self.state();
        let mut marked = 0;
        for level in self.distinct_levels() {
            let footprint = self.shape.footprint(level).area();
            let first_node = range.start / footprint;
            let last_node = last / footprint;
            let span = last_node - first_node + 1;

            if span <= state.bundles.len() as u64 {
                for node in first_node..=last_node {
                    if let Some(bundle) = state.bundles.peek(&BundleKey { level, node }) {
                        bundle.invalidate(channel);
                        marked += 1;
                    }
                }
            } else {
                for (key, bundle) in state.bundles.iter() {
                    if key.level == level && (first_node..=last_node).contains(&key.node) {
                        bundle.invalidate(channel);
                        marked += 1;
                    }
                }
            }
        }
        marked
    }

    /// Marks every resident bundle dirty for every channel.
    pub fn invalidate_all(&self) {
        let state = self.state();
        for (_, bundle) in state.bundles.iter() {
            for channel in Channel::ALL {
                bundle.invalidate(channel);
            }
        }
    }

    /// Called once per render pass. Evicts least recently requested bundles
    /// beyond the budget; bundles requested since the previous prune are the
    /// current viewport and always survive.
    pub fn prune(&self) -> usize {
        let mut state = self.state();
        let mut evicted = 0;
        while state.bundles.len() > self.max_bundles {
            let Some((key, _)) = state.bundles.peek_lru() else {
                break;
            };
            if state.touched.contains(key) {
                // everything more recent was requested this pass too
                break;
            }
            state.bundles.pop_lru();
            evicted += 1;
        }
        state.touched.clear();
        state.evicted_total += evicted as u64;
        if evicted > 0 {
            log::debug!(
                "[textures] pruned {evicted} bundles, {} resident",
                state.bundles.len()
            );
        }
        evicted
    }

    pub fn stats(&self) -> TextureStats {
        let state = self.state();
        TextureStats {
            bundles: state.bundles.len(),
            built_buffers: state
                .bundles
                .iter()
                .map(|(_, bundle)| bundle.built_count())
                .sum(),
            touched_since_prune: state.touched.len(),
            evicted_total: state.evicted_total,
        }
    }

    fn distinct_levels(&self) -> impl Iterator<Item = usize> + '_ {
        self.canonical_levels
            .iter()
            .enumerate()
            .filter(|(level, canonical)| *level == **canonical)
            .map(|(level, _)| level)
    }
}

fn canonical_levels(shape: &Shape) -> Vec<usize> {
    let detail_levels = shape.depth();
    let mut canonical = Vec::with_capacity(detail_levels);
    for level in 0..detail_levels {
        let alias = match level.checked_sub(1) {
            Some(above) if shape.levels()[above].is_unit() => canonical[above],
            _ => level,
        };
        canonical.push(alias);
    }
    canonical
}
