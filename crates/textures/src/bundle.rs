use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use board_protocol::Channel;
use sectors::SectorStore;
use shape::{Extent, MergeInstructions};

use crate::TextureError;

struct Resource {
    dirty: AtomicBool,
    buffer: Mutex<Option<Arc<[u8]>>>,
}

impl Resource {
    fn new() -> Self {
        Self {
            dirty: AtomicBool::new(false),
            buffer: Mutex::new(None),
        }
    }

    fn buffer(&self) -> MutexGuard<'_, Option<Arc<[u8]>>> {
        self.buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Assembled buffers of one super-tile, one per channel. Each buffer is built
/// on first access and rebuilt on the first access after an invalidation.
pub struct SectorTextures {
    level: usize,
    node: u64,
    instructions: MergeInstructions,
    store: Arc<SectorStore>,
    resources: [Resource; 4],
}

impl SectorTextures {
    pub(crate) fn new(
        level: usize,
        node: u64,
        instructions: MergeInstructions,
        store: Arc<SectorStore>,
    ) -> Self {
        Self {
            level,
            node,
            instructions,
            store,
            resources: std::array::from_fn(|_| Resource::new()),
        }
    }

    /// Canonical detail level of the bundle.
    pub fn level(&self) -> usize {
        self.level
    }

    pub fn node(&self) -> u64 {
        self.node
    }

    pub fn size(&self) -> Extent {
        self.instructions.output_size()
    }

    pub fn instructions(&self) -> &MergeInstructions {
        &self.instructions
    }

    pub fn colors(&self) -> Result<Arc<[u8]>, TextureError> {
        self.channel(Channel::Colors)
    }

    pub fn timestamps(&self) -> Result<Arc<[u8]>, TextureError> {
        self.channel(Channel::Timestamps)
    }

    pub fn mask(&self) -> Result<Arc<[u8]>, TextureError> {
        self.channel(Channel::Mask)
    }

    pub fn initial(&self) -> Result<Arc<[u8]>, TextureError> {
        self.channel(Channel::Initial)
    }

    pub fn invalidate_colors(&self) {
        self.invalidate(Channel::Colors);
    }

    pub fn invalidate_timestamps(&self) {
        self.invalidate(Channel::Timestamps);
    }

    pub fn invalidate_mask(&self) {
        self.invalidate(Channel::Mask);
    }

    pub fn invalidate_initial(&self) {
        self.invalidate(Channel::Initial);
    }

    fn resource(&self, channel: Channel) -> &Resource {
        &self.resources[channel as usize]
    }

    /// Assembled buffer of a channel, row-major over `size()`.
    pub fn channel(&self, channel: Channel) -> Result<Arc<[u8]>, TextureError> {
        let resource = self.resource(channel);
        let mut buffer = resource.buffer();
        let dirty = resource.dirty.swap(false, Ordering::AcqRel);
        if !dirty && let Some(built) = &*buffer {
            return Ok(Arc::clone(built));
        }

        match self.assemble(channel) {
            Ok(built) => {
                *buffer = Some(Arc::clone(&built));
                Ok(built)
            }
            Err(error) => {
                resource.dirty.store(true, Ordering::Release);
                Err(error)
            }
        }
    }

    fn assemble(&self, channel: Channel) -> Result<Arc<[u8]>, TextureError> {
        let cache = self.store.channel(channel);
        let sectors = self
            .instructions
            .sector_indices()
            .iter()
            .map(|sector| cache.get(*sector))
            .collect::<Result<Vec<_>, _>>()?;
        let slices: Vec<&[u8]> = sectors.iter().map(|bytes| bytes.as_slice()).collect();
        let merged = self.instructions.merge(&slices)?;
        log::trace!(
            "[textures] built {channel:?} for level {} node {} ({} sectors)",
            self.level,
            self.node,
            sectors.len()
        );
        Ok(merged.into())
    }

    /// Marks the channel for rebuild; repeated calls coalesce.
    pub fn invalidate(&self, channel: Channel) {
        self.resource(channel).dirty.store(true, Ordering::Release);
    }

    pub fn is_dirty(&self, channel: Channel) -> bool {
        self.resource(channel).dirty.load(Ordering::Acquire)
    }

    pub fn is_built(&self, channel: Channel) -> bool {
        self.resource(channel).buffer().is_some()
    }

    pub(crate) fn built_count(&self) -> usize {
        Channel::ALL
            .into_iter()
            .filter(|channel| self.is_built(*channel))
            .count()
    }
}
