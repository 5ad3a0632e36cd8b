//! Per-channel sector caches.
//!
//! Every sector of every channel is fetched at most once until invalidated.
//! Concurrent readers of a missing sector share one fetch: the first caller
//! inserts a pending slot and fetches on its own thread, later callers block
//! on the slot until it resolves.

use std::collections::HashMap;
use std::fmt;
use std::ops::Range;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use board_protocol::Channel;
use shape::Shape;

/// Immutable view of a resident sector. Writes copy on demand.
pub type SectorBytes = Arc<Vec<u8>>;

/// Byte-range reads against the board's channel resources.
pub trait SectorSource: Send + Sync {
    /// Reads bytes `range` of `channel`. The range always covers exactly one
    /// sector.
    fn fetch_sector(&self, channel: Channel, range: Range<u64>) -> Result<Vec<u8>, FetchError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    Transport(String),
    Length { expected: u64, actual: usize },
    OutOfBounds { sector: u64, sector_count: u64 },
    /// The fetching thread unwound before resolving the slot.
    Abandoned,
}

impl fmt::Display for FetchError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::Transport(message) => write!(formatter, "sector fetch failed: {message}"),
            FetchError::Length { expected, actual } => write!(
                formatter,
                "sector fetch returned {actual} bytes, expected {expected}"
            ),
            FetchError::OutOfBounds {
                sector,
                sector_count,
            } => write!(
                formatter,
                "sector {sector} is outside the board ({sector_count} sectors)"
            ),
            FetchError::Abandoned => write!(formatter, "sector fetch was abandoned"),
        }
    }
}

impl std::error::Error for FetchError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteError {
    /// Nothing usable is cached for the sector; the caller should invalidate.
    NotResident,
    OutOfBounds {
        offset: u64,
        length: usize,
        sector_pixels: u64,
    },
    ValueOutOfRange {
        value: u32,
    },
}

impl fmt::Display for WriteError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteError::NotResident => write!(formatter, "sector is not resident"),
            WriteError::OutOfBounds {
                offset,
                length,
                sector_pixels,
            } => write!(
                formatter,
                "write of {length} values at {offset} exceeds the {sector_pixels} pixel sector"
            ),
            WriteError::ValueOutOfRange { value } => {
                write!(formatter, "value {value} does not fit the channel")
            }
        }
    }
}

impl std::error::Error for WriteError {}

enum SlotState {
    Pending,
    Ready(SectorBytes),
    Failed(FetchError),
}

struct Slot {
    state: Mutex<SlotState>,
    resolved: Condvar,
}

impl Slot {
    fn pending() -> Self {
        Self {
            state: Mutex::new(SlotState::Pending),
            resolved: Condvar::new(),
        }
    }

    fn resolve(&self, state: SlotState) {
        *lock(&self.state) = state;
        self.resolved.notify_all();
    }

    fn wait(&self) -> MutexGuard<'_, SlotState> {
        let mut state = lock(&self.state);
        while matches!(*state, SlotState::Pending) {
            state = self
                .resolved
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        state
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Resolves the slot as abandoned if the fetch unwinds, so waiters never hang.
struct FetchGuard<'a> {
    slot: &'a Slot,
    armed: bool,
}

impl Drop for FetchGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.slot.resolve(SlotState::Failed(FetchError::Abandoned));
        }
    }
}

/// Sector cache of one channel.
pub struct RangeCache {
    channel: Channel,
    sector_pixels: u64,
    sector_bytes: u64,
    sector_count: u64,
    source: Arc<dyn SectorSource>,
    slots: Mutex<HashMap<u64, Arc<Slot>>>,
}

impl RangeCache {
    pub fn new(channel: Channel, shape: &Shape, source: Arc<dyn SectorSource>) -> Self {
        let sector_pixels = shape.leaf_pixels();
        let sector_bytes = sector_pixels
            .checked_mul(channel.bytes_per_pixel())
            .expect("sector byte size overflow");
        Self {
            channel,
            sector_pixels,
            sector_bytes,
            sector_count: shape.sector_count(),
            source,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn sector_bytes(&self) -> u64 {
        self.sector_bytes
    }

    /// Returns the sector's bytes, fetching them on first use. A failure stays
    /// cached until the sector is invalidated.
    pub fn get(&self, sector: u64) -> Result<SectorBytes, FetchError> {
        if sector >= self.sector_count {
            return Err(FetchError::OutOfBounds {
                sector,
                sector_count: self.sector_count,
            });
        }

        let (slot, owner) = {
            let mut slots = lock(&self.slots);
            match slots.get(&sector) {
                Some(slot) => (Arc::clone(slot), false),
                None => {
                    let slot = Arc::new(Slot::pending());
                    slots.insert(sector, Arc::clone(&slot));
                    (slot, true)
                }
            }
        };

        if owner {
            self.fetch_into(sector, &slot);
        }

        match &*slot.wait() {
            SlotState::Ready(bytes) => Ok(Arc::clone(bytes)),
            SlotState::Failed(error) => Err(error.clone()),
            SlotState::Pending => unreachable!("slot wait returned while pending"),
        }
    }

    // The slot may have been invalidated while the fetch ran; it then resolves
    // detached from the map and never replaces a newer slot.
    fn fetch_into(&self, sector: u64, slot: &Slot) {
        let mut guard = FetchGuard { slot, armed: true };
        let start = sector * self.sector_bytes;
        log::debug!(
            "[sectors] fetching {:?} sector {sector} bytes {start}..{}",
            self.channel,
            start + self.sector_bytes
        );
        let state = match self
            .source
            .fetch_sector(self.channel, start..start + self.sector_bytes)
        {
            Ok(bytes) if bytes.len() as u64 == self.sector_bytes => {
                SlotState::Ready(Arc::new(bytes))
            }
            Ok(bytes) => SlotState::Failed(FetchError::Length {
                expected: self.sector_bytes,
                actual: bytes.len(),
            }),
            Err(error) => SlotState::Failed(error),
        };
        if let SlotState::Failed(error) = &state {
            log::warn!(
                "[sectors] {:?} sector {sector} failed: {error}",
                self.channel
            );
        }
        guard.armed = false;
        slot.resolve(state);
    }

    /// Ready bytes of a sector without fetching or waiting.
    pub fn peek(&self, sector: u64) -> Option<SectorBytes> {
        let slot = lock(&self.slots).get(&sector).cloned()?;
        match &*lock(&slot.state) {
            SlotState::Ready(bytes) => Some(Arc::clone(bytes)),
            SlotState::Pending | SlotState::Failed(_) => None,
        }
    }

    /// Whether a slot exists for the sector in any state.
    pub fn contains(&self, sector: u64) -> bool {
        lock(&self.slots).contains_key(&sector)
    }

    pub fn resident_len(&self) -> usize {
        lock(&self.slots).len()
    }

    pub fn invalidate(&self, sector: u64) -> bool {
        lock(&self.slots).remove(&sector).is_some()
    }

    /// Drops every slot whose sector lies in `sectors`. Returns how many were
    /// dropped.
    pub fn invalidate_range(&self, sectors: Range<u64>) -> usize {
        let mut slots = lock(&self.slots);
        let before = slots.len();
        if sectors.end.saturating_sub(sectors.start) <= before as u64 {
            for sector in sectors {
                slots.remove(&sector);
            }
        } else {
            slots.retain(|sector, _| !sectors.contains(sector));
        }
        before - slots.len()
    }

    pub fn clear(&self) {
        lock(&self.slots).clear();
    }

    /// Overwrites `values.len()` pixels starting at `offset` within a resident
    /// sector. Waits for a pending fetch to land first.
    pub fn write(&self, sector: u64, offset: u64, values: &[u32]) -> Result<(), WriteError> {
        let in_bounds = offset
            .checked_add(values.len() as u64)
            .is_some_and(|end| end <= self.sector_pixels);
        if !in_bounds {
            return Err(WriteError::OutOfBounds {
                offset,
                length: values.len(),
                sector_pixels: self.sector_pixels,
            });
        }

        let slot = lock(&self.slots)
            .get(&sector)
            .cloned()
            .ok_or(WriteError::NotResident)?;
        let mut state = slot.wait();
        let SlotState::Ready(bytes) = &mut *state else {
            return Err(WriteError::NotResident);
        };

        let width = self.channel.bytes_per_pixel() as usize;
        let mut encoded = Vec::with_capacity(values.len() * width);
        for value in values {
            let element = self
                .channel
                .encode_value(*value)
                .ok_or(WriteError::ValueOutOfRange { value: *value })?;
            encoded.extend_from_slice(&element[..width]);
        }
        let start = offset as usize * width;
        Arc::make_mut(bytes)[start..start + encoded.len()].copy_from_slice(&encoded);
        Ok(())
    }
}

/// The four channel caches of one board.
pub struct SectorStore {
    shape: Arc<Shape>,
    colors: RangeCache,
    timestamps: RangeCache,
    mask: RangeCache,
    initial: RangeCache,
}

impl SectorStore {
    pub fn new(shape: Arc<Shape>, source: Arc<dyn SectorSource>) -> Self {
        let cache = |channel| RangeCache::new(channel, &shape, Arc::clone(&source));
        Self {
            colors: cache(Channel::Colors),
            timestamps: cache(Channel::Timestamps),
            mask: cache(Channel::Mask),
            initial: cache(Channel::Initial),
            shape,
        }
    }

    pub fn shape(&self) -> &Arc<Shape> {
        &self.shape
    }

    pub fn channel(&self, channel: Channel) -> &RangeCache {
        match channel {
            Channel::Colors => &self.colors,
            Channel::Timestamps => &self.timestamps,
            Channel::Mask => &self.mask,
            Channel::Initial => &self.initial,
        }
    }

    /// Single pixel value of a channel, fetching its sector if needed.
    pub fn pixel(&self, channel: Channel, position: u64) -> Result<u32, FetchError> {
        let (sector, offset) = self.shape.position_to_sector(position);
        let bytes = self.channel(channel).get(sector)?;
        let width = channel.bytes_per_pixel() as usize;
        let start = offset as usize * width;
        let value = match channel {
            Channel::Timestamps => u32::from_le_bytes([
                bytes[start],
                bytes[start + 1],
                bytes[start + 2],
                bytes[start + 3],
            ]),
            Channel::Colors | Channel::Mask | Channel::Initial => u32::from(bytes[start]),
        };
        Ok(value)
    }

    pub fn resident_len(&self) -> usize {
        Channel::ALL
            .into_iter()
            .map(|channel| self.channel(channel).resident_len())
            .sum()
    }

    pub fn clear(&self) {
        for channel in Channel::ALL {
            self.channel(channel).clear();
        }
    }
}

#[cfg(test)]
mod tests;
