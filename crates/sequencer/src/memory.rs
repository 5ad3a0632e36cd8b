//! A board held entirely in memory.
//!
//! Every pixel's color starts out as the index of its sector (truncated to a
//! byte), timestamps start at zero and every pixel is placeable.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use board_protocol::{
    BoardInfo, Channel, PixelsAvailable, PlaceOverrides, Placement, PlacementReceipt,
    encode_timestamps,
};
use sectors::{FetchError, SectorSource};

use crate::{BackendError, BoardBackend, Clock};

struct Planes {
    colors: Vec<u8>,
    timestamps: Vec<u32>,
    mask: Vec<u8>,
    initial: Vec<u8>,
    placed: HashMap<u64, Placement>,
}

pub struct MemoryBoard {
    info: Mutex<BoardInfo>,
    planes: Mutex<Planes>,
    cooldown: Mutex<PixelsAvailable>,
    clock: Arc<dyn Clock>,
    undo_window: Option<u64>,
    online: AtomicBool,
    reconnect_failures: AtomicU32,
    sector_fetches: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryBoard {
    pub fn new(info: BoardInfo, clock: Arc<dyn Clock>) -> Self {
        let pixel_count =
            usize::try_from(info.shape.pixel_count()).expect("board too large to hold in memory");
        let leaf_pixels = info.shape.leaf_pixels();
        let colors: Vec<u8> = (0..pixel_count as u64)
            .map(|position| (position / leaf_pixels) as u8)
            .collect();
        let cooldown = PixelsAvailable {
            count: info.max_pixels_available,
            next: None,
        };
        Self {
            planes: Mutex::new(Planes {
                initial: colors.clone(),
                colors,
                timestamps: vec![0; pixel_count],
                mask: vec![1; pixel_count],
                placed: HashMap::new(),
            }),
            info: Mutex::new(info),
            cooldown: Mutex::new(cooldown),
            clock,
            undo_window: None,
            online: AtomicBool::new(true),
            reconnect_failures: AtomicU32::new(0),
            sector_fetches: AtomicUsize::new(0),
        }
    }

    /// Placements may be undone for `seconds` after they are made.
    pub fn with_undo_window(mut self, seconds: u64) -> Self {
        self.undo_window = Some(seconds);
        self
    }

    /// While offline every request fails with a transport error.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// The next `count` reconnect attempts fail.
    pub fn fail_reconnects(&self, count: u32) {
        self.reconnect_failures.store(count, Ordering::SeqCst);
    }

    pub fn set_info(&self, info: BoardInfo) {
        *lock(&self.info) = info;
    }

    pub fn set_cooldown(&self, cooldown: PixelsAvailable) {
        *lock(&self.cooldown) = cooldown;
    }

    pub fn sector_fetches(&self) -> usize {
        self.sector_fetches.load(Ordering::SeqCst)
    }

    pub fn color_at(&self, position: u64) -> Option<u8> {
        lock(&self.planes).colors.get(position as usize).copied()
    }

    /// Marks a pixel as not placeable without overrides.
    pub fn mask_pixel(&self, position: u64) {
        if let Some(mask) = lock(&self.planes).mask.get_mut(position as usize) {
            *mask = 0;
        }
    }

    fn ensure_online(&self) -> Result<(), BackendError> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BackendError::Transport("board is offline".to_owned()))
        }
    }
}

impl SectorSource for MemoryBoard {
    fn fetch_sector(&self, channel: Channel, range: Range<u64>) -> Result<Vec<u8>, FetchError> {
        self.sector_fetches.fetch_add(1, Ordering::SeqCst);
        if !self.online.load(Ordering::SeqCst) {
            return Err(FetchError::Transport("board is offline".to_owned()));
        }
        let width = channel.bytes_per_pixel();
        let pixels = (range.start / width) as usize..(range.end / width) as usize;
        let planes = lock(&self.planes);
        let not_satisfiable = || {
            FetchError::Transport(format!("{}: range {range:?} not satisfiable", channel.path()))
        };
        let bytes = match channel {
            Channel::Colors => planes.colors.get(pixels).map(<[u8]>::to_vec),
            Channel::Mask => planes.mask.get(pixels).map(<[u8]>::to_vec),
            Channel::Initial => planes.initial.get(pixels).map(<[u8]>::to_vec),
            Channel::Timestamps => planes.timestamps.get(pixels).map(encode_timestamps),
        };
        bytes.ok_or_else(not_satisfiable)
    }
}

impl BoardBackend for MemoryBoard {
    fn fetch_info(&self) -> Result<BoardInfo, BackendError> {
        self.ensure_online()?;
        Ok(lock(&self.info).clone())
    }

    fn fetch_cooldown(&self) -> Result<PixelsAvailable, BackendError> {
        self.ensure_online()?;
        Ok(*lock(&self.cooldown))
    }

    fn place(
        &self,
        position: u64,
        color: u32,
        overrides: PlaceOverrides,
    ) -> Result<PlacementReceipt, BackendError> {
        self.ensure_online()?;
        let info = lock(&self.info).clone();
        if position >= info.shape.pixel_count() {
            return Err(BackendError::Refused(format!(
                "position {position} is outside the board"
            )));
        }
        if !overrides.color {
            match info.palette.get(color) {
                None => return Err(BackendError::Refused(format!("unknown color {color}"))),
                Some(entry) if entry.system_only => {
                    return Err(BackendError::Refused(format!("color {color} is reserved")));
                }
                Some(_) => {}
            }
        }
        let Ok(byte) = u8::try_from(color) else {
            return Err(BackendError::Refused(format!("unknown color {color}")));
        };

        let mut planes = lock(&self.planes);
        let index = position as usize;
        if planes.mask[index] == 0 && !overrides.mask {
            return Err(BackendError::Refused(format!("pixel {position} is masked")));
        }
        let mut cooldown = lock(&self.cooldown);
        if cooldown.count == 0 && !overrides.cooldown {
            return Err(BackendError::Refused("no pixels available".to_owned()));
        }

        let now = self.clock.now().as_secs();
        let modified = u32::try_from(now.saturating_sub(info.created_at)).unwrap_or(u32::MAX);
        let placement = Placement {
            position,
            color,
            modified,
        };
        planes.colors[index] = byte;
        planes.timestamps[index] = modified;
        planes.placed.insert(position, placement);
        if !overrides.cooldown {
            cooldown.count -= 1;
        }

        Ok(PlacementReceipt {
            placement,
            undo_deadline: self.undo_window.map(|window| now + window),
        })
    }

    fn lookup(&self, position: u64) -> Result<Option<Placement>, BackendError> {
        self.ensure_online()?;
        Ok(lock(&self.planes).placed.get(&position).copied())
    }

    fn reconnect(&self) -> Result<(), BackendError> {
        let remaining = self.reconnect_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.reconnect_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(BackendError::Transport("connection refused".to_owned()));
        }
        self.set_online(true);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use board_protocol::{Color, Palette, decode_timestamps};
    use shape::Shape;

    use super::*;
    use crate::ManualClock;

    fn board() -> MemoryBoard {
        let palette = Palette(BTreeMap::from([
            (
                0,
                Color {
                    name: "White".to_owned(),
                    value: 0xFFFF_FFFF,
                    system_only: false,
                },
            ),
            (
                7,
                Color {
                    name: "Black".to_owned(),
                    value: 0x0000_00FF,
                    system_only: false,
                },
            ),
        ]));
        let info = BoardInfo {
            name: "memory".to_owned(),
            shape: Arc::new(Shape::from_pairs(&[[2, 2], [2, 2]]).expect("shape")),
            palette,
            max_pixels_available: 1,
            created_at: 1_000,
        };
        MemoryBoard::new(info, Arc::new(ManualClock::new(Duration::from_secs(1_060))))
            .with_undo_window(30)
    }

    #[test]
    fn colors_start_as_sector_indices() {
        let board = board();
        let bytes = board
            .fetch_sector(Channel::Colors, 8..12)
            .expect("fetch sector");
        assert_eq!(bytes, vec![2, 2, 2, 2]);
        assert!(board.fetch_sector(Channel::Colors, 16..20).is_err());
        assert_eq!(board.sector_fetches(), 2);
    }

    #[test]
    fn place_updates_planes_and_spends_cooldown() {
        let board = board();
        let receipt = board
            .place(5, 7, PlaceOverrides::NONE)
            .expect("place");
        assert_eq!(
            receipt.placement,
            Placement {
                position: 5,
                color: 7,
                modified: 60
            }
        );
        assert_eq!(receipt.undo_deadline, Some(1_090));
        assert_eq!(board.color_at(5), Some(7));
        let timestamps = board
            .fetch_sector(Channel::Timestamps, 16..32)
            .expect("fetch timestamps");
        assert_eq!(decode_timestamps(&timestamps), vec![0, 60, 0, 0]);
        assert_eq!(board.lookup(5).expect("lookup"), Some(receipt.placement));
        assert_eq!(board.lookup(6).expect("lookup"), None);

        assert!(matches!(
            board.place(6, 7, PlaceOverrides::NONE),
            Err(BackendError::Refused(_))
        ));
        let overrides = PlaceOverrides {
            cooldown: true,
            ..PlaceOverrides::NONE
        };
        assert!(board.place(6, 7, overrides).is_ok());
    }

    #[test]
    fn place_checks_palette_and_mask() {
        let board = board();
        assert!(matches!(
            board.place(0, 3, PlaceOverrides::NONE),
            Err(BackendError::Refused(_))
        ));
        board.mask_pixel(0);
        assert!(matches!(
            board.place(0, 7, PlaceOverrides::NONE),
            Err(BackendError::Refused(_))
        ));
        let overrides = PlaceOverrides {
            mask: true,
            ..PlaceOverrides::NONE
        };
        assert!(board.place(0, 7, overrides).is_ok());
    }

    #[test]
    fn offline_board_refuses_until_reconnected() {
        let board = board();
        board.set_online(false);
        board.fail_reconnects(1);
        assert!(matches!(
            board.fetch_info(),
            Err(BackendError::Transport(_))
        ));
        assert!(board.reconnect().is_err());
        assert!(board.reconnect().is_ok());
        assert!(board.fetch_cooldown().is_ok());
    }
}
