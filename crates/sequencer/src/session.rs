use std::collections::HashMap;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use board_protocol::{
    BoardDataUpdate, BoardEvent, BoardInfo, BoardUpdate, Change, Channel, PixelsAvailable,
    PlaceOverrides, Placement, ProtocolError, parse_event,
};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded, unbounded};
use sectors::{RangeCache, SectorSource, SectorStore, WriteError};
use shape::Shape;
use textures::SectorTextureCache;

use crate::{
    BackendError, BoardBackend, Clock, PlaceOutcome, SequencerError, SessionConfig, SessionError,
    SessionEvent, UndoEntry, UndoList,
};

enum Work {
    Update(Arc<BoardUpdate>),
    /// A reconnect is about to refetch state; everything queued before this
    /// predates the refetch.
    ResyncBegin,
    Resync(Box<Resync>),
    /// An undo entry was added; recompute the prune deadline.
    UndoArmed,
    Shutdown,
}

/// State refetched after a reconnect.
struct Resync {
    info: Option<BoardInfo>,
    cooldown: Option<PixelsAvailable>,
    /// `cooldown_generation` when the refetch started.
    cooldown_since: u64,
}

#[derive(Default)]
struct PlacementDetails {
    entries: HashMap<u64, Placement>,
    /// Bumped on every invalidation so lookups racing an update do not
    /// cache what they fetched.
    generation: u64,
}

impl PlacementDetails {
    fn invalidate(&mut self, positions: Range<u64>) {
        self.generation += 1;
        if positions.end - positions.start <= self.entries.len() as u64 {
            for position in positions {
                self.entries.remove(&position);
            }
        } else {
            self.entries
                .retain(|position, _| !positions.contains(position));
        }
    }
}

struct Shared {
    backend: Arc<dyn BoardBackend>,
    store: Arc<SectorStore>,
    textures: Arc<SectorTextureCache>,
    clock: Arc<dyn Clock>,
    config: SessionConfig,
    info: Mutex<BoardInfo>,
    cooldown: Mutex<PixelsAvailable>,
    details: Mutex<PlacementDetails>,
    undo: Mutex<UndoList>,
    listeners: Mutex<Vec<Sender<SessionEvent>>>,
    /// Bumped by the worker for every applied info patch.
    info_generation: AtomicU64,
    /// `info_generation` as of the last `Work::ResyncBegin`.
    info_mark: AtomicU64,
    /// Bumped for every pixels-available message.
    cooldown_generation: AtomicU64,
    halted: AtomicBool,
    reconnecting: AtomicBool,
    /// Disconnects when the session is dropped.
    closed: Receiver<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A live connection to one board. Dropping it stops the worker thread.
pub struct Session {
    shared: Arc<Shared>,
    work: Sender<Work>,
    worker: Option<JoinHandle<()>>,
    _close: Sender<()>,
}

impl Session {
    /// Fetches metadata and cooldown, then starts the sequencer worker.
    pub fn open<B>(
        backend: Arc<B>,
        clock: Arc<dyn Clock>,
        config: SessionConfig,
    ) -> Result<Self, SessionError>
    where
        B: BoardBackend + SectorSource + 'static,
    {
        config.assert_valid();
        let info = backend.fetch_info()?;
        let cooldown = backend.fetch_cooldown()?;

        let source: Arc<dyn SectorSource> = backend.clone();
        let store = Arc::new(SectorStore::new(Arc::clone(&info.shape), source));
        let textures = Arc::new(SectorTextureCache::new(
            Arc::clone(&store),
            config.max_texture_bundles,
        ));
        log::info!(
            "[sequencer] opened board {:?} shaped {} ({} sectors)",
            info.name,
            info.shape,
            info.shape.sector_count()
        );

        let (close, closed) = bounded(0);
        let shared = Arc::new(Shared {
            backend,
            store,
            textures,
            clock,
            config,
            info: Mutex::new(info),
            cooldown: Mutex::new(cooldown),
            details: Mutex::new(PlacementDetails::default()),
            undo: Mutex::new(UndoList::default()),
            listeners: Mutex::new(Vec::new()),
            info_generation: AtomicU64::new(0),
            info_mark: AtomicU64::new(0),
            cooldown_generation: AtomicU64::new(0),
            halted: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            closed,
        });

        let (work, work_receiver) = unbounded();
        let worker = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("board-sequencer".to_owned())
                .spawn(move || shared.run(work_receiver))
                .map_err(SessionError::Spawn)?
        };

        Ok(Self {
            shared,
            work,
            worker: Some(worker),
            _close: close,
        })
    }

    /// Registers a listener. Listeners are notified in registration order.
    pub fn subscribe(&self) -> Receiver<SessionEvent> {
        let (sender, receiver) = bounded(self.shared.config.listener_capacity);
        lock(&self.shared.listeners).push(sender);
        receiver
    }

    /// Handles one raw event-stream message. Malformed messages are logged
    /// and dropped; the error is returned for diagnostics only.
    pub fn receive(&self, text: &str) -> Result<(), ProtocolError> {
        match parse_event(text) {
            Ok(event) => self.submit(event),
            Err(error) => {
                log::warn!("[sequencer] discarding malformed message: {error}");
                Err(error)
            }
        }
    }

    /// Hands an already parsed event to the sequencer. Events failing
    /// validation are logged and dropped.
    pub fn submit(&self, event: BoardEvent) -> Result<(), ProtocolError> {
        if let Err(error) = event.validate() {
            log::warn!("[sequencer] discarding invalid {}: {error}", event.kind());
            return Err(error);
        }
        match event {
            BoardEvent::BoardUpdate(update) => self.enqueue(Work::Update(Arc::new(update))),
            BoardEvent::PixelsAvailable(pixels) => {
                *lock(&self.shared.cooldown) = pixels;
                self.shared
                    .cooldown_generation
                    .fetch_add(1, Ordering::SeqCst);
                self.shared.notify(SessionEvent::PixelsAvailable(pixels));
            }
        }
        Ok(())
    }

    fn enqueue(&self, work: Work) {
        if self.work.send(work).is_err() {
            log::error!("[sequencer] worker is gone, dropping work");
        }
    }

    /// Places `color` at `position` unless the cached color already matches.
    pub fn place(&self, position: u64, color: u32, overrides: PlaceOverrides) -> PlaceOutcome {
        let shared = &self.shared;
        if position >= shared.store.shape().pixel_count() {
            return PlaceOutcome::Rejected(BackendError::Refused(format!(
                "position {position} is outside the board"
            )));
        }
        match shared.store.pixel(Channel::Colors, position) {
            Ok(current) if current == color => {
                log::debug!("[sequencer] pixel {position} already has color {color}");
                return PlaceOutcome::Unchanged;
            }
            Ok(_) => {}
            Err(error) => {
                log::warn!("[sequencer] color of pixel {position} unknown ({error}), placing anyway");
            }
        }

        match shared.backend.place(position, color, overrides) {
            Ok(receipt) => {
                if let Some(deadline) = receipt.undo_deadline {
                    lock(&shared.undo).push(UndoEntry {
                        placement: receipt.placement,
                        deadline,
                    });
                    self.enqueue(Work::UndoArmed);
                }
                PlaceOutcome::Placed(receipt)
            }
            Err(error) => {
                log::warn!("[sequencer] placing at {position} failed: {error}");
                PlaceOutcome::Rejected(error)
            }
        }
    }

    /// Who last placed `position` and when; cached until the pixel changes.
    pub fn lookup(&self, position: u64) -> Result<Option<Placement>, BackendError> {
        let generation = {
            let details = lock(&self.shared.details);
            if let Some(placement) = details.entries.get(&position) {
                return Ok(Some(*placement));
            }
            details.generation
        };
        let placement = self.shared.backend.lookup(position)?;
        if let Some(placement) = placement {
            let mut details = lock(&self.shared.details);
            if details.generation == generation {
                details.entries.insert(position, placement);
            }
        }
        Ok(placement)
    }

    /// Called by the transport when the event stream drops. Reconnection runs
    /// in the background; a second call while it runs is ignored.
    pub fn connection_lost(&self) {
        if self.shared.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let work = self.work.clone();
        let spawned = thread::Builder::new()
            .name("board-reconnect".to_owned())
            .spawn(move || shared.reconnect(work));
        if let Err(error) = spawned {
            log::error!("[sequencer] cannot start reconnect: {error}");
            self.shared.reconnecting.store(false, Ordering::SeqCst);
            self.shared
                .notify(SessionEvent::ConnectionLost { attempts: 0 });
        }
    }

    pub fn info(&self) -> BoardInfo {
        lock(&self.shared.info).clone()
    }

    pub fn shape(&self) -> Arc<Shape> {
        Arc::clone(self.shared.store.shape())
    }

    pub fn cooldown(&self) -> PixelsAvailable {
        *lock(&self.shared.cooldown)
    }

    /// Placements that can still be undone now.
    pub fn undo_entries(&self) -> Vec<UndoEntry> {
        lock(&self.shared.undo).entries_at(self.shared.clock.now())
    }

    /// Undo entries not yet pruned by the worker, live or not.
    pub fn pending_undo_len(&self) -> usize {
        lock(&self.shared.undo).len()
    }

    pub fn store(&self) -> &Arc<SectorStore> {
        &self.shared.store
    }

    pub fn textures(&self) -> &Arc<SectorTextureCache> {
        &self.shared.textures
    }

    pub fn is_halted(&self) -> bool {
        self.shared.halted.load(Ordering::SeqCst)
    }

    pub fn is_reconnecting(&self) -> bool {
        self.shared.reconnecting.load(Ordering::SeqCst)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.work.send(Work::Shutdown);
        if let Some(handle) = self.worker.take() {
            handle
                .join()
                .unwrap_or_else(|_| log::error!("[sequencer] worker thread panicked"));
        }
    }
}

impl Shared {
    fn run(&self, work: Receiver<Work>) {
        loop {
            let next_deadline = lock(&self.undo).next_deadline();
            let received = match next_deadline {
                Some(deadline) => work.recv_timeout(deadline.saturating_sub(self.clock.now())),
                None => work.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            match received {
                Ok(Work::Update(update)) => self.apply_update(update),
                Ok(Work::ResyncBegin) => {
                    let generation = self.info_generation.load(Ordering::SeqCst);
                    self.info_mark.store(generation, Ordering::SeqCst);
                }
                Ok(Work::Resync(resync)) => self.apply_resync(*resync),
                Ok(Work::UndoArmed) | Err(RecvTimeoutError::Timeout) => {}
                Ok(Work::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            }
            let pruned = lock(&self.undo).prune(self.clock.now());
            if pruned > 0 {
                log::debug!("[sequencer] {pruned} undo entries expired");
            }
        }
        log::debug!("[sequencer] worker stopped");
    }

    fn notify(&self, event: SessionEvent) {
        lock(&self.listeners).retain(|listener| match listener.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                log::warn!(
                    "[sequencer] listener queue full, dropping {} event",
                    event.kind()
                );
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    fn halt(&self, error: SequencerError) {
        log::error!("[sequencer] {error}; no further board updates are applied");
        self.halted.store(true, Ordering::SeqCst);
        self.notify(SessionEvent::Fatal(error));
    }

    fn apply_update(&self, update: Arc<BoardUpdate>) {
        if self.halted.load(Ordering::SeqCst) {
            log::debug!("[sequencer] session halted, dropping board-update");
            return;
        }
        if let Some(patch) = &update.info {
            let patched = lock(&self.info).apply_patch(patch);
            if let Err(mismatch) = patched {
                self.halt(SequencerError::ShapeChangeUnsupported(mismatch));
                return;
            }
            self.info_generation.fetch_add(1, Ordering::SeqCst);
        }
        if let Some(data) = &update.data {
            log::debug!("[sequencer] applying board-update to {:?}", data.channels());
            for (channel, change) in data.iter() {
                self.apply_change(channel, change);
            }
        }
        self.notify(SessionEvent::BoardUpdate(update));
    }

    fn apply_change(&self, channel: Channel, change: &Change) {
        let shape = self.store.shape();
        let pixel_count = shape.pixel_count();
        let range = change.range();
        if range.is_empty() {
            log::warn!("[sequencer] empty {channel:?} change at {}, skipped", range.start);
            return;
        }
        if range.end > pixel_count {
            log::warn!(
                "[sequencer] {channel:?} change {range:?} exceeds the board ({pixel_count} pixels), skipped"
            );
            return;
        }

        let cache = self.store.channel(channel);
        match change.values() {
            Some(values) => write_values(shape, cache, range.start, values),
            None => {
                let leaf_pixels = shape.leaf_pixels();
                let sectors = range.start / leaf_pixels..(range.end - 1) / leaf_pixels + 1;
                cache.invalidate_range(sectors);
            }
        }
        self.textures.apply_change(channel, change);
        if matches!(channel, Channel::Colors | Channel::Timestamps) {
            lock(&self.details).invalidate(range);
        }
    }

    fn apply_resync(&self, resync: Resync) {
        let info_changed = self.info_generation.load(Ordering::SeqCst)
            != self.info_mark.load(Ordering::SeqCst);
        let cooldown_changed =
            self.cooldown_generation.load(Ordering::SeqCst) != resync.cooldown_since;
        match resync.info {
            Some(info) if info_changed => {
                log::info!(
                    "[sequencer] board info patched while reconnecting, keeping it over {:?}",
                    info.name
                );
            }
            Some(info) => {
                let mut current = lock(&self.info);
                if *info.shape != *current.shape {
                    let mismatch = board_protocol::ShapeMismatch {
                        current: current.shape.to_string(),
                        proposed: info.shape.to_string(),
                    };
                    drop(current);
                    self.halt(SequencerError::ShapeChangeUnsupported(mismatch));
                    return;
                }
                *current = BoardInfo {
                    shape: Arc::clone(&current.shape),
                    ..info
                };
            }
            None => {}
        }
        match resync.cooldown {
            Some(_) if cooldown_changed => {
                log::info!("[sequencer] cooldown changed while reconnecting, keeping it");
            }
            Some(cooldown) => *lock(&self.cooldown) = cooldown,
            None => {}
        }
    }

    fn reconnect(&self, work: Sender<Work>) {
        let attempts = self.config.reconnect_attempts;
        for attempt in 0..attempts {
            match self
                .closed
                .recv_timeout(self.config.reconnect_delay(attempt))
            {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    self.reconnecting.store(false, Ordering::SeqCst);
                    return;
                }
            }
            log::info!("[sequencer] reconnect attempt {}/{attempts}", attempt + 1);
            if let Err(error) = self.backend.reconnect() {
                log::warn!("[sequencer] reconnect attempt {} failed: {error}", attempt + 1);
                continue;
            }

            let cooldown_since = self.cooldown_generation.load(Ordering::SeqCst);
            if work.send(Work::ResyncBegin).is_err() {
                log::debug!("[sequencer] session closed during reconnect");
                self.reconnecting.store(false, Ordering::SeqCst);
                return;
            }
            let info = self
                .backend
                .fetch_info()
                .inspect_err(|error| log::warn!("[sequencer] refetching info failed: {error}"))
                .ok();
            let cooldown = self
                .backend
                .fetch_cooldown()
                .inspect_err(|error| log::warn!("[sequencer] refetching cooldown failed: {error}"))
                .ok();
            let everything = BoardUpdate {
                info: None,
                data: Some(BoardDataUpdate::full_board(
                    self.store.shape().pixel_count(),
                )),
            };
            let queued = work
                .send(Work::Resync(Box::new(Resync {
                    info,
                    cooldown,
                    cooldown_since,
                })))
                .and_then(|()| work.send(Work::Update(Arc::new(everything))));
            if queued.is_err() {
                log::debug!("[sequencer] session closed during reconnect");
            }
            self.reconnecting.store(false, Ordering::SeqCst);
            return;
        }

        log::error!("[sequencer] giving up after {attempts} reconnect attempts");
        self.reconnecting.store(false, Ordering::SeqCst);
        self.notify(SessionEvent::ConnectionLost { attempts });
    }
}

/// Splits a run of values at sector boundaries and writes each piece into the
/// resident sector, invalidating sectors that are not resident.
fn write_values(shape: &Shape, cache: &RangeCache, start: u64, values: &[u32]) {
    let leaf_pixels = shape.leaf_pixels();
    let mut position = start;
    let mut remaining = values;
    while !remaining.is_empty() {
        let (sector, offset) = shape.position_to_sector(position);
        let take = ((leaf_pixels - offset) as usize).min(remaining.len());
        let (piece, rest) = remaining.split_at(take);
        match cache.write(sector, offset, piece) {
            Ok(()) => {}
            Err(WriteError::NotResident) => {
                cache.invalidate(sector);
            }
            Err(error) => {
                log::warn!("[sequencer] {:?} sector {sector}: {error}", cache.channel());
                cache.invalidate(sector);
            }
        }
        position += take as u64;
        remaining = rest;
    }
}
