use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};

use super::*;

fn shape() -> Shape {
    Shape::from_pairs(&[[2, 2], [2, 2], [2, 2]]).expect("shape")
}

/// Answers fetch `n` (1-based) with bytes all equal to `n`. Fetches listed in
/// `gated` announce themselves on `started` and block until `release` fires.
struct CountingSource {
    fetches: AtomicUsize,
    gated: Vec<usize>,
    failing: Vec<usize>,
    started: Sender<usize>,
    release: Receiver<()>,
}

struct Harness {
    source: Arc<CountingSource>,
    started: Receiver<usize>,
    release: Sender<()>,
}

fn harness(gated: &[usize], failing: &[usize]) -> Harness {
    let (started_sender, started) = unbounded();
    let (release, release_receiver) = unbounded();
    Harness {
        source: Arc::new(CountingSource {
            fetches: AtomicUsize::new(0),
            gated: gated.to_vec(),
            failing: failing.to_vec(),
            started: started_sender,
            release: release_receiver,
        }),
        started,
        release,
    }
}

impl CountingSource {
    fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl SectorSource for CountingSource {
    fn fetch_sector(&self, _channel: Channel, range: Range<u64>) -> Result<Vec<u8>, FetchError> {
        let fetch = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
        if self.gated.contains(&fetch) {
            self.started.send(fetch).expect("announce fetch");
            self.release.recv().expect("release fetch");
        }
        if self.failing.contains(&fetch) {
            return Err(FetchError::Transport(format!("fetch {fetch} refused")));
        }
        Ok(vec![fetch as u8; (range.end - range.start) as usize])
    }
}

#[test]
fn concurrent_gets_share_one_fetch() {
    let harness = harness(&[1], &[]);
    let cache = Arc::new(RangeCache::new(
        Channel::Colors,
        &shape(),
        harness.source.clone(),
    ));

    let first = {
        let cache = Arc::clone(&cache);
        thread::spawn(move || cache.get(3))
    };
    assert_eq!(harness.started.recv_timeout(Duration::from_secs(5)), Ok(1));
    let second = {
        let cache = Arc::clone(&cache);
        thread::spawn(move || cache.get(3))
    };
    thread::sleep(Duration::from_millis(20));
    harness.release.send(()).expect("release");

    let first = first.join().expect("first reader").expect("first get");
    let second = second.join().expect("second reader").expect("second get");
    assert_eq!(harness.source.fetch_count(), 1);
    assert_eq!(first.as_slice(), &[1, 1, 1, 1]);
    assert!(Arc::ptr_eq(&first, &second));
}

#[test]
fn fetch_reads_the_sector_byte_range() {
    struct RangeEcho;
    impl SectorSource for RangeEcho {
        fn fetch_sector(
            &self,
            channel: Channel,
            range: Range<u64>,
        ) -> Result<Vec<u8>, FetchError> {
            assert_eq!(channel, Channel::Timestamps);
            assert_eq!(range, 5 * 16..6 * 16);
            Ok(vec![0; 16])
        }
    }

    let cache = RangeCache::new(Channel::Timestamps, &shape(), Arc::new(RangeEcho));
    assert_eq!(cache.sector_bytes(), 16);
    assert!(cache.get(5).is_ok());
}

#[test]
fn invalidate_forces_refetch() {
    let harness = harness(&[], &[]);
    let cache = RangeCache::new(Channel::Colors, &shape(), harness.source.clone());

    assert_eq!(cache.get(0).expect("get").as_slice(), &[1; 4]);
    assert_eq!(cache.get(0).expect("get").as_slice(), &[1; 4]);
    assert!(cache.invalidate(0));
    assert!(!cache.invalidate(0));
    assert_eq!(cache.get(0).expect("get").as_slice(), &[2; 4]);
    assert_eq!(harness.source.fetch_count(), 2);
}

#[test]
fn failures_stick_until_invalidated() {
    let harness = harness(&[], &[1]);
    let cache = RangeCache::new(Channel::Mask, &shape(), harness.source.clone());

    assert!(matches!(cache.get(7), Err(FetchError::Transport(_))));
    assert!(matches!(cache.get(7), Err(FetchError::Transport(_))));
    assert_eq!(harness.source.fetch_count(), 1);
    assert_eq!(cache.peek(7), None);
    assert!(cache.contains(7));

    cache.invalidate(7);
    assert_eq!(cache.get(7).expect("refetch").as_slice(), &[2; 4]);
}

#[test]
fn out_of_range_sectors_and_short_reads_are_errors() {
    let harness = harness(&[], &[]);
    let cache = RangeCache::new(Channel::Colors, &shape(), harness.source.clone());
    assert_eq!(
        cache.get(16),
        Err(FetchError::OutOfBounds {
            sector: 16,
            sector_count: 16
        })
    );
    assert_eq!(harness.source.fetch_count(), 0);

    struct Short;
    impl SectorSource for Short {
        fn fetch_sector(&self, _: Channel, _: Range<u64>) -> Result<Vec<u8>, FetchError> {
            Ok(vec![0; 3])
        }
    }
    let cache = RangeCache::new(Channel::Colors, &shape(), Arc::new(Short));
    assert_eq!(
        cache.get(0),
        Err(FetchError::Length {
            expected: 4,
            actual: 3
        })
    );
}

#[test]
fn stale_completion_does_not_replace_newer_slot() {
    let harness = harness(&[1], &[]);
    let cache = Arc::new(RangeCache::new(
        Channel::Colors,
        &shape(),
        harness.source.clone(),
    ));

    let stale = {
        let cache = Arc::clone(&cache);
        thread::spawn(move || cache.get(9))
    };
    assert_eq!(harness.started.recv_timeout(Duration::from_secs(5)), Ok(1));

    assert!(cache.invalidate(9));
    assert_eq!(cache.get(9).expect("fresh get").as_slice(), &[2; 4]);

    harness.release.send(()).expect("release");
    let stale = stale.join().expect("stale reader").expect("stale get");
    assert_eq!(stale.as_slice(), &[1; 4]);
    assert_eq!(cache.peek(9).expect("resident").as_slice(), &[2; 4]);
    assert_eq!(cache.resident_len(), 1);
}

#[test]
fn invalidate_range_drops_only_covered_sectors() {
    let harness = harness(&[], &[]);
    let cache = RangeCache::new(Channel::Colors, &shape(), harness.source.clone());
    for sector in [0, 3, 4, 8, 15] {
        cache.get(sector).expect("get");
    }

    assert_eq!(cache.invalidate_range(3..9), 3);
    assert_eq!(cache.resident_len(), 2);
    assert!(cache.contains(0));
    assert!(cache.contains(15));

    assert_eq!(cache.invalidate_range(0..u64::MAX), 2);
    assert_eq!(cache.resident_len(), 0);
}

#[test]
fn write_patches_resident_sectors_only() {
    let harness = harness(&[], &[]);
    let cache = RangeCache::new(Channel::Colors, &shape(), harness.source.clone());

    assert_eq!(cache.write(2, 0, &[5]), Err(WriteError::NotResident));

    let before = cache.get(2).expect("get");
    cache.write(2, 1, &[7, 8]).expect("write");
    assert_eq!(cache.peek(2).expect("resident").as_slice(), &[1, 7, 8, 1]);
    assert_eq!(before.as_slice(), &[1; 4], "readers keep their snapshot");

    assert_eq!(
        cache.write(2, 3, &[1, 2]),
        Err(WriteError::OutOfBounds {
            offset: 3,
            length: 2,
            sector_pixels: 4
        })
    );
    assert_eq!(
        cache.write(2, 0, &[300]),
        Err(WriteError::ValueOutOfRange { value: 300 })
    );
    assert_eq!(harness.source.fetch_count(), 1);
}

#[test]
fn timestamp_writes_are_little_endian() {
    let harness = harness(&[], &[]);
    let cache = RangeCache::new(Channel::Timestamps, &shape(), harness.source.clone());
    cache.get(0).expect("get");
    cache.write(0, 3, &[0x0102_0304]).expect("write");
    let bytes = cache.peek(0).expect("resident");
    assert_eq!(&bytes[12..16], &[4, 3, 2, 1]);
    assert_eq!(&bytes[..12], &[1; 12]);
}

#[test]
fn store_reads_single_pixels_per_channel() {
    let harness = harness(&[], &[]);
    let store = SectorStore::new(Arc::new(shape()), harness.source.clone());

    assert_eq!(store.pixel(Channel::Colors, 13), Ok(1));
    store
        .channel(Channel::Colors)
        .write(3, 1, &[42])
        .expect("write");
    assert_eq!(store.pixel(Channel::Colors, 13), Ok(42));
    // second fetch overall, every byte is 2
    assert_eq!(store.pixel(Channel::Timestamps, 13), Ok(0x0202_0202));
    assert_eq!(store.resident_len(), 2);

    store.clear();
    assert_eq!(store.resident_len(), 0);
}
