use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Progress of one background encode, shared with its handle.
///
/// The encoding thread records how many bytes it has handed to the sink and
/// the granule position reached; the handle turns those into stream time and
/// an encode speed relative to real time.
#[derive(Debug)]
pub(crate) struct EncodeProgress {
    started: Instant,
    sample_rate: u32,
    bytes_written: AtomicU64,
    granule: AtomicU64,
}

impl EncodeProgress {
    pub(crate) fn new(sample_rate: u32) -> Self {
        Self {
            started: Instant::now(),
            sample_rate: sample_rate.max(1),
            bytes_written: AtomicU64::new(0),
            granule: AtomicU64::new(0),
        }
    }

    pub(crate) fn record(&self, bytes_written: u64, granule: u64) {
        self.bytes_written.store(bytes_written, Ordering::Relaxed);
        self.granule.store(granule, Ordering::Relaxed);
    }

    pub(crate) fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// Stream seconds covered so far. Granules count frames per channel.
    pub(crate) fn position_secs(&self) -> f64 {
        self.granule.load(Ordering::Relaxed) as f64 / f64::from(self.sample_rate)
    }

    /// Stream seconds produced per wall-clock second; 0 before any time passed.
    pub(crate) fn speed(&self) -> f64 {
        let wall = self.started.elapsed().as_secs_f64();
        if wall > 0.0 {
            self.position_secs() / wall
        } else {
            0.0
        }
    }
}
