// ----------------------------------------------------------------------------
// Open-Resolution Reservoir - Whole-Lifetime Accumulator
// ----------------------------------------------------------------------------

use tracing::warn;

use super::archive::Archive;
use super::{Reservoir, ReservoirKind, Snapshot};

/// A single window that never closes. Its snapshot always spans from
/// creation until the query instant.
#[derive(Debug, Clone)]
pub struct OneValueReservoir {
    archive: Archive,
    last_timestamp: Option<i64>,
}

impl OneValueReservoir {
    pub fn new(now: i64, max_raw_values: usize) -> Self {
        Self {
            archive: Archive::open(now, max_raw_values),
            last_timestamp: None,
        }
    }
}

impl Reservoir for OneValueReservoir {
    fn update(&mut self, timestamp: i64, value: i64) -> bool {
        if self.last_timestamp.map_or(false, |last| timestamp < last) {
            warn!(
                target: "vitals::reservoir",
                timestamp,
                "Dropping update older than the last accepted timestamp"
            );
            return false;
        }
        self.last_timestamp = Some(timestamp);
        self.archive.update(timestamp, value);
        true
    }

    fn last_timestamp(&self) -> Option<i64> {
        self.last_timestamp
    }

    fn snapshot(&self, now: i64, _resolution: Option<i64>) -> Option<Snapshot> {
        Some(self.archive.snapshot(Some(now.max(self.archive.start()))))
    }

    fn snapshots(&self, _start: i64, _end: i64, _resolution: i64) -> Vec<Snapshot> {
        Vec::new()
    }

    fn all_snapshots(&self, now: i64, resolution: Option<i64>) -> Vec<Snapshot> {
        self.snapshot(now, resolution).into_iter().collect()
    }

    fn resolutions(&self) -> Vec<i64> {
        Vec::new()
    }

    fn kind(&self) -> ReservoirKind {
        ReservoirKind::OpenResolution
    }
}
