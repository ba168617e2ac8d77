// ----------------------------------------------------------------------------
// Round-Robin Reservoir - Multi-Resolution Fixed-Memory Storage
// ----------------------------------------------------------------------------

use tracing::warn;

use super::archive::ArchiveContainer;
use super::{Reservoir, ReservoirKind, ReservoirSpec, Snapshot};

/// One ring buffer of windows per configured resolution. Resolutions are
/// strictly increasing multiples of `step`, the finest equal to `step`.
#[derive(Debug, Clone)]
pub struct RoundRobinReservoir {
    step: i64,
    containers: Vec<ArchiveContainer>,
    last_timestamp: Option<i64>,
}

impl RoundRobinReservoir {
    /// Build from a validated spec; windows start at `spec.start` aligned `now`.
    pub fn from_spec(spec: &ReservoirSpec, now: i64) -> Self {
        let start = spec.start.align(now);
        let containers = spec
            .archives
            .iter()
            .map(|a| ArchiveContainer::new(start, a.resolution, a.retention, a.max_raw_values))
            .collect();
        Self {
            step: spec.step,
            containers,
            last_timestamp: None,
        }
    }

    #[inline]
    pub fn step(&self) -> i64 {
        self.step
    }

    /// Exact match first, otherwise the finest resolution coarser than asked.
    fn container_for(&self, resolution: i64) -> Option<&ArchiveContainer> {
        self.containers
            .iter()
            .find(|c| c.resolution() == resolution)
            .or_else(|| self.containers.iter().find(|c| c.resolution() >= resolution))
    }

    fn container_or_finest(&self, resolution: Option<i64>) -> Option<&ArchiveContainer> {
        match resolution {
            Some(resolution) => self.container_for(resolution),
            None => self.containers.first(),
        }
    }
}

impl Reservoir for RoundRobinReservoir {
    fn update(&mut self, timestamp: i64, value: i64) -> bool {
        if let Some(last) = self.last_timestamp {
            if timestamp < last {
                warn!(
                    target: "vitals::reservoir",
                    timestamp,
                    last_accepted = last,
                    "Dropping update older than the last accepted timestamp"
                );
                return false;
            }
        }
        self.last_timestamp = Some(timestamp);
        for container in &mut self.containers {
            container.update(timestamp, value);
        }
        true
    }

    fn last_timestamp(&self) -> Option<i64> {
        self.last_timestamp
    }

    fn snapshot(&self, now: i64, resolution: Option<i64>) -> Option<Snapshot> {
        self.container_or_finest(resolution)
            .map(|c| c.current_snapshot(now))
    }

    fn snapshots(&self, start: i64, end: i64, resolution: i64) -> Vec<Snapshot> {
        self.container_for(resolution)
            .map(|c| c.range_snapshots(start, end))
            .unwrap_or_default()
    }

    fn all_snapshots(&self, _now: i64, resolution: Option<i64>) -> Vec<Snapshot> {
        self.container_or_finest(resolution)
            .map(ArchiveContainer::all_snapshots)
            .unwrap_or_default()
    }

    fn resolutions(&self) -> Vec<i64> {
        self.containers.iter().map(ArchiveContainer::resolution).collect()
    }

    fn kind(&self) -> ReservoirKind {
        ReservoirKind::RoundRobin
    }
}
