// ----------------------------------------------------------------------------
// Archives - One Window of Running Statistics
// ----------------------------------------------------------------------------

use super::Snapshot;

/// Raw value retention for one archive. Once the cap is exceeded the list is
/// dropped for good; scalar statistics keep accumulating.
#[derive(Debug, Clone)]
enum RawValues {
    Disabled,
    Collecting { cap: usize, values: Vec<i64> },
    Overflowed,
}

impl RawValues {
    fn new(cap: usize) -> Self {
        if cap == 0 {
            RawValues::Disabled
        } else {
            RawValues::Collecting {
                cap,
                values: Vec::new(),
            }
        }
    }

    fn push(&mut self, value: i64) {
        if let RawValues::Collecting { cap, values } = self {
            if values.len() >= *cap {
                *self = RawValues::Overflowed;
            } else {
                values.push(value);
            }
        }
    }

    fn to_vec(&self) -> Option<Vec<i64>> {
        match self {
            RawValues::Collecting { values, .. } => Some(values.clone()),
            _ => None,
        }
    }
}

/// Statistics for the inclusive window `[start, end]`.
///
/// Mean and variance use Welford's online update so no samples need to be
/// stored for them.
#[derive(Debug, Clone)]
pub(crate) struct Archive {
    start: i64,
    end: i64,
    resolution: Option<i64>,
    count: u64,
    mean: f64,
    m2: f64,
    sum: i64,
    min: Option<(i64, i64)>,
    max: Option<(i64, i64)>,
    first_usage: Option<i64>,
    last_usage: Option<i64>,
    last_value: Option<i64>,
    raw: RawValues,
}

impl Archive {
    /// A fixed-width window starting at `start`.
    pub(crate) fn windowed(start: i64, resolution: i64, max_raw_values: usize) -> Self {
        Self::with_bounds(start, start + resolution - 1, Some(resolution), max_raw_values)
    }

    /// An unbounded accumulator beginning at `start`.
    pub(crate) fn open(start: i64, max_raw_values: usize) -> Self {
        Self::with_bounds(start, i64::MAX, None, max_raw_values)
    }

    fn with_bounds(start: i64, end: i64, resolution: Option<i64>, max_raw_values: usize) -> Self {
        Self {
            start,
            end,
            resolution,
            count: 0,
            mean: 0.0,
            m2: 0.0,
            sum: 0,
            min: None,
            max: None,
            first_usage: None,
            last_usage: None,
            last_value: None,
            raw: RawValues::new(max_raw_values),
        }
    }

    #[inline]
    pub(crate) fn start(&self) -> i64 {
        self.start
    }

    #[inline]
    pub(crate) fn end(&self) -> i64 {
        self.end
    }

    pub(crate) fn update(&mut self, timestamp: i64, value: i64) {
        self.count += 1;
        let delta = value as f64 - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value as f64 - self.mean);
        self.sum = self.sum.wrapping_add(value);

        // Strict comparisons keep the timestamp of the first occurrence.
        if self.min.map_or(true, |(min, _)| value < min) {
            self.min = Some((value, timestamp));
        }
        if self.max.map_or(true, |(max, _)| value > max) {
            self.max = Some((value, timestamp));
        }
        if self.first_usage.is_none() {
            self.first_usage = Some(timestamp);
        }
        self.last_usage = Some(timestamp);
        self.last_value = Some(value);
        self.raw.push(value);
    }

    fn std_dev(&self) -> f64 {
        if self.count < 2 {
            f64::NAN
        } else {
            (self.m2 / (self.count - 1) as f64).sqrt()
        }
    }

    /// Copy the statistics out. `end` overrides the stored end, which open
    /// archives need because they have no fixed end.
    pub(crate) fn snapshot(&self, end: Option<i64>) -> Snapshot {
        let mut snapshot = Snapshot::empty(self.start, end.unwrap_or(self.end), self.resolution);
        snapshot.size = self.count;
        snapshot.sum = self.sum;
        snapshot.mean = if self.count == 0 { f64::NAN } else { self.mean };
        snapshot.std_dev = self.std_dev();
        snapshot.min = self.min.map(|(v, _)| v);
        snapshot.min_timestamp = self.min.map(|(_, t)| t);
        snapshot.max = self.max.map(|(v, _)| v);
        snapshot.max_timestamp = self.max.map(|(_, t)| t);
        snapshot.first_usage_timestamp = self.first_usage;
        snapshot.last_usage_timestamp = self.last_usage;
        snapshot.last_value = self.last_value;
        snapshot.raw_values = self.raw.to_vec();
        snapshot
    }
}

// ----------------------------------------------------------------------------
// Archive Containers - Ring Buffer of Windows for One Resolution
// ----------------------------------------------------------------------------

/// Fixed-size ring of contiguous, equal-width windows. Rolling forward
/// overwrites the oldest window.
#[derive(Debug, Clone)]
pub(crate) struct ArchiveContainer {
    resolution: i64,
    max_raw_values: usize,
    archives: Box<[Archive]>,
    /// Index of the newest window
    current: usize,
    /// Number of windows materialized so far (<= capacity)
    populated: usize,
}

impl ArchiveContainer {
    pub(crate) fn new(start: i64, resolution: i64, retention: usize, max_raw_values: usize) -> Self {
        let capacity = retention.max(1);
        let archives: Vec<Archive> = (0..capacity)
            .map(|_| Archive::windowed(start, resolution, max_raw_values))
            .collect();
        Self {
            resolution,
            max_raw_values,
            archives: archives.into_boxed_slice(),
            current: 0,
            populated: 1,
        }
    }

    #[inline]
    pub(crate) fn resolution(&self) -> i64 {
        self.resolution
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.archives.len()
    }

    #[inline]
    fn current_archive(&self) -> &Archive {
        &self.archives[self.current]
    }

    /// Start of the oldest retained window.
    pub(crate) fn span_start(&self) -> i64 {
        self.current_archive().start() - (self.populated as i64 - 1) * self.resolution
    }

    /// End of the newest window.
    pub(crate) fn span_end(&self) -> i64 {
        self.current_archive().end()
    }

    /// Move the current window forward so that it contains `timestamp`,
    /// materializing empty windows for every skipped one. Returns `false`
    /// if `timestamp` lies before the current window.
    pub(crate) fn advance(&mut self, timestamp: i64) -> bool {
        let current_start = self.current_archive().start();
        if timestamp < current_start {
            return false;
        }
        let offset = (timestamp - current_start) / self.resolution;
        if offset == 0 {
            return true;
        }

        let capacity = self.capacity() as i64;
        // Only the newest `capacity` windows survive a long gap.
        let first = (offset - capacity + 1).max(1);
        for i in first..=offset {
            let index = (self.current as i64 + i).rem_euclid(capacity) as usize;
            self.archives[index] =
                Archive::windowed(current_start + i * self.resolution, self.resolution, self.max_raw_values);
        }
        self.current = (self.current as i64 + offset).rem_euclid(capacity) as usize;
        self.populated = (self.populated as i64 + offset).min(capacity) as usize;
        true
    }

    pub(crate) fn update(&mut self, timestamp: i64, value: i64) {
        if self.advance(timestamp) {
            self.archives[self.current].update(timestamp, value);
        }
    }

    /// Retained windows, oldest first.
    fn iter_oldest_first(&self) -> impl Iterator<Item = &Archive> + '_ {
        let capacity = self.capacity();
        let oldest = (self.current + capacity + 1 - self.populated) % capacity;
        (0..self.populated).map(move |i| &self.archives[(oldest + i) % capacity])
    }

    /// The window containing `now`; an empty window when `now` has moved
    /// past the newest window without any update landing there.
    pub(crate) fn current_snapshot(&self, now: i64) -> Snapshot {
        let current = self.current_archive();
        if now <= current.end() {
            return current.snapshot(None);
        }
        let offset = (now - current.start()) / self.resolution;
        let start = current.start() + offset * self.resolution;
        Snapshot::empty(start, start + self.resolution - 1, Some(self.resolution))
    }

    /// Windows overlapping `[start, end]`; nothing unless the retained span
    /// covers the whole range.
    pub(crate) fn range_snapshots(&self, start: i64, end: i64) -> Vec<Snapshot> {
        if start > end || start < self.span_start() || end > self.span_end() {
            return Vec::new();
        }
        self.iter_oldest_first()
            .filter(|a| a.end() >= start && a.start() <= end)
            .map(|a| a.snapshot(None))
            .collect()
    }

    pub(crate) fn all_snapshots(&self) -> Vec<Snapshot> {
        self.iter_oldest_first().map(|a| a.snapshot(None)).collect()
    }
}
