use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tracing::debug;

use crate::storage::series::{Sample, SeriesId, Timestamp};

#[derive(Error, Debug)]
pub enum ReadError {
    #[error("Unknown series: {0}")]
    UnknownSeries(SeriesId),
    #[error("Read failed: {0}")]
    Io(String),
}

/// A lazily consumed sequence of samples from one open call.
pub type SampleIter = Box<dyn Iterator<Item = Result<Sample, ReadError>> + Send>;

/// Read-side sample interface consumed by scan operators.
///
/// `open` yields samples with timestamps in `[start, end]`, ascending, with
/// no duplicate timestamps within one call. A series the reader no longer
/// knows reports `UnknownSeries` so callers can degrade instead of failing.
pub trait StorageReader: Send + Sync {
    fn open(&self, series: SeriesId, start: Timestamp, end: Timestamp)
        -> Result<SampleIter, ReadError>;
}

/// In-memory sample store backing tests and the interactive shell.
///
/// Tracks the number of live iterators handed out, which lets tests assert
/// that cancellation and drop paths release every open handle.
pub struct MemoryStorage {
    series: RwLock<HashMap<SeriesId, Vec<Sample>>>,
    open_handles: Arc<AtomicUsize>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
            open_handles: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Adds samples to a series, keeping the stored sequence ascending and
    /// free of duplicate timestamps.
    pub fn insert_samples(&self, series: SeriesId, samples: Vec<Sample>) {
        let mut all = self.series.write().unwrap();
        let stored = all.entry(series).or_insert_with(Vec::new);
        stored.extend(samples);
        stored.sort_by_key(|s| s.timestamp);
        stored.dedup_by_key(|s| s.timestamp);
    }

    /// Drops a series entirely, as compaction or retention would.
    pub fn remove_series(&self, series: SeriesId) {
        let mut all = self.series.write().unwrap();
        if all.remove(&series).is_some() {
            debug!("Removed series from storage: id={}", series);
        }
    }

    /// Number of sample iterators currently open.
    pub fn open_handles(&self) -> usize {
        self.open_handles.load(Ordering::SeqCst)
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageReader for MemoryStorage {
    fn open(
        &self,
        series: SeriesId,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<SampleIter, ReadError> {
        let all = self.series.read().unwrap();
        let stored = all.get(&series).ok_or(ReadError::UnknownSeries(series))?;
        let in_range: Vec<Sample> = stored
            .iter()
            .filter(|s| s.timestamp >= start && s.timestamp <= end)
            .copied()
            .collect();

        self.open_handles.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryIter {
            inner: in_range.into_iter(),
            _guard: HandleGuard {
                counter: Arc::clone(&self.open_handles),
            },
        }))
    }
}

struct HandleGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

struct MemoryIter {
    inner: std::vec::IntoIter<Sample>,
    _guard: HandleGuard,
}

impl Iterator for MemoryIter {
    type Item = Result<Sample, ReadError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(Ok)
    }
}
