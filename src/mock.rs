//! Mock transport and sink
//!
//! Simulated collaborators for running poll loops without a heat pump or a
//! database. Both are cheap to share behind an `Arc` and record what happened
//! so tests can assert on it.
//!
//! - `MockRegisterReader` - register image with scriptable read failures
//! - `MemorySink` - collects written points, can reject writes

use crate::point::Point;
use crate::sink::{PointSink, SinkError, WriteOutcome};
use crate::transport::{RegisterReader, TransportError};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;

// =============================================================================
// MockRegisterReader
// =============================================================================

#[derive(Default)]
struct ReaderState {
    registers: HashMap<u16, u16>,
    failures: HashMap<u16, VecDeque<TransportError>>,
    reads: HashMap<u16, usize>,
}

/// Holding register image served over the [`RegisterReader`] trait.
///
/// Reading a register that was never set fails with
/// [`TransportError::Exception`], like a device answering with an illegal
/// data address.
///
/// # Example
///
/// ```rust,ignore
/// let reader = MockRegisterReader::new();
/// reader.set_registers(1000, &[2, 99, 215]).await;
/// assert_eq!(reader.read_holding_registers(1000, 3).await?, vec![2, 99, 215]);
/// ```
#[derive(Default)]
pub struct MockRegisterReader {
    state: Mutex<ReaderState>,
}

impl MockRegisterReader {
    /// Empty register image
    pub fn new() -> Self {
        Self::default()
    }

    /// Write `words` into the image starting at `start`.
    pub async fn set_registers(&self, start: u16, words: &[u16]) {
        let mut state = self.state.lock().await;
        for (offset, word) in (start..).zip(words) {
            state.registers.insert(offset, *word);
        }
    }

    /// Make the next read starting at `start` fail with `error`.
    ///
    /// Queued failures are consumed in order, one per read.
    pub async fn push_failure(&self, start: u16, error: TransportError) {
        self.state
            .lock()
            .await
            .failures
            .entry(start)
            .or_default()
            .push_back(error);
    }

    /// Number of reads issued at `start`, failed ones included.
    pub async fn read_count(&self, start: u16) -> usize {
        self.state
            .lock()
            .await
            .reads
            .get(&start)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl RegisterReader for MockRegisterReader {
    async fn read_holding_registers(
        &self,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let mut state = self.state.lock().await;
        *state.reads.entry(start).or_default() += 1;

        if let Some(error) = state.failures.get_mut(&start).and_then(VecDeque::pop_front) {
            return Err(error);
        }

        (0..count)
            .map(|offset| {
                start
                    .checked_add(offset)
                    .and_then(|addr| state.registers.get(&addr).copied())
                    .ok_or_else(|| TransportError::Exception {
                        start,
                        count,
                        code: "IllegalDataAddress".to_string(),
                    })
            })
            .collect()
    }
}

// =============================================================================
// MemorySink
// =============================================================================

/// Sink that keeps every written point in memory.
#[derive(Default)]
pub struct MemorySink {
    points: Mutex<Vec<Point>>,
    attempts: AtomicUsize,
    fail_next: AtomicUsize,
}

impl MemorySink {
    /// Empty sink accepting every write
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the next `n` writes with a 503.
    pub fn fail_next_writes(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Points accepted so far, in write order.
    pub async fn points(&self) -> Vec<Point> {
        self.points.lock().await.clone()
    }

    /// Accepted points of `measurement`.
    pub async fn points_for(&self, measurement: &str) -> Vec<Point> {
        self.points
            .lock()
            .await
            .iter()
            .filter(|p| p.measurement() == measurement)
            .cloned()
            .collect()
    }

    /// Writes attempted, rejected ones included.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PointSink for MemorySink {
    async fn write(&self, point: &Point) -> Result<WriteOutcome, SinkError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let rejected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(SinkError::Rejected {
                status: 503,
                body: "mock sink unavailable".to_string(),
            });
        }

        self.points.lock().await.push(point.clone());
        Ok(WriteOutcome::Written)
    }
}
