//! Change detection for decoded fields.
//!
//! Writing every field on every poll cycle floods the database with values
//! that did not change. The gate keeps the last *emitted* value of every field
//! and decides, per cycle, whether the new value is worth writing.
//!
//! Precedence:
//! 1. caching disabled: always emit
//! 2. staleness timeout reached: emit even if unchanged
//! 3. denoise mode: emit when the value moved more than [`DENOISE_THRESHOLD`]
//! 4. exact mode: emit when the value differs
//!
//! The cache entry only changes on emit. Suppressed values never move the
//! baseline, so slow drift still crosses the threshold eventually.

use crate::point::FieldValue;
use std::time::Duration;
use tokio::time::Instant;

/// Absolute change a denoised field must exceed to be written.
pub const DENOISE_THRESHOLD: f64 = 0.11;

/// How a new value is compared with the cached one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    /// Emit on any difference (tags, integers, labels)
    Exact,
    /// Emit when the absolute difference exceeds [`DENOISE_THRESHOLD`]
    Denoise,
}

/// Group-level caching policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GatePolicy {
    /// Whether change detection is enabled at all
    pub cache_values: bool,
    /// Whether non-tag fields use [`Comparison::Denoise`]
    pub denoise_values: bool,
    /// Maximum time a field may go unwritten
    pub cache_timeout: Duration,
}

impl GatePolicy {
    /// Comparison used for a field of this group.
    pub fn comparison_for(&self, is_tag: bool) -> Comparison {
        if self.denoise_values && !is_tag {
            Comparison::Denoise
        } else {
            Comparison::Exact
        }
    }
}

impl Default for GatePolicy {
    fn default() -> Self {
        Self {
            cache_values: true,
            denoise_values: true,
            cache_timeout: Duration::from_secs(300),
        }
    }
}

/// Last emitted value of one field.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    /// Value written last
    pub value: FieldValue,
    /// When it was written
    pub emitted_at: Instant,
}

/// Why the gate let a value through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Caching disabled
    Uncached,
    /// Staleness timeout reached
    Refresh,
    /// Value changed beyond the comparison
    Changed,
    /// Value withheld
    Suppressed,
}

impl Decision {
    /// Whether the value is written.
    pub fn emits(self) -> bool {
        self != Decision::Suppressed
    }
}

/// Fixed-size cache of last emitted values, one entry per field index.
///
/// Every entry starts as `0.0` emitted at `start`. Zero is an implausible
/// reading for most registers, so the first cycle writes nearly everything.
#[derive(Debug, Clone)]
pub struct FieldCache {
    policy: GatePolicy,
    entries: Vec<CacheEntry>,
}

impl FieldCache {
    /// Create a cache for `len` fields.
    pub fn new(len: usize, policy: GatePolicy, start: Instant) -> Self {
        let entries = (0..len)
            .map(|_| CacheEntry {
                value: FieldValue::Float(0.0),
                emitted_at: start,
            })
            .collect();
        Self { policy, entries }
    }

    /// The caching policy.
    pub fn policy(&self) -> &GatePolicy {
        &self.policy
    }

    /// Number of fields tracked.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache tracks no field.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cache entry of field `index`.
    pub fn entry(&self, index: usize) -> Option<&CacheEntry> {
        self.entries.get(index)
    }

    /// Decide whether `value` of field `index` is written at `now`.
    ///
    /// On emit the entry becomes `(value, now)` unless caching is disabled.
    pub fn evaluate(
        &mut self,
        index: usize,
        value: &FieldValue,
        now: Instant,
        comparison: Comparison,
    ) -> Decision {
        if !self.policy.cache_values {
            return Decision::Uncached;
        }

        let timeout = self.policy.cache_timeout;
        let Some(entry) = self.entries.get_mut(index) else {
            // Out of range fields are never cached
            return Decision::Uncached;
        };

        let decision = if now.saturating_duration_since(entry.emitted_at) >= timeout {
            Decision::Refresh
        } else if changed(&entry.value, value, comparison) {
            Decision::Changed
        } else {
            Decision::Suppressed
        };

        if decision.emits() {
            entry.value = value.clone();
            entry.emitted_at = now;
        }
        decision
    }
}

fn changed(cached: &FieldValue, new: &FieldValue, comparison: Comparison) -> bool {
    match (comparison, cached.as_f64(), new.as_f64()) {
        (Comparison::Denoise, Some(old), Some(new)) => (new - old).abs() > DENOISE_THRESHOLD,
        _ => !cached.same_as(new),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(cache_values: bool, denoise_values: bool, timeout_secs: u64) -> GatePolicy {
        GatePolicy {
            cache_values,
            denoise_values,
            cache_timeout: Duration::from_secs(timeout_secs),
        }
    }

    #[test]
    fn uncached_always_emits_and_leaves_entry() {
        let start = Instant::now();
        let mut cache = FieldCache::new(1, policy(false, true, 300), start);
        let v = FieldValue::Float(21.5);

        for i in 0..5 {
            let now = start + Duration::from_secs(i);
            assert_eq!(cache.evaluate(0, &v, now, Comparison::Denoise), Decision::Uncached);
        }
        assert_eq!(cache.entry(0).unwrap().value, FieldValue::Float(0.0));
    }

    #[test]
    fn identical_values_emit_once() {
        let start = Instant::now();
        let mut cache = FieldCache::new(1, policy(true, false, 300), start);
        let v = FieldValue::Int(42);

        let emitted: usize = (0..50)
            .map(|i| {
                let now = start + Duration::from_secs(i * 5);
                cache.evaluate(0, &v, now, Comparison::Exact).emits() as usize
            })
            .sum();
        assert_eq!(emitted, 1);
    }

    #[test]
    fn staleness_forces_refresh_and_resets_clock() {
        let start = Instant::now();
        let mut cache = FieldCache::new(1, policy(true, false, 60), start);
        let v = FieldValue::Float(21.5);

        let t0 = start + Duration::from_secs(1);
        assert_eq!(cache.evaluate(0, &v, t0, Comparison::Exact), Decision::Changed);
        assert_eq!(
            cache.evaluate(0, &v, t0 + Duration::from_secs(59), Comparison::Exact),
            Decision::Suppressed
        );

        let refresh_at = t0 + Duration::from_secs(60);
        assert_eq!(
            cache.evaluate(0, &v, refresh_at, Comparison::Exact),
            Decision::Refresh
        );
        assert_eq!(cache.entry(0).unwrap().emitted_at, refresh_at);

        assert_eq!(
            cache.evaluate(0, &v, refresh_at + Duration::from_secs(30), Comparison::Exact),
            Decision::Suppressed
        );
    }

    #[test]
    fn denoise_threshold_boundary() {
        let start = Instant::now();
        let mut cache = FieldCache::new(2, policy(true, true, 300), start);
        let t = start + Duration::from_secs(1);

        assert!(cache
            .evaluate(0, &FieldValue::Float(21.5), t, Comparison::Denoise)
            .emits());
        assert!(!cache
            .evaluate(0, &FieldValue::Float(21.6), t, Comparison::Denoise)
            .emits());
        assert!(cache
            .evaluate(0, &FieldValue::Float(21.62), t, Comparison::Denoise)
            .emits());

        assert!(cache
            .evaluate(1, &FieldValue::Float(-5.0), t, Comparison::Denoise)
            .emits());
        assert!(!cache
            .evaluate(1, &FieldValue::Float(-5.1), t, Comparison::Denoise)
            .emits());
        assert!(cache
            .evaluate(1, &FieldValue::Float(-5.12), t, Comparison::Denoise)
            .emits());
    }

    #[test]
    fn suppressed_drift_does_not_move_baseline() {
        let start = Instant::now();
        let mut cache = FieldCache::new(1, policy(true, true, 300), start);
        let t = start + Duration::from_secs(1);

        assert!(cache
            .evaluate(0, &FieldValue::Float(20.0), t, Comparison::Denoise)
            .emits());
        // Creeping up by 0.05 per cycle: each step is small, the sum is not
        assert!(!cache
            .evaluate(0, &FieldValue::Float(20.05), t, Comparison::Denoise)
            .emits());
        assert!(!cache
            .evaluate(0, &FieldValue::Float(20.10), t, Comparison::Denoise)
            .emits());
        assert!(cache
            .evaluate(0, &FieldValue::Float(20.15), t, Comparison::Denoise)
            .emits());
        assert_eq!(cache.entry(0).unwrap().value, FieldValue::Float(20.15));
    }

    #[test]
    fn cold_start_zero_is_suppressed_in_exact_mode() {
        let start = Instant::now();
        let mut cache = FieldCache::new(1, policy(true, false, 300), start);
        let now = start + Duration::from_secs(5);
        assert_eq!(
            cache.evaluate(0, &FieldValue::Int(0), now, Comparison::Exact),
            Decision::Suppressed
        );
        assert_eq!(
            cache.evaluate(0, &FieldValue::Int(1), now, Comparison::Exact),
            Decision::Changed
        );
    }

    #[test]
    fn text_values_use_exact_comparison_even_when_denoising() {
        let start = Instant::now();
        let mut cache = FieldCache::new(1, policy(true, true, 300), start);
        let t = start + Duration::from_secs(1);
        let dhw = FieldValue::from("DHW");

        assert!(cache.evaluate(0, &dhw, t, Comparison::Denoise).emits());
        assert!(!cache.evaluate(0, &dhw, t, Comparison::Denoise).emits());
        assert!(cache
            .evaluate(0, &FieldValue::from("CH"), t, Comparison::Denoise)
            .emits());
    }

    #[test]
    fn comparison_depends_on_tag_and_policy() {
        let p = policy(true, true, 300);
        assert_eq!(p.comparison_for(false), Comparison::Denoise);
        assert_eq!(p.comparison_for(true), Comparison::Exact);
        let p = policy(true, false, 300);
        assert_eq!(p.comparison_for(false), Comparison::Exact);
    }
}
