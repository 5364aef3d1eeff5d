//! Point assembly for one poll cycle.
//!
//! A cycle yields one main point per group plus one companion point per tag
//! field whose value passed the gate. Tags are attached to the main point on
//! every cycle so each point can be selected by the current state. The
//! companion carries the same value as a field, which makes the state
//! graphable next to numeric fields.

use crate::config::MeasurementGroup;
use crate::decoder::{DecodeError, RawValue};
use crate::gate::{Comparison, FieldCache};
use crate::point::{FieldValue, Point};
use crate::transform::UnknownEnumCode;
use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, error, info};

/// Points produced by one cycle, in write order.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledCycle {
    /// Single-field points for emitted tag values, in field order
    pub companions: Vec<Point>,
    /// Main point of the group, written even without fields
    pub main: Point,
    /// Codes that had no label and were replaced by a fallback
    pub unknown_codes: Vec<UnknownEnumCode>,
}

impl AssembledCycle {
    /// Companions followed by the main point.
    pub fn into_points(self) -> Vec<Point> {
        let mut points = self.companions;
        points.push(self.main);
        points
    }

    /// Number of points to write.
    pub fn len(&self) -> usize {
        self.companions.len() + 1
    }

    /// Always false, the main point is always present.
    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Run transforms and the change gate over decoded `values` and build the
/// cycle's points.
///
/// `now` drives the gate, `timestamp` is stamped on every point of the cycle.
/// Fails only when the layout produced fewer values than the group has fields.
pub fn assemble(
    group: &MeasurementGroup,
    values: &[RawValue],
    cache: &mut FieldCache,
    now: Instant,
    timestamp: DateTime<Utc>,
) -> Result<AssembledCycle, DecodeError> {
    if values.len() < group.fields.len() {
        return Err(DecodeError::ValueCountMismatch {
            layout: group.layout.descriptor().to_string(),
            expected: group.fields.len(),
            actual: values.len(),
        });
    }

    let mut main = Point::new(group.name.as_str()).timestamp(timestamp);
    let mut companions = Vec::new();
    let mut unknown_codes = Vec::new();

    for (index, (spec, raw)) in group.fields.iter().zip(values).enumerate() {
        if spec.is_skipped() {
            continue;
        }

        let value = match spec.transform.apply(*raw) {
            Ok(value) => value,
            Err(unknown) => {
                error!(
                    group = %group.name,
                    field = %spec.name,
                    code = unknown.code,
                    table = %unknown.table,
                    "Unknown enumeration code"
                );
                let value = FieldValue::Text(unknown.fallback_label());
                unknown_codes.push(unknown);
                value
            }
        };

        if spec.is_tag {
            debug!(field = %spec.name, "Writing tag");
            main = main.tag(spec.name.as_str(), &value);

            if cache.evaluate(index, &value, now, Comparison::Exact).emits() {
                info!(field = %spec.name, value = %value, "Writing field");
                companions.push(
                    Point::new(group.name.as_str())
                        .field(spec.name.as_str(), value)
                        .timestamp(timestamp),
                );
            } else {
                debug!(field = %spec.name, "Not writing field");
            }
        } else {
            let comparison = group.policy.comparison_for(false);
            if cache.evaluate(index, &value, now, comparison).emits() {
                info!(field = %spec.name, value = %value, "Writing field");
                main = main.field(spec.name.as_str(), value);
            } else {
                debug!(field = %spec.name, "Not writing field");
            }
        }
    }

    Ok(AssembledCycle {
        companions,
        main,
        unknown_codes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FieldSpec;
    use crate::decoder::Layout;
    use crate::gate::GatePolicy;
    use crate::lookup::EnumTable;
    use crate::transform::Transform;
    use chrono::TimeZone;
    use std::time::Duration;
    use tracing_test::traced_test;

    fn worked_example_group(policy: GatePolicy) -> MeasurementGroup {
        MeasurementGroup {
            name: "heat_pump".to_string(),
            register: 1000,
            count: 3,
            layout: Layout::parse(">hhh").unwrap(),
            fields: vec![
                FieldSpec {
                    name: "mode".to_string(),
                    transform: Transform::Lookup(EnumTable::HeatPumpMode),
                    is_tag: true,
                },
                FieldSpec {
                    name: "None".to_string(),
                    transform: Transform::AsIs,
                    is_tag: false,
                },
                FieldSpec {
                    name: "temp".to_string(),
                    transform: Transform::Scale10,
                    is_tag: false,
                },
            ],
            interval: Duration::from_secs(5),
            policy,
        }
    }

    fn raw(values: [i64; 3]) -> Vec<RawValue> {
        values.into_iter().map(RawValue::Signed).collect()
    }

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn worked_example() {
        let group = worked_example_group(GatePolicy::default());
        let start = Instant::now();
        let mut cache = FieldCache::new(group.fields.len(), group.policy, start);

        let cycle = assemble(&group, &raw([2, 99, 215]), &mut cache, start, ts()).unwrap();

        assert_eq!(cycle.main.measurement(), "heat_pump");
        assert_eq!(cycle.main.get_tag("mode"), Some("DHW"));
        assert_eq!(cycle.main.get_field("temp"), Some(&FieldValue::Float(21.5)));
        assert_eq!(cycle.main.fields().len(), 1);

        assert_eq!(cycle.companions.len(), 1);
        let companion = &cycle.companions[0];
        assert_eq!(companion.get_field("mode"), Some(&FieldValue::from("DHW")));
        assert!(companion.tags().is_empty());
        assert!(cycle.unknown_codes.is_empty());
    }

    #[test]
    fn all_points_share_the_cycle_timestamp() {
        let group = worked_example_group(GatePolicy::default());
        let start = Instant::now();
        let mut cache = FieldCache::new(group.fields.len(), group.policy, start);

        let cycle = assemble(&group, &raw([2, 99, 215]), &mut cache, start, ts()).unwrap();
        for point in cycle.into_points() {
            assert_eq!(point.get_timestamp(), Some(ts()));
        }
    }

    #[test]
    fn tags_stay_on_main_point_when_unchanged() {
        let group = worked_example_group(GatePolicy::default());
        let start = Instant::now();
        let mut cache = FieldCache::new(group.fields.len(), group.policy, start);

        assemble(&group, &raw([2, 99, 215]), &mut cache, start, ts()).unwrap();
        let later = start + Duration::from_secs(5);
        let cycle = assemble(&group, &raw([2, 99, 215]), &mut cache, later, ts()).unwrap();

        assert_eq!(cycle.main.get_tag("mode"), Some("DHW"));
        assert!(cycle.main.fields().is_empty());
        assert!(cycle.companions.is_empty());
        assert_eq!(cycle.len(), 1);
    }

    #[test]
    fn companion_uses_exact_comparison() {
        let group = worked_example_group(GatePolicy::default());
        let start = Instant::now();
        let mut cache = FieldCache::new(group.fields.len(), group.policy, start);

        assemble(&group, &raw([2, 99, 215]), &mut cache, start, ts()).unwrap();
        // Mode changes DHW -> CH, temperature within tolerance
        let later = start + Duration::from_secs(5);
        let cycle = assemble(&group, &raw([1, 99, 216]), &mut cache, later, ts()).unwrap();

        assert_eq!(cycle.main.get_tag("mode"), Some("CH"));
        assert_eq!(cycle.companions.len(), 1);
        assert_eq!(
            cycle.companions[0].get_field("mode"),
            Some(&FieldValue::from("CH"))
        );
        assert!(cycle.main.get_field("temp").is_none());
    }

    #[test]
    fn unknown_code_falls_back_and_continues() {
        let group = worked_example_group(GatePolicy::default());
        let start = Instant::now();
        let mut cache = FieldCache::new(group.fields.len(), group.policy, start);

        let cycle = assemble(&group, &raw([77, 99, 215]), &mut cache, start, ts()).unwrap();

        assert_eq!(cycle.main.get_tag("mode"), Some("UNKNOWN-77"));
        assert_eq!(cycle.main.get_field("temp"), Some(&FieldValue::Float(21.5)));
        assert_eq!(cycle.unknown_codes.len(), 1);
        assert_eq!(cycle.unknown_codes[0].code, 77);
    }

    #[traced_test]
    #[test]
    fn gate_decisions_are_logged() {
        let group = worked_example_group(GatePolicy::default());
        let start = Instant::now();
        let mut cache = FieldCache::new(group.fields.len(), group.policy, start);

        assemble(&group, &raw([2, 99, 215]), &mut cache, start, ts()).unwrap();
        assert!(logs_contain("Writing field"));
        assert!(!logs_contain("Not writing field"));

        assemble(&group, &raw([77, 99, 215]), &mut cache, start, ts()).unwrap();
        assert!(logs_contain("Not writing field"));
        assert!(logs_contain("Unknown enumeration code"));
    }

    #[test]
    fn caching_disabled_writes_everything() {
        let policy = GatePolicy {
            cache_values: false,
            ..GatePolicy::default()
        };
        let group = worked_example_group(policy);
        let start = Instant::now();
        let mut cache = FieldCache::new(group.fields.len(), group.policy, start);

        for i in 0..3 {
            let now = start + Duration::from_secs(i);
            let cycle = assemble(&group, &raw([2, 99, 215]), &mut cache, now, ts()).unwrap();
            assert_eq!(cycle.companions.len(), 1);
            assert!(cycle.main.get_field("temp").is_some());
        }
    }

    #[test]
    fn too_few_values_is_a_decode_error() {
        let group = worked_example_group(GatePolicy::default());
        let start = Instant::now();
        let mut cache = FieldCache::new(group.fields.len(), group.policy, start);

        let values = vec![RawValue::Signed(2), RawValue::Signed(99)];
        let err = assemble(&group, &values, &mut cache, start, ts()).unwrap_err();
        assert!(matches!(err, DecodeError::ValueCountMismatch { expected: 3, actual: 2, .. }));
    }
}
