//! Change and deadband filtering.

use crate::types::{Quality, RawValue};
use compact_str::CompactString;
use dashmap::DashMap;
use tracing::trace;

/// Filter settings of one subscription.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChangeFilter {
    pub on_change_only: bool,
    pub deadband: f64,
}

/// Why a notification was not delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressReason {
    /// Non-good quality never takes part in change comparisons
    Quality,
    /// Equal to the previous value
    Unchanged,
    /// Numeric change within the deadband
    WithinDeadband,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterDecision {
    Deliver { previous: Option<RawValue> },
    Suppress(SuppressReason),
}

/// Upper bound of concrete keys cached per subscription.
///
/// A pattern subscription caches one value per distinct key it matched. Keys
/// seen after the cache is full are delivered unfiltered.
pub const MAX_CACHED_KEYS: usize = 4096;

/// Decides whether a notification is delivered.
///
/// The cached last value for `key` is swapped for the new one before the
/// comparison, so the cache always holds the last good value observed.
pub fn evaluate(
    filter: &ChangeFilter,
    last_values: &DashMap<CompactString, RawValue>,
    key: &str,
    raw: &RawValue,
    quality: Quality,
) -> FilterDecision {
    evaluate_bounded(filter, last_values, MAX_CACHED_KEYS, key, raw, quality)
}

pub(crate) fn evaluate_bounded(
    filter: &ChangeFilter,
    last_values: &DashMap<CompactString, RawValue>,
    max_keys: usize,
    key: &str,
    raw: &RawValue,
    quality: Quality,
) -> FilterDecision {
    if !filter.on_change_only {
        return FilterDecision::Deliver { previous: None };
    }

    if !quality.is_good() {
        return FilterDecision::Suppress(SuppressReason::Quality);
    }

    if let Some(mut cached) = last_values.get_mut(key) {
        let previous = std::mem::replace(cached.value_mut(), raw.clone());
        drop(cached);
        return compare(filter.deadband, Some(previous), raw);
    }

    if last_values.len() >= max_keys {
        trace!("Change cache full ({} keys), delivering {} unfiltered", max_keys, key);
        return FilterDecision::Deliver { previous: None };
    }

    let previous = last_values.insert(CompactString::new(key), raw.clone());
    compare(filter.deadband, previous, raw)
}

fn compare(deadband: f64, previous: Option<RawValue>, current: &RawValue) -> FilterDecision {
    let Some(previous) = previous else {
        return FilterDecision::Deliver { previous: None };
    };

    let suppressed = match (previous.as_f64(), current.as_f64()) {
        (Some(last), Some(now)) if deadband > 0.0 => {
            ((now - last).abs() <= deadband).then_some(SuppressReason::WithinDeadband)
        }
        (Some(last), Some(now)) => (last == now).then_some(SuppressReason::Unchanged),
        _ => (previous == *current).then_some(SuppressReason::Unchanged),
    };

    match suppressed {
        Some(reason) => FilterDecision::Suppress(reason),
        None => FilterDecision::Deliver {
            previous: Some(previous),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn on_change(deadband: f64) -> ChangeFilter {
        ChangeFilter {
            on_change_only: true,
            deadband,
        }
    }

    #[test]
    fn test_first_sample_is_delivered() {
        let cache = DashMap::new();
        let decision = evaluate(&on_change(0.0), &cache, "T", &RawValue::Int(5), Quality::Good);
        assert_eq!(decision, FilterDecision::Deliver { previous: None });
    }

    #[test]
    fn test_duplicate_is_suppressed() {
        let cache = DashMap::new();
        evaluate(&on_change(0.0), &cache, "T", &RawValue::Int(5), Quality::Good);
        let decision = evaluate(&on_change(0.0), &cache, "T", &RawValue::Int(5), Quality::Good);
        assert_eq!(decision, FilterDecision::Suppress(SuppressReason::Unchanged));

        // numeric equality across representations
        let decision = evaluate(&on_change(0.0), &cache, "T", &RawValue::Float(5.0), Quality::Good);
        assert_eq!(decision, FilterDecision::Suppress(SuppressReason::Unchanged));
    }

    #[test]
    fn test_deadband() {
        let cache = DashMap::new();
        let filter = on_change(0.5);
        evaluate(&filter, &cache, "T", &RawValue::Float(10.0), Quality::Good);

        assert_eq!(
            evaluate(&filter, &cache, "T", &RawValue::Float(10.3), Quality::Good),
            FilterDecision::Suppress(SuppressReason::WithinDeadband)
        );
        assert_eq!(
            evaluate(&filter, &cache, "T", &RawValue::Float(11.0), Quality::Good),
            FilterDecision::Deliver {
                previous: Some(RawValue::Float(10.3))
            }
        );
    }

    #[test]
    fn test_bad_quality_is_never_compared_or_cached() {
        let cache = DashMap::new();
        let filter = on_change(0.0);
        evaluate(&filter, &cache, "T", &RawValue::Int(1), Quality::Good);

        assert_eq!(
            evaluate(&filter, &cache, "T", &RawValue::Int(2), Quality::Bad),
            FilterDecision::Suppress(SuppressReason::Quality)
        );
        assert_eq!(cache.get("T").map(|v| v.clone()), Some(RawValue::Int(1)));
    }

    #[test]
    fn test_non_numeric_values_compare_structurally() {
        let cache = DashMap::new();
        let filter = on_change(5.0);
        evaluate(&filter, &cache, "S", &RawValue::Text("idle".into()), Quality::Good);

        assert_eq!(
            evaluate(&filter, &cache, "S", &RawValue::Text("idle".into()), Quality::Good),
            FilterDecision::Suppress(SuppressReason::Unchanged)
        );
        assert!(matches!(
            evaluate(&filter, &cache, "S", &RawValue::Text("run".into()), Quality::Good),
            FilterDecision::Deliver { .. }
        ));
    }

    #[test]
    fn test_cache_stops_growing_at_capacity() {
        let cache = DashMap::new();
        let filter = on_change(0.0);

        for key in ["line1/a", "line1/b"] {
            evaluate_bounded(&filter, &cache, 2, key, &RawValue::Int(1), Quality::Good);
        }
        assert_eq!(cache.len(), 2);

        // known keys keep filtering
        assert_eq!(
            evaluate_bounded(&filter, &cache, 2, "line1/a", &RawValue::Int(1), Quality::Good),
            FilterDecision::Suppress(SuppressReason::Unchanged)
        );

        // new keys pass through without being cached
        for _ in 0..2 {
            assert_eq!(
                evaluate_bounded(&filter, &cache, 2, "line1/c", &RawValue::Int(1), Quality::Good),
                FilterDecision::Deliver { previous: None }
            );
        }
        assert_eq!(cache.len(), 2);
        assert!(cache.get("line1/c").is_none());
    }

    #[test]
    fn test_everything_delivered_without_change_filter() {
        let cache = DashMap::new();
        let filter = ChangeFilter {
            on_change_only: false,
            deadband: 0.0,
        };
        for _ in 0..3 {
            assert!(matches!(
                evaluate(&filter, &cache, "T", &RawValue::Int(1), Quality::Bad),
                FilterDecision::Deliver { .. }
            ));
        }
        assert!(cache.is_empty());
    }
}
