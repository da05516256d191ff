//! Coarse drift detection between index and store document counts.
//!
//! Counting is cheap but approximate on both sides (the store may lag, the
//! index may hold a not-yet-merged delete), so exact equality is the wrong
//! bar. The check tolerates `|expected - actual| <= max(10, expected / 10)`;
//! anything beyond that band reports inconsistent. Any fault obtaining
//! either count also reports inconsistent: when in doubt, prefer
//! triggering a rebuild over trusting a possibly broken index.

use tracing::{info, warn};

/// The store-side count, when the store can produce one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedCount {
    /// Count unavailable or too expensive; the check is skipped.
    Unknown,
    Known(u64),
}

impl From<Option<u64>> for ExpectedCount {
    fn from(value: Option<u64>) -> Self {
        value.map_or(Self::Unknown, Self::Known)
    }
}

/// Compare one sub-index's document count against the store's.
///
/// `Unknown` expected counts skip the comparison and pass. `actual` is a
/// closure so a failing count lookup can be treated as inconsistent rather
/// than propagated.
pub fn is_consistent<E>(
    name: &str,
    expected: ExpectedCount,
    actual: impl FnOnce() -> Result<u64, E>,
) -> bool
where
    E: std::fmt::Display,
{
    let expected = match expected {
        ExpectedCount::Unknown => {
            info!(sub_index = name, "expected count unknown; skipping check");
            return true;
        }
        ExpectedCount::Known(count) => count,
    };

    let actual = match actual() {
        Ok(count) => count,
        Err(err) => {
            warn!(sub_index = name, error = %err, "count lookup failed; treating as inconsistent");
            return false;
        }
    };

    let delta = expected.abs_diff(actual);
    let tolerance = (expected / 10).max(10);
    if delta > tolerance {
        warn!(
            sub_index = name,
            expected, actual, delta, tolerance, "index count outside tolerance"
        );
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(count: u64) -> impl FnOnce() -> Result<u64, String> {
        move || Ok(count)
    }

    #[test]
    fn tolerance_is_max_of_ten_and_ten_percent() {
        // expected=1000 → tolerance=100: delta 95 passes, delta 120 fails.
        assert!(is_consistent("Primary", ExpectedCount::Known(1000), ok(905)));
        assert!(!is_consistent("Primary", ExpectedCount::Known(1000), ok(880)));
        // Boundary: delta == tolerance passes.
        assert!(is_consistent("Primary", ExpectedCount::Known(1000), ok(900)));
        assert!(!is_consistent("Primary", ExpectedCount::Known(1000), ok(899)));
    }

    #[test]
    fn small_counts_use_the_absolute_floor() {
        // expected=20 → tolerance=max(10, 2)=10.
        assert!(is_consistent("Comments", ExpectedCount::Known(20), ok(10)));
        assert!(!is_consistent("Comments", ExpectedCount::Known(20), ok(9)));
        // An index that is ahead also counts as drift.
        assert!(is_consistent("Comments", ExpectedCount::Known(20), ok(30)));
        assert!(!is_consistent("Comments", ExpectedCount::Known(20), ok(31)));
    }

    #[test]
    fn unknown_expected_skips_the_check() {
        assert!(is_consistent(
            "History",
            ExpectedCount::Unknown,
            || -> Result<u64, String> { Err("never called".to_string()) },
        ));
    }

    #[test]
    fn count_failure_is_inconsistent() {
        assert!(!is_consistent(
            "Primary",
            ExpectedCount::Known(5),
            || -> Result<u64, String> { Err("searcher unavailable".to_string()) },
        ));
    }

    #[test]
    fn option_maps_onto_expected_count() {
        assert_eq!(ExpectedCount::from(None), ExpectedCount::Unknown);
        assert_eq!(ExpectedCount::from(Some(3)), ExpectedCount::Known(3));
    }
}
