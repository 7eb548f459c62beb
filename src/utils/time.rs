/// UTC time helpers shared by checks and windows
use chrono::{DateTime, Duration, Months, Utc};

/// Same instant `years` calendar years earlier (Feb 29 clamps to Feb 28)
pub fn years_before(now: DateTime<Utc>, years: u32) -> DateTime<Utc> {
    now.checked_sub_months(Months::new(years.saturating_mul(12)))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Elapsed minutes between two instants as a fractional value
pub fn minutes_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> f64 {
    (later - earlier).num_milliseconds() as f64 / 60_000.0
}

/// Number of `step` buckets from `start` through `now`, counting the first one
pub fn expected_bar_count(start: DateTime<Utc>, now: DateTime<Utc>, step: Duration) -> i64 {
    let step_secs = step.num_seconds();
    if step_secs <= 0 || now < start {
        return 0;
    }
    (now - start).num_seconds() / step_secs + 1
}

/// Nearest-rank percentile over an unsorted sample
pub fn percentile(values: &[f64], pct: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    let idx = rank.clamp(1, sorted.len()) - 1;
    Some(sorted[idx])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_years_before_leap_day() {
        let now = Utc.with_ymd_and_hms(2024, 2, 29, 12, 0, 0).unwrap();
        assert_eq!(
            years_before(now, 1),
            Utc.with_ymd_and_hms(2023, 2, 28, 12, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_expected_bar_count() {
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 9, 30).unwrap();
        assert_eq!(expected_bar_count(start, now, Duration::minutes(1)), 10);
        assert_eq!(expected_bar_count(start, now, Duration::minutes(5)), 2);
        assert_eq!(expected_bar_count(now, start, Duration::minutes(1)), 0);
    }

    #[test]
    fn test_percentile_nearest_rank() {
        let sample = [15.0, 20.0, 35.0, 40.0, 50.0];
        assert_eq!(percentile(&sample, 50.0), Some(35.0));
        assert_eq!(percentile(&sample, 95.0), Some(50.0));
        assert_eq!(percentile(&[], 50.0), None);
    }
}
