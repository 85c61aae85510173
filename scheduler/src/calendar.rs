//! DST-aware date arithmetic. Every instant the scheduler stores is UTC;
//! this module is the only place that talks to an IANA timezone.

use chrono::{DateTime, Duration, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use common::SchedulerError;

/// A point in time as a caller hands it in: either naive (interpreted in
/// the allocation's timezone) or already UTC-aware.
#[derive(Clone, Copy, Debug)]
pub enum LocalTime {
    Naive(NaiveDateTime),
    Aware(DateTime<Utc>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RasterDirection {
    Down,
    Up,
}

/// Converts `ts` to UTC. Naive values are localized to `tz` first; aware
/// values pass through. A naive value that falls in a DST gap (does not
/// exist in `tz`) is rejected rather than silently shifted.
pub fn to_utc(ts: LocalTime, tz: Tz) -> Result<DateTime<Utc>, SchedulerError> {
    match ts {
        LocalTime::Aware(dt) => Ok(dt),
        LocalTime::Naive(naive) => match tz.from_local_datetime(&naive) {
            LocalResult::Single(dt) => Ok(dt.with_timezone(&Utc)),
            // Fall-back ambiguity (clock repeats an hour): take the earlier,
            // standards-compliant offset rather than forcing callers to disambiguate.
            LocalResult::Ambiguous(earliest, _latest) => Ok(earliest.with_timezone(&Utc)),
            LocalResult::None => Err(SchedulerError::InvalidAllocation {
                reason: format!("{naive} does not exist in {tz} (spring-forward gap)"),
            }),
        },
    }
}

/// Snaps `ts` to the nearest `raster_minutes` boundary (epoch-aligned, so
/// the same raster grid applies regardless of which day `ts` falls on).
pub fn align_to_raster(ts: DateTime<Utc>, raster_minutes: i32, direction: RasterDirection) -> DateTime<Utc> {
    let raster_ms = Duration::minutes(raster_minutes as i64).num_milliseconds().max(1);
    let elapsed_ms = ts.timestamp_millis();
    let rem = elapsed_ms.rem_euclid(raster_ms);

    match direction {
        RasterDirection::Down => ts - Duration::milliseconds(rem),
        RasterDirection::Up if rem == 0 => ts,
        RasterDirection::Up => ts + Duration::milliseconds(raster_ms - rem),
    }
}

/// Half-open overlap test: `[a_start, a_end)` intersects `[b_start, b_end)`.
pub fn overlaps(a_start: DateTime<Utc>, a_end: DateTime<Utc>, b_start: DateTime<Utc>, b_end: DateTime<Utc>) -> bool {
    a_start < b_end && b_start < a_end
}

/// Expands `[start_date, end_date]` (inclusive, local calendar days) into
/// one `[start, end)` UTC pair per day, using `day_start`/`day_end` in
/// `tz`. `day_end = None` means midnight of the following local day (the
/// spec's `24:00`). On a DST-transition day the returned pair reflects the
/// actual 23- or 25-hour span rather than a nominal 24 hours.
pub fn expand_daily_dates(
    start_date: NaiveDate,
    end_date: NaiveDate,
    day_start: NaiveTime,
    day_end: Option<NaiveTime>,
    tz: Tz,
) -> Result<Vec<(DateTime<Utc>, DateTime<Utc>)>, SchedulerError> {
    let mut out = Vec::new();
    let mut date = start_date;

    while date <= end_date {
        let start_naive = date.and_time(day_start);
        let end_naive = match day_end {
            Some(t) => date.and_time(t),
            None => date.succ_opt().unwrap_or(date).and_time(NaiveTime::MIN),
        };

        let start = to_utc(LocalTime::Naive(start_naive), tz)?;
        let end = to_utc(LocalTime::Naive(end_naive), tz)?;
        out.push((start, end));

        date = date.succ_opt().unwrap_or(date);
        if date == start_date {
            break;
        }
    }

    Ok(out)
}

/// Percentage of capacity free over a span. With `normalize = true` this
/// is the plain free/total ratio, which already reads the same for a given
/// usage pattern regardless of whether the local day was 23, 24, or 25
/// hours long. With `normalize = false` the result is additionally scaled
/// by `24 / day_hours`, so 23h/25h days diverge from their 24h counterpart
/// for identical absolute usage — this is what an implementation not
/// accounting for the day's real length would report.
pub fn normalized_availability(actual_seconds_free: i64, actual_seconds_total: i64, day_hours: f64, normalize: bool) -> f64 {
    if actual_seconds_total <= 0 || day_hours <= 0.0 {
        return 0.0;
    }

    let pct = actual_seconds_free as f64 / actual_seconds_total as f64 * 100.0;
    let result = if normalize { pct } else { pct * (24.0 / day_hours) };

    result.clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use chrono_tz::Europe::Zurich;

    #[test]
    fn naive_localizes_to_tz() {
        let naive = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap().and_hms_opt(10, 0, 0).unwrap();
        let utc = to_utc(LocalTime::Naive(naive), Zurich).unwrap();
        assert_eq!(utc.to_rfc3339(), "2024-06-01T08:00:00+00:00");
    }

    #[test]
    fn dst_gap_is_rejected() {
        // Europe/Zurich springs forward at 02:00 -> 03:00 on 2024-03-31.
        let naive = NaiveDate::from_ymd_opt(2024, 3, 31).unwrap().and_hms_opt(2, 30, 0).unwrap();
        assert!(to_utc(LocalTime::Naive(naive), Zurich).is_err());
    }

    #[test]
    fn overlaps_is_half_open() {
        let t = |h: u32| {
            Utc.from_utc_datetime(&NaiveDate::from_ymd_opt(2024, 1, 1).unwrap().and_hms_opt(h, 0, 0).unwrap())
        };
        assert!(!overlaps(t(9), t(10), t(10), t(11)));
        assert!(overlaps(t(9), t(11), t(10), t(12)));
    }

    #[test]
    fn whole_day_spans_25h_on_fallback_day() {
        // 2024-10-27 is the Europe/Zurich fall-back day (25h local day).
        let date = NaiveDate::from_ymd_opt(2024, 10, 27).unwrap();
        let pairs = expand_daily_dates(date, date, NaiveTime::MIN, None, Zurich).unwrap();
        assert_eq!(pairs.len(), 1);
        let (start, end) = pairs[0];
        assert_eq!((end - start).num_hours(), 25);
    }

    #[test]
    fn normalized_is_day_length_invariant_raw_is_not() {
        // 25h day, 15 minutes reserved out of 1500.
        let total = 25 * 3600;
        let free = total - 15 * 60;
        let normalized = normalized_availability(free, total, 25.0, true);
        let raw = normalized_availability(free, total, 25.0, false);
        assert!((normalized - 99.0).abs() < 0.01);
        assert!((raw - 95.04).abs() < 0.01);
    }

    proptest! {
        // Invariant 6: normalized availability depends only on the free/total
        // ratio, never on the day's actual length (23h/24h/25h).
        #[test]
        fn normalized_availability_is_day_length_invariant(
            free_fraction in 0.0f64..=1.0,
            day_hours in prop_oneof![Just(23.0), Just(24.0), Just(25.0)],
        ) {
            let total = (day_hours * 3600.0) as i64;
            let free = (total as f64 * free_fraction) as i64;
            let normalized = normalized_availability(free, total, day_hours, true);
            let baseline = normalized_availability(free, total, 24.0, true);
            prop_assert!((normalized - baseline).abs() < 0.5);
            prop_assert!((0.0..=100.0).contains(&normalized));
        }

        // Invariant: raster alignment is idempotent and never moves a
        // timestamp further than one raster step.
        #[test]
        fn align_to_raster_is_idempotent(minute_offset in 0i64..10_000, raster in 1i32..=120) {
            let base = Utc.from_utc_datetime(&NaiveDate::from_ymd_opt(2024, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap());
            let ts = base + Duration::minutes(minute_offset);

            let down = align_to_raster(ts, raster, RasterDirection::Down);
            let down_again = align_to_raster(down, raster, RasterDirection::Down);
            prop_assert_eq!(down, down_again);
            prop_assert!(down <= ts);
            prop_assert!((ts - down).num_minutes() < raster as i64);
        }
    }
}
