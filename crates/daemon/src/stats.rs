//! Queue statistics for autotranscode
//!
//! Derived on demand from the `started_at`/`finished_at` pairs of every job;
//! nothing here is persisted.

use std::collections::BTreeMap;

use chrono::{Duration as ChronoDuration, NaiveDate, NaiveDateTime, TimeZone};
use serde::{Deserialize, Serialize};

use crate::store::Job;

const SECS_PER_DAY: f64 = 86_400.0;

/// Throughput figures for the whole queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Jobs that started and finished on the given local day
    pub processed_today: usize,
    /// Processed jobs per day of accumulated processing time
    pub average_processed_per_day: f64,
    /// Mean wall-clock seconds per processed job
    pub average_processing_secs: f64,
}

/// Local start and finish of a job that has both timestamps.
fn local_span<Tz: TimeZone>(job: &Job, tz: &Tz) -> Option<(NaiveDateTime, NaiveDateTime)> {
    let started = job.started_at?.with_timezone(tz).naive_local();
    let finished = job.finished_at?.with_timezone(tz).naive_local();
    Some((started, finished))
}

/// Computes [`QueueStats`] over `jobs`.
///
/// # Arguments
/// * `jobs` - Every job in the queue
/// * `today` - The local calendar day counted by `processed_today`
/// * `tz` - Time zone that defines calendar days
pub fn queue_stats<Tz: TimeZone>(jobs: &[Job], today: NaiveDate, tz: &Tz) -> QueueStats {
    let mut processed = 0usize;
    let mut processed_today = 0usize;
    let mut total_secs = 0.0f64;

    for (started, finished) in jobs.iter().filter_map(|job| local_span(job, tz)) {
        processed += 1;
        total_secs += (finished - started).num_milliseconds().max(0) as f64 / 1000.0;
        if started.date() == today && finished.date() == today {
            processed_today += 1;
        }
    }

    let processing_days = total_secs / SECS_PER_DAY;
    QueueStats {
        processed_today,
        average_processed_per_day: processed as f64 / processing_days.max(1.0),
        average_processing_secs: total_secs / processed.max(1) as f64,
    }
}

/// Fraction of each local calendar day spent processing, summed over jobs.
///
/// Values can exceed 1.0 when several nodes processed on the same day.
pub fn daily_load<Tz: TimeZone>(jobs: &[Job], tz: &Tz) -> BTreeMap<NaiveDate, f64> {
    let mut load = BTreeMap::new();

    for (started, finished) in jobs.iter().filter_map(|job| local_span(job, tz)) {
        if finished < started {
            continue;
        }

        let mut day = started.date();
        while day <= finished.date() {
            let day_start = day.and_time(chrono::NaiveTime::MIN);
            let day_end = day_start + ChronoDuration::days(1);
            let from = started.max(day_start);
            let to = finished.min(day_end);
            let fraction = (to - from).num_milliseconds() as f64 / 1000.0 / SECS_PER_DAY;
            *load.entry(day).or_insert(0.0) += fraction;

            match day.succ_opt() {
                Some(next) => day = next,
                None => break,
            }
        }
    }

    load
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::JobStatus;
    use chrono::{DateTime, Utc};
    use proptest::prelude::*;
    use std::path::PathBuf;

    fn ts(d: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, d, h, m, 0).unwrap()
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    fn job(started: Option<DateTime<Utc>>, finished: Option<DateTime<Utc>>) -> Job {
        Job {
            id: "id".into(),
            path: PathBuf::from("/m/a.mp4"),
            status: JobStatus::Processed,
            output_path: PathBuf::from("/m/a_transcoded.mp4"),
            log_path: PathBuf::from("/m/a_transcoding.log"),
            input_size: None,
            output_size: None,
            created_at: ts(1, 0, 0),
            updated_at: ts(1, 0, 0),
            started_at: started,
            finished_at: finished,
        }
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_empty_queue_stats() {
        let stats = queue_stats(&[], day(10), &Utc);
        assert_eq!(stats, QueueStats::default());
        assert!(daily_load(&[], &Utc).is_empty());
    }

    #[test]
    fn test_queue_stats() {
        let jobs = vec![
            job(Some(ts(10, 1, 0)), Some(ts(10, 3, 0))),
            job(Some(ts(9, 23, 0)), Some(ts(10, 1, 0))),
            job(Some(ts(8, 10, 0)), Some(ts(8, 12, 0))),
            // Still processing: ignored.
            job(Some(ts(10, 4, 0)), None),
            job(None, None),
        ];

        let stats = queue_stats(&jobs, day(10), &Utc);
        assert_eq!(stats.processed_today, 1);
        // Six hours of processing is less than a day, so the divisor is one.
        assert!(approx(stats.average_processed_per_day, 3.0));
        assert!(approx(stats.average_processing_secs, 2.0 * 3600.0));
    }

    #[test]
    fn test_average_per_day_uses_processing_days() {
        let jobs = vec![
            job(Some(ts(1, 0, 0)), Some(ts(2, 0, 0))),
            job(Some(ts(3, 0, 0)), Some(ts(4, 0, 0))),
            job(Some(ts(5, 0, 0)), Some(ts(5, 12, 0))),
        ];
        let stats = queue_stats(&jobs, day(5), &Utc);
        assert!(approx(stats.average_processed_per_day, 3.0 / 2.5));
        assert_eq!(stats.processed_today, 1);
    }

    #[test]
    fn test_daily_load_splits_across_midnight() {
        let jobs = vec![
            job(Some(ts(9, 18, 0)), Some(ts(11, 6, 0))),
            job(Some(ts(11, 12, 0)), Some(ts(11, 18, 0))),
        ];
        let load = daily_load(&jobs, &Utc);

        assert_eq!(load.len(), 3);
        assert!(approx(load[&day(9)], 0.25));
        assert!(approx(load[&day(10)], 1.0));
        assert!(approx(load[&day(11)], 0.5));
    }

    #[test]
    fn test_daily_load_follows_time_zone() {
        let tz = chrono::FixedOffset::east_opt(2 * 3600).unwrap();
        // 23:00 UTC is 01:00 the next day at +02:00.
        let jobs = vec![job(Some(ts(9, 23, 0)), Some(ts(10, 5, 0)))];

        let load = daily_load(&jobs, &tz);
        assert_eq!(load.keys().copied().collect::<Vec<_>>(), vec![day(10)]);
        assert!(approx(load[&day(10)], 0.25));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_daily_load_sums_to_processing_time(
            start_min in 0i64..(20 * 24 * 60),
            len_min in 0i64..(5 * 24 * 60),
        ) {
            let started = ts(1, 0, 0) + ChronoDuration::minutes(start_min);
            let finished = started + ChronoDuration::minutes(len_min);
            let load = daily_load(&[job(Some(started), Some(finished))], &Utc);

            let total: f64 = load.values().sum();
            prop_assert!((total - len_min as f64 / (24.0 * 60.0)).abs() < 1e-6);
            prop_assert!(load.values().all(|v| (0.0..=1.0 + 1e-9).contains(v)));
        }
    }
}
