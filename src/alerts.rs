use std::collections::BTreeMap;

use chrono::NaiveDate;
use tracing::debug;
use uuid::Uuid;

use crate::error::{AttendanceError, Result};
use crate::models::{AbsenceAlert, AttendanceStatus, DatedAttendance};

pub const DEFAULT_ABSENCE_THRESHOLD: usize = 3;

/// Read access the alert calculator needs from the backend.
#[allow(async_fn_in_trait)]
pub trait AttendanceSource {
    /// Records whose schedule date is strictly before `cutoff`.
    async fn fetch_attendance_before(
        &self,
        student_ids: &[Uuid],
        cutoff: NaiveDate,
    ) -> Result<Vec<DatedAttendance>>;

    /// Active students that are not visitors.
    async fn active_regular_student_ids(&self) -> Result<Vec<Uuid>>;
}

pub fn parse_cutoff(value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").map_err(|err| {
        AttendanceError::Validation(format!("cutoff date '{value}' is not YYYY-MM-DD: {err}"))
    })
}

pub async fn check_consecutive_absences<S: AttendanceSource>(
    source: &S,
    student_ids: &[Uuid],
    threshold: usize,
    cutoff: NaiveDate,
) -> Result<Vec<AbsenceAlert>> {
    validate_threshold(threshold)?;
    if student_ids.is_empty() {
        return Ok(Vec::new());
    }

    let records = source
        .fetch_attendance_before(student_ids, cutoff)
        .await
        .map_err(|err| AttendanceError::AlertComputation(Box::new(err)))?;
    debug!(
        students = student_ids.len(),
        records = records.len(),
        %cutoff,
        "computing absence streaks"
    );

    compute_alerts(&records, threshold)
}

pub async fn check_all_active_students<S: AttendanceSource>(
    source: &S,
    threshold: usize,
    cutoff: NaiveDate,
) -> Result<Vec<AbsenceAlert>> {
    let student_ids = source
        .active_regular_student_ids()
        .await
        .map_err(|err| AttendanceError::AlertComputation(Box::new(err)))?;
    check_consecutive_absences(source, &student_ids, threshold, cutoff).await
}

/// Streaks count explicit records only. A date with no record for the
/// student neither extends nor breaks the streak, and presence at any
/// service on a date makes that date present.
pub fn compute_alerts(records: &[DatedAttendance], threshold: usize) -> Result<Vec<AbsenceAlert>> {
    validate_threshold(threshold)?;

    let mut by_student: BTreeMap<Uuid, BTreeMap<NaiveDate, AttendanceStatus>> = BTreeMap::new();
    for record in records {
        let entry = by_student
            .entry(record.student_id)
            .or_default()
            .entry(record.date)
            .or_insert(record.status);
        if record.status == AttendanceStatus::Present {
            *entry = AttendanceStatus::Present;
        }
    }

    let mut alerts = Vec::new();
    for (student_id, dates) in by_student {
        let mut streak: Vec<NaiveDate> = dates
            .iter()
            .rev()
            .take_while(|(_, status)| **status == AttendanceStatus::Absent)
            .map(|(date, _)| *date)
            .collect();

        if streak.len() < threshold {
            continue;
        }

        streak.reverse();
        alerts.push(AbsenceAlert {
            student_id,
            absence_count: streak.len(),
            first_absence_date: streak[0],
            last_absence_date: streak[streak.len() - 1],
            absence_dates: streak,
        });
    }

    alerts.sort_by(|a, b| {
        b.absence_count
            .cmp(&a.absence_count)
            .then_with(|| a.student_id.cmp(&b.student_id))
    });
    Ok(alerts)
}

fn validate_threshold(threshold: usize) -> Result<()> {
    if threshold == 0 {
        return Err(AttendanceError::Validation(
            "absence threshold must be at least 1".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use std::cell::Cell;

    use super::*;

    /// In-memory source that counts how often it is queried.
    #[derive(Default)]
    pub(crate) struct MemorySource {
        pub records: Vec<DatedAttendance>,
        pub regulars: Vec<Uuid>,
        pub fetches: Cell<usize>,
        pub fail: bool,
    }

    impl AttendanceSource for MemorySource {
        async fn fetch_attendance_before(
            &self,
            student_ids: &[Uuid],
            cutoff: NaiveDate,
        ) -> Result<Vec<DatedAttendance>> {
            self.fetches.set(self.fetches.get() + 1);
            if self.fail {
                return Err(AttendanceError::backend("fetch attendance records")(
                    sqlx::Error::PoolTimedOut,
                ));
            }
            Ok(self
                .records
                .iter()
                .filter(|r| student_ids.contains(&r.student_id) && r.date < cutoff)
                .copied()
                .collect())
        }

        async fn active_regular_student_ids(&self) -> Result<Vec<Uuid>> {
            Ok(self.regulars.clone())
        }
    }

    fn day(value: &str) -> NaiveDate {
        NaiveDate::parse_from_str(value, "%Y-%m-%d").unwrap()
    }

    fn record(student_id: Uuid, date: &str, status: AttendanceStatus) -> DatedAttendance {
        DatedAttendance {
            student_id,
            date: day(date),
            status,
        }
    }

    use AttendanceStatus::{Absent, Present};

    #[test]
    fn no_records_means_no_alert() {
        let alerts = compute_alerts(&[], 3).unwrap();
        assert!(alerts.is_empty());
    }

    #[test]
    fn most_recent_present_suppresses_alert() {
        let id = Uuid::new_v4();
        let records = vec![
            record(id, "2025-09-07", Absent),
            record(id, "2025-09-14", Absent),
            record(id, "2025-09-21", Absent),
            record(id, "2025-09-28", Absent),
            record(id, "2025-10-05", Present),
        ];
        assert!(compute_alerts(&records, 3).unwrap().is_empty());
    }

    #[test]
    fn streak_stops_at_first_present() {
        let id = Uuid::new_v4();
        let records = vec![
            record(id, "2025-10-26", Absent),
            record(id, "2025-10-19", Absent),
            record(id, "2025-10-12", Absent),
            record(id, "2025-10-05", Present),
            record(id, "2025-09-28", Absent),
        ];
        let alerts = compute_alerts(&records, 3).unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].absence_count, 3);
        assert_eq!(
            alerts[0].absence_dates,
            vec![day("2025-10-12"), day("2025-10-19"), day("2025-10-26")]
        );
    }

    #[test]
    fn short_streak_stays_below_threshold() {
        let id = Uuid::new_v4();
        let records = vec![record(id, "2025-10-26", Absent), record(id, "2025-10-19", Absent)];
        assert!(compute_alerts(&records, 3).unwrap().is_empty());
    }

    #[test]
    fn unmarked_sundays_do_not_break_streak() {
        let id = Uuid::new_v4();
        let records = vec![
            record(id, "2025-11-17", Absent),
            record(id, "2025-10-06", Absent),
            record(id, "2025-09-29", Absent),
        ];
        let alerts = compute_alerts(&records, 3).unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].absence_count, 3);
        assert_eq!(alerts[0].first_absence_date, day("2025-09-29"));
        assert_eq!(alerts[0].last_absence_date, day("2025-11-17"));
    }

    #[test]
    fn presence_at_any_service_marks_the_date_present() {
        let id = Uuid::new_v4();
        let records = vec![
            record(id, "2025-10-26", Absent),
            record(id, "2025-10-26", Present),
            record(id, "2025-10-19", Absent),
            record(id, "2025-10-12", Absent),
            record(id, "2025-10-05", Absent),
        ];
        assert!(compute_alerts(&records, 3).unwrap().is_empty());
        assert!(compute_alerts(&records, 1).unwrap().is_empty());
    }

    #[test]
    fn alerts_are_ordered_by_streak_length() {
        let short = Uuid::new_v4();
        let long = Uuid::new_v4();
        let records = vec![
            record(short, "2025-10-26", Absent),
            record(long, "2025-10-26", Absent),
            record(long, "2025-10-19", Absent),
        ];
        let alerts = compute_alerts(&records, 1).unwrap();
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].student_id, long);
        assert_eq!(alerts[1].student_id, short);
    }

    #[test]
    fn zero_threshold_is_rejected() {
        assert!(matches!(
            compute_alerts(&[], 0),
            Err(AttendanceError::Validation(_))
        ));
    }

    #[test]
    fn parse_cutoff_requires_iso_dates() {
        assert_eq!(parse_cutoff("2025-11-23").unwrap(), day("2025-11-23"));
        assert!(parse_cutoff("23/11/2025").is_err());
    }

    #[tokio::test]
    async fn empty_student_list_skips_the_fetch() {
        let source = MemorySource::default();
        let alerts = check_consecutive_absences(&source, &[], 3, day("2025-11-23"))
            .await
            .unwrap();
        assert!(alerts.is_empty());
        assert_eq!(source.fetches.get(), 0);
    }

    #[tokio::test]
    async fn cutoff_date_itself_is_excluded() {
        let id = Uuid::new_v4();
        let source = MemorySource {
            records: vec![
                record(id, "2025-11-23", Absent),
                record(id, "2025-11-16", Absent),
                record(id, "2025-11-09", Absent),
                record(id, "2025-11-02", Present),
            ],
            ..MemorySource::default()
        };
        let alerts = check_consecutive_absences(&source, &[id], 3, day("2025-11-23"))
            .await
            .unwrap();
        assert!(alerts.is_empty());
        assert_eq!(source.fetches.get(), 1);
    }

    #[tokio::test]
    async fn fetch_failure_yields_no_partial_result() {
        let source = MemorySource {
            fail: true,
            ..MemorySource::default()
        };
        let result =
            check_consecutive_absences(&source, &[Uuid::new_v4()], 3, day("2025-11-23")).await;
        assert!(matches!(result, Err(AttendanceError::AlertComputation(_))));
    }

    #[tokio::test]
    async fn repeated_runs_are_identical() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut records = Vec::new();
        for date in ["2025-10-05", "2025-10-12", "2025-10-19", "2025-10-26"] {
            records.push(record(a, date, Absent));
            records.push(record(b, date, Absent));
        }
        let source = MemorySource {
            records,
            regulars: vec![a, b],
            ..MemorySource::default()
        };
        let first = check_all_active_students(&source, 3, day("2025-11-02"))
            .await
            .unwrap();
        let second = check_all_active_students(&source, 3, day("2025-11-02"))
            .await
            .unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }
}
