use std::collections::HashMap;
use std::fmt::Write;

use chrono::NaiveDate;
use uuid::Uuid;

use crate::models::{
    AbsenceAlert, AttendanceRecord, AttendanceStatus, HistoryEntry, Schedule, SessionSummary,
    Student,
};

/// Counts roster students by stored status for one schedule. Records for
/// other schedules or for students outside the roster are ignored.
pub fn build_session_summary(
    schedule: &Schedule,
    roster: &[Student],
    records: &[AttendanceRecord],
) -> SessionSummary {
    let by_student: HashMap<Uuid, AttendanceStatus> = records
        .iter()
        .filter(|record| record.schedule_id == schedule.id)
        .map(|record| (record.student_id, record.status))
        .collect();

    let mut summary = SessionSummary::default();
    for student in roster {
        match by_student.get(&student.id) {
            Some(AttendanceStatus::Present) => summary.present += 1,
            Some(AttendanceStatus::Absent) => summary.absent += 1,
            None => summary.unmarked += 1,
        }
    }
    summary
}

pub fn describe_alert(alert: &AbsenceAlert, name: &str) -> String {
    format!(
        "{} missed {} marked Sundays in a row ({} to {})",
        name, alert.absence_count, alert.first_absence_date, alert.last_absence_date
    )
}

pub fn build_report(
    date: NaiveDate,
    sessions: &[(Schedule, SessionSummary)],
    alerts: &[AbsenceAlert],
    student_names: &HashMap<Uuid, String>,
    history: &[HistoryEntry],
) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Sunday School Attendance Report");
    let _ = writeln!(output, "Generated for {}", date);
    let _ = writeln!(output);
    let _ = writeln!(output, "## Services");

    if sessions.is_empty() {
        let _ = writeln!(output, "No services scheduled for this date.");
    } else {
        for (schedule, summary) in sessions {
            let lesson = schedule.lesson_name.as_deref().unwrap_or("no lesson");
            if schedule.is_cancelled {
                let _ = writeln!(output, "- {} ({}): cancelled", schedule.service_time_name, lesson);
                continue;
            }
            let _ = writeln!(
                output,
                "- {} ({}): {} present, {} absent, {} unmarked",
                schedule.service_time_name, lesson, summary.present, summary.absent, summary.unmarked
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Absence Alerts");

    if alerts.is_empty() {
        let _ = writeln!(output, "No students with consecutive absences.");
    } else {
        for alert in alerts {
            let name = student_names
                .get(&alert.student_id)
                .map(String::as_str)
                .unwrap_or("Unknown student");
            let _ = writeln!(output, "- {}", describe_alert(alert, name));
        }
    }

    let mut noted: Vec<&HistoryEntry> = history
        .iter()
        .filter(|entry| entry.notes.as_deref().is_some_and(|n| !n.trim().is_empty()))
        .collect();
    noted.sort_by(|a, b| b.date.cmp(&a.date));
    let _ = writeln!(output);
    let _ = writeln!(output, "## Recent Notes");

    if noted.is_empty() {
        let _ = writeln!(output, "No notes recorded.");
    } else {
        for entry in noted.iter().take(5) {
            let _ = writeln!(
                output,
                "- {} ({}, {}) on {}: {}",
                entry.student_name,
                entry.status,
                entry.service_time_name,
                entry.date,
                entry.notes.as_deref().unwrap_or_default()
            );
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::models::StudentStatus;

    fn student(name: &str) -> Student {
        Student {
            id: Uuid::new_v4(),
            name: name.to_string(),
            is_visitor: false,
            status: StudentStatus::Active,
            notes: None,
            date_of_birth: None,
            created_at: Utc::now(),
        }
    }

    fn record(schedule_id: Uuid, student_id: Uuid, status: AttendanceStatus) -> AttendanceRecord {
        AttendanceRecord {
            id: Uuid::new_v4(),
            student_id,
            schedule_id,
            status,
            marked_at: Utc::now(),
            notes: None,
        }
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 11, d).unwrap()
    }

    fn morning() -> Schedule {
        Schedule {
            id: Uuid::new_v4(),
            date: day(23),
            service_time_id: Uuid::new_v4(),
            service_time_name: "9h".to_string(),
            lesson_id: None,
            lesson_name: Some("Abraão".to_string()),
            is_cancelled: false,
        }
    }

    #[test]
    fn summary_counts_unmarked_roster_students() {
        let schedule = morning();
        let roster = vec![student("Davi"), student("Helena"), student("Lucas")];
        let records = vec![
            record(schedule.id, roster[0].id, AttendanceStatus::Present),
            record(schedule.id, roster[1].id, AttendanceStatus::Absent),
            record(schedule.id, Uuid::new_v4(), AttendanceStatus::Present),
            record(Uuid::new_v4(), roster[2].id, AttendanceStatus::Present),
        ];
        let summary = build_session_summary(&schedule, &roster, &records);
        assert_eq!(
            summary,
            SessionSummary {
                present: 1,
                absent: 1,
                unmarked: 1
            }
        );
    }

    #[test]
    fn report_lists_services_alerts_and_notes() {
        let schedule = morning();
        let lucas = Uuid::new_v4();
        let alert = AbsenceAlert {
            student_id: lucas,
            absence_count: 3,
            absence_dates: vec![day(2), day(9), day(16)],
            first_absence_date: day(2),
            last_absence_date: day(16),
        };
        let names = HashMap::from([(lucas, "Lucas Almeida".to_string())]);
        let history = vec![HistoryEntry {
            date: day(16),
            service_time_name: "9h".to_string(),
            lesson_name: None,
            student_id: lucas,
            student_name: "Lucas Almeida".to_string(),
            status: AttendanceStatus::Absent,
            notes: Some("viajando".to_string()),
        }];

        let report = build_report(
            day(23),
            &[(
                schedule,
                SessionSummary {
                    present: 4,
                    absent: 1,
                    unmarked: 0,
                },
            )],
            &[alert],
            &names,
            &history,
        );

        assert!(report.contains("- 9h (Abraão): 4 present, 1 absent, 0 unmarked"));
        assert!(report.contains(
            "- Lucas Almeida missed 3 marked Sundays in a row (2025-11-02 to 2025-11-16)"
        ));
        assert!(report.contains("- Lucas Almeida (absent, 9h) on 2025-11-16: viajando"));
    }

    #[test]
    fn empty_report_has_placeholders() {
        let report = build_report(day(23), &[], &[], &HashMap::new(), &[]);
        assert!(report.contains("No services scheduled for this date."));
        assert!(report.contains("No students with consecutive absences."));
        assert!(report.contains("No notes recorded."));
    }
}
