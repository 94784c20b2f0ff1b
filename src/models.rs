use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StudentStatus {
    Active,
    Inactive,
    AgedOut,
    Moved,
}

impl StudentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StudentStatus::Active => "active",
            StudentStatus::Inactive => "inactive",
            StudentStatus::AgedOut => "aged_out",
            StudentStatus::Moved => "moved",
        }
    }
}

impl fmt::Display for StudentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StudentStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "active" => Ok(StudentStatus::Active),
            "inactive" => Ok(StudentStatus::Inactive),
            "aged_out" => Ok(StudentStatus::AgedOut),
            "moved" => Ok(StudentStatus::Moved),
            other => Err(format!("unknown student status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceStatus {
    Present,
    Absent,
}

impl AttendanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AttendanceStatus::Present => "present",
            AttendanceStatus::Absent => "absent",
        }
    }
}

impl fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttendanceStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "present" | "p" => Ok(AttendanceStatus::Present),
            "absent" | "a" => Ok(AttendanceStatus::Absent),
            other => Err(format!("unknown attendance status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Student {
    pub id: Uuid,
    pub name: String,
    pub is_visitor: bool,
    pub status: StudentStatus,
    pub notes: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct NewStudent {
    pub name: String,
    pub is_visitor: bool,
    pub notes: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
}

/// Partial update; `None` leaves the column untouched.
#[derive(Debug, Clone, Default)]
pub struct StudentUpdate {
    pub name: Option<String>,
    pub is_visitor: Option<bool>,
    pub status: Option<StudentStatus>,
    pub notes: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
}

impl StudentUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.is_visitor.is_none()
            && self.status.is_none()
            && self.notes.is_none()
            && self.date_of_birth.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Teacher {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceTime {
    pub id: Uuid,
    pub name: String,
    pub time: Option<NaiveTime>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Lesson {
    pub id: Uuid,
    pub name: String,
    pub resource_url: Option<String>,
    pub curriculum_series: Option<String>,
    pub lesson_number: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Schedule {
    pub id: Uuid,
    pub date: NaiveDate,
    pub service_time_id: Uuid,
    pub service_time_name: String,
    pub lesson_id: Option<Uuid>,
    pub lesson_name: Option<String>,
    pub is_cancelled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceRecord {
    pub id: Uuid,
    pub student_id: Uuid,
    pub schedule_id: Uuid,
    pub status: AttendanceStatus,
    pub marked_at: DateTime<Utc>,
    pub notes: Option<String>,
}

/// One row of a bulk attendance upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct AttendanceMark {
    pub student_id: Uuid,
    pub schedule_id: Uuid,
    pub status: AttendanceStatus,
    pub notes: Option<String>,
}

/// An attendance record joined to the date of its schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatedAttendance {
    pub student_id: Uuid,
    pub date: NaiveDate,
    pub status: AttendanceStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AbsenceAlert {
    pub student_id: Uuid,
    pub absence_count: usize,
    /// Oldest first.
    pub absence_dates: Vec<NaiveDate>,
    pub first_absence_date: NaiveDate,
    pub last_absence_date: NaiveDate,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub date: NaiveDate,
    pub service_time_name: String,
    pub lesson_name: Option<String>,
    pub student_id: Uuid,
    pub student_name: String,
    pub status: AttendanceStatus,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub student_id: Option<Uuid>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSummary {
    pub present: usize,
    pub absent: usize,
    pub unmarked: usize,
}
