use std::collections::HashMap;
use std::future::Future;
use std::io::Read;

use serde::Deserialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{AttendanceError, Result};
use crate::models::{AttendanceMark, AttendanceRecord, AttendanceStatus, Schedule, Student};

#[derive(Debug, Clone, PartialEq)]
struct Mark {
    status: AttendanceStatus,
    notes: Option<String>,
}

/// One teacher's in-progress marking of a single schedule.
#[derive(Debug)]
pub struct MarkingSession {
    schedule: Schedule,
    roster: Vec<Student>,
    marks: HashMap<Uuid, Mark>,
    pending_visitors: Vec<String>,
    unsaved: bool,
}

impl MarkingSession {
    pub fn start(schedule: Schedule, roster: Vec<Student>) -> Result<Self> {
        if schedule.is_cancelled {
            return Err(AttendanceError::Validation(format!(
                "the {} service on {} is cancelled",
                schedule.service_time_name, schedule.date
            )));
        }
        Ok(Self {
            schedule,
            roster,
            marks: HashMap::new(),
            pending_visitors: Vec::new(),
            unsaved: false,
        })
    }

    /// Seeds the session with marks already stored for the schedule. They do
    /// not count as unsaved.
    pub fn load_existing(&mut self, records: &[AttendanceRecord]) {
        for record in records {
            if record.schedule_id == self.schedule.id && self.contains(record.student_id) {
                self.marks.insert(
                    record.student_id,
                    Mark {
                        status: record.status,
                        notes: record.notes.clone(),
                    },
                );
            }
        }
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn roster(&self) -> &[Student] {
        &self.roster
    }

    fn contains(&self, student_id: Uuid) -> bool {
        self.roster.iter().any(|student| student.id == student_id)
    }

    /// Records a status; marking the same student again overwrites.
    pub fn mark(
        &mut self,
        student_id: Uuid,
        status: AttendanceStatus,
        notes: Option<String>,
    ) -> Result<()> {
        if !self.contains(student_id) {
            return Err(AttendanceError::NotFound {
                entity: "student in session",
                key: student_id.to_string(),
            });
        }
        let notes = notes.filter(|n| !n.trim().is_empty());
        self.marks.insert(student_id, Mark { status, notes });
        self.unsaved = true;
        Ok(())
    }

    /// Marks a visitor present by name. Names already on the roster are
    /// marked directly; new ones wait in memory until `admit_visitor` is given
    /// the stored student, so nothing is written for a session that is
    /// later discarded.
    pub fn queue_visitor(&mut self, name: &str) -> Result<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AttendanceError::Validation(
                "visitor name must not be empty".to_string(),
            ));
        }
        if let Some(id) = self.find_by_name(name).map(|student| student.id) {
            return self.mark(id, AttendanceStatus::Present, None);
        }
        let folded = fold(name);
        if !self.pending_visitors.iter().any(|pending| fold(pending) == folded) {
            debug!(visitor = name, "visitor queued");
            self.pending_visitors.push(name.to_string());
        }
        self.unsaved = true;
        Ok(())
    }

    pub fn pending_visitors(&self) -> &[String] {
        &self.pending_visitors
    }

    /// Adds a stored visitor to the roster, marked present, and clears any
    /// queued entry with the same name.
    pub fn admit_visitor(&mut self, visitor: Student) -> Result<()> {
        let folded = fold(&visitor.name);
        self.pending_visitors.retain(|pending| fold(pending) != folded);
        let id = visitor.id;
        if !self.contains(id) {
            debug!(visitor = %visitor.name, "visitor added to session");
            self.roster.push(visitor);
        }
        self.mark(id, AttendanceStatus::Present, None)
    }

    pub fn status_of(&self, student_id: Uuid) -> Option<AttendanceStatus> {
        self.marks.get(&student_id).map(|mark| mark.status)
    }

    pub fn completed(&self) -> usize {
        self.roster
            .iter()
            .filter(|student| self.marks.contains_key(&student.id))
            .count()
    }

    pub fn total(&self) -> usize {
        self.roster.len()
    }

    pub fn is_complete(&self) -> bool {
        self.completed() == self.total()
    }

    /// Next card for the swipe interface.
    pub fn next_unmarked(&self) -> Option<&Student> {
        self.roster
            .iter()
            .find(|student| !self.marks.contains_key(&student.id))
    }

    /// Case- and accent-insensitive substring search over the roster.
    pub fn search(&self, query: &str) -> Vec<&Student> {
        let needle = fold(query.trim());
        self.roster
            .iter()
            .filter(|student| fold(&student.name).contains(&needle))
            .collect()
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Student> {
        let needle = fold(name.trim());
        self.roster
            .iter()
            .find(|student| fold(&student.name) == needle)
    }

    /// Rows for persistence, in roster order.
    pub fn to_marks(&self) -> Vec<AttendanceMark> {
        self.roster
            .iter()
            .filter_map(|student| {
                self.marks.get(&student.id).map(|mark| AttendanceMark {
                    student_id: student.id,
                    schedule_id: self.schedule.id,
                    status: mark.status,
                    notes: mark.notes.clone(),
                })
            })
            .collect()
    }

    pub fn has_unsaved_changes(&self) -> bool {
        self.unsaved
    }

    /// Marks plus queued visitors that would be lost on discard.
    pub fn unsaved_marks(&self) -> usize {
        if self.unsaved {
            self.completed() + self.pending_visitors.len()
        } else {
            0
        }
    }

    pub fn mark_saved(&mut self) {
        self.unsaved = false;
    }

    fn discard(&mut self) {
        self.marks.clear();
        self.pending_visitors.clear();
        self.unsaved = false;
    }

    /// Hands every mark to `persist`. On failure the marks stay in the
    /// session so the save can be retried.
    pub async fn submit<F, Fut>(&mut self, persist: F) -> Result<usize>
    where
        F: FnOnce(Vec<AttendanceMark>) -> Fut,
        Fut: Future<Output = Result<usize>>,
    {
        if !self.pending_visitors.is_empty() {
            return Err(AttendanceError::Validation(format!(
                "visitors not yet added to the roster: {}",
                self.pending_visitors.join(", ")
            )));
        }
        let marks = self.to_marks();
        if marks.is_empty() {
            return Err(AttendanceError::Validation(
                "no students have been marked".to_string(),
            ));
        }
        let saved = persist(marks).await?;
        self.mark_saved();
        info!(
            schedule = %self.schedule.id,
            saved,
            completed = self.completed(),
            total = self.total(),
            "marking session saved"
        );
        Ok(saved)
    }
}

fn fold(value: &str) -> String {
    value
        .chars()
        .flat_map(char::to_lowercase)
        .map(|c| match c {
            'á' | 'à' | 'â' | 'ã' | 'ä' => 'a',
            'é' | 'è' | 'ê' | 'ë' => 'e',
            'í' | 'ì' | 'î' | 'ï' => 'i',
            'ó' | 'ò' | 'ô' | 'õ' | 'ö' => 'o',
            'ú' | 'ù' | 'û' | 'ü' => 'u',
            'ç' => 'c',
            'ñ' => 'n',
            other => other,
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationDecision {
    Proceed,
    Blocked { unsaved_marks: usize },
}

/// Stops navigation away from a session that still has unsaved marks.
#[derive(Debug, Default)]
pub struct NavigationGuard {
    blocked: bool,
}

impl NavigationGuard {
    pub fn check(&mut self, session: &MarkingSession) -> NavigationDecision {
        if session.has_unsaved_changes() {
            self.blocked = true;
            NavigationDecision::Blocked {
                unsaved_marks: session.unsaved_marks(),
            }
        } else {
            self.blocked = false;
            NavigationDecision::Proceed
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked
    }

    pub fn confirm_discard(&mut self, session: &mut MarkingSession) -> NavigationDecision {
        session.discard();
        self.blocked = false;
        NavigationDecision::Proceed
    }

    pub fn keep_marking(&mut self) {
        self.blocked = false;
    }
}

#[derive(Debug, Deserialize)]
struct MarkRow {
    student: String,
    status: String,
    #[serde(default)]
    note: Option<String>,
}

/// Applies `student,status,note` rows to the session. `student` is a roster
/// name or id.
pub fn apply_csv<R: Read>(session: &mut MarkingSession, reader: R) -> Result<usize> {
    let mut reader = csv::Reader::from_reader(reader);
    let mut applied = 0usize;

    for (line, result) in reader.deserialize::<MarkRow>().enumerate() {
        let row = result.map_err(|err| {
            AttendanceError::Validation(format!("mark row {}: {err}", line + 1))
        })?;
        let status = row
            .status
            .parse::<AttendanceStatus>()
            .map_err(|err| AttendanceError::Validation(format!("mark row {}: {err}", line + 1)))?;

        let student_id = match Uuid::parse_str(row.student.trim()) {
            Ok(id) => id,
            Err(_) => session
                .find_by_name(&row.student)
                .map(|student| student.id)
                .ok_or_else(|| AttendanceError::NotFound {
                    entity: "student in session",
                    key: row.student.clone(),
                })?,
        };

        session.mark(student_id, status, row.note)?;
        applied += 1;
    }

    Ok(applied)
}
