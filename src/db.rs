use chrono::{NaiveDate, NaiveTime};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use crate::alerts::AttendanceSource;
use crate::error::{AttendanceError, Result};
use crate::models::{
    AttendanceMark, AttendanceRecord, AttendanceStatus, DatedAttendance, HistoryEntry,
    HistoryFilter, Lesson, NewStudent, Schedule, ServiceTime, Student, StudentStatus,
    StudentUpdate, Teacher,
};
use crate::retry::{with_retry, RetryPolicy};

const STUDENT_COLUMNS: &str =
    "id, name, is_visitor, status, notes, date_of_birth, created_at";

const SCHEDULE_SELECT: &str = "SELECT s.id, s.date, s.service_time_id, st.name AS service_time_name, \
     s.lesson_id, l.name AS lesson_name, s.is_cancelled \
     FROM sunday_school.schedules s \
     JOIN sunday_school.service_times st ON st.id = s.service_time_id \
     LEFT JOIN sunday_school.lessons l ON l.id = s.lesson_id";

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub async fn seed(pool: &PgPool) -> Result<()> {
    let service_times = [
        ("9h", NaiveTime::from_hms_opt(9, 0, 0)),
        ("11h", NaiveTime::from_hms_opt(11, 0, 0)),
    ];
    let mut service_ids = Vec::new();
    for (name, time) in service_times {
        let id: Uuid = sqlx::query(
            r#"
            INSERT INTO sunday_school.service_times (id, name, time)
            VALUES ($1, $2, $3)
            ON CONFLICT (name) DO UPDATE SET time = EXCLUDED.time
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(time)
        .fetch_one(pool)
        .await
        .map_err(AttendanceError::backend("seed service times"))?
        .get("id");
        service_ids.push(id);
    }

    let teachers = [
        ("Ana Souza", "ana.souza@igreja.org"),
        ("Bruno Lima", "bruno.lima@igreja.org"),
    ];
    let mut teacher_ids = Vec::new();
    for (name, email) in teachers {
        let id: Uuid = sqlx::query(
            r#"
            INSERT INTO sunday_school.teachers (id, name, email, is_active)
            VALUES ($1, $2, $3, TRUE)
            ON CONFLICT (email) DO UPDATE SET name = EXCLUDED.name
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(email)
        .fetch_one(pool)
        .await
        .map_err(AttendanceError::backend("seed teachers"))?
        .get("id");
        teacher_ids.push(id);
    }

    let students = ["Davi Rocha", "Helena Costa", "Lucas Almeida", "Maria Ferreira"];
    let mut student_ids = Vec::new();
    for name in students {
        let student = create_student(
            pool,
            &NewStudent {
                name: name.to_string(),
                ..NewStudent::default()
            },
        )
        .await?;
        student_ids.push(student.id);
    }

    let lessons = [
        ("A Criação", "https://example.org/licoes/criacao"),
        ("Noé e a Arca", "https://example.org/licoes/noe"),
        ("Abraão", "https://example.org/licoes/abraao"),
    ];
    let first_sunday = NaiveDate::from_ymd_opt(2025, 10, 5)
        .ok_or_else(|| AttendanceError::Validation("invalid seed date".to_string()))?;
    for (week, (name, link)) in lessons.into_iter().enumerate() {
        let lesson_id = upsert_lesson(pool, name, Some(link)).await?;
        let date = first_sunday + chrono::Duration::weeks(week as i64);
        for service_id in &service_ids {
            let schedule_id = upsert_schedule(pool, date, *service_id, Some(lesson_id)).await?;
            replace_schedule_assignments(pool, schedule_id, &teacher_ids).await?;
        }
    }

    // Lucas misses every seeded Sunday so the alert check has something to show.
    let mut marks = Vec::new();
    for schedule in list_all_schedules(pool).await? {
        for (index, student_id) in student_ids.iter().enumerate() {
            let status = if index == 2 {
                AttendanceStatus::Absent
            } else {
                AttendanceStatus::Present
            };
            marks.push(AttendanceMark {
                student_id: *student_id,
                schedule_id: schedule.id,
                status,
                notes: None,
            });
        }
    }
    save_attendance(pool, &marks).await?;

    Ok(())
}

fn student_from_row(row: &PgRow) -> Result<Student> {
    let status: String = row
        .try_get("status")
        .map_err(|err| AttendanceError::invalid_row("student", err))?;
    Ok(Student {
        id: row
            .try_get("id")
            .map_err(|err| AttendanceError::invalid_row("student", err))?,
        name: row
            .try_get("name")
            .map_err(|err| AttendanceError::invalid_row("student", err))?,
        is_visitor: row
            .try_get("is_visitor")
            .map_err(|err| AttendanceError::invalid_row("student", err))?,
        status: status
            .parse::<StudentStatus>()
            .map_err(|err| AttendanceError::invalid_row("student", err))?,
        notes: row
            .try_get("notes")
            .map_err(|err| AttendanceError::invalid_row("student", err))?,
        date_of_birth: row
            .try_get("date_of_birth")
            .map_err(|err| AttendanceError::invalid_row("student", err))?,
        created_at: row
            .try_get("created_at")
            .map_err(|err| AttendanceError::invalid_row("student", err))?,
    })
}

fn teacher_from_row(row: &PgRow) -> Teacher {
    Teacher {
        id: row.get("id"),
        name: row.get("name"),
        email: row.get("email"),
        is_active: row.get("is_active"),
    }
}

fn lesson_from_row(row: &PgRow) -> Lesson {
    Lesson {
        id: row.get("id"),
        name: row.get("name"),
        resource_url: row.get("resource_url"),
        curriculum_series: row.get("curriculum_series"),
        lesson_number: row.get("lesson_number"),
    }
}

fn schedule_from_row(row: &PgRow) -> Schedule {
    Schedule {
        id: row.get("id"),
        date: row.get("date"),
        service_time_id: row.get("service_time_id"),
        service_time_name: row.get("service_time_name"),
        lesson_id: row.get("lesson_id"),
        lesson_name: row.get("lesson_name"),
        is_cancelled: row.get("is_cancelled"),
    }
}

fn attendance_status(row: &PgRow, entity: &'static str) -> Result<AttendanceStatus> {
    let raw: String = row
        .try_get("status")
        .map_err(|err| AttendanceError::invalid_row(entity, err))?;
    raw.parse::<AttendanceStatus>()
        .map_err(|err| AttendanceError::invalid_row(entity, err))
}

pub async fn list_students(pool: &PgPool, include_inactive: bool) -> Result<Vec<Student>> {
    let query = format!(
        "SELECT {STUDENT_COLUMNS} FROM sunday_school.students \
         WHERE ($1 OR status = 'active') ORDER BY name"
    );
    let rows = sqlx::query(&query)
        .bind(include_inactive)
        .fetch_all(pool)
        .await
        .map_err(AttendanceError::backend("fetch students"))?;
    rows.iter().map(student_from_row).collect()
}

pub async fn list_active_regular_students(pool: &PgPool) -> Result<Vec<Student>> {
    let query = format!(
        "SELECT {STUDENT_COLUMNS} FROM sunday_school.students \
         WHERE status = 'active' AND NOT is_visitor ORDER BY name"
    );
    let rows = sqlx::query(&query)
        .fetch_all(pool)
        .await
        .map_err(AttendanceError::backend("fetch active students"))?;
    rows.iter().map(student_from_row).collect()
}

pub async fn get_student(pool: &PgPool, id: Uuid) -> Result<Student> {
    let query = format!("SELECT {STUDENT_COLUMNS} FROM sunday_school.students WHERE id = $1");
    let row = sqlx::query(&query)
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AttendanceError::backend("fetch student"))?
        .ok_or_else(|| AttendanceError::NotFound {
            entity: "student",
            key: id.to_string(),
        })?;
    student_from_row(&row)
}

/// Upserts by name. Re-adding a known name reactivates the student and can
/// promote a visitor to a regular, never the other way round.
pub async fn create_student(pool: &PgPool, student: &NewStudent) -> Result<Student> {
    let name = required_name(&student.name)?;

    let query = format!(
        r#"
        INSERT INTO sunday_school.students (id, name, is_visitor, status, notes, date_of_birth)
        VALUES ($1, $2, $3, 'active', $4, $5)
        ON CONFLICT (name) DO UPDATE
        SET is_visitor = students.is_visitor AND EXCLUDED.is_visitor,
            status = 'active',
            notes = COALESCE(EXCLUDED.notes, students.notes),
            date_of_birth = COALESCE(EXCLUDED.date_of_birth, students.date_of_birth)
        RETURNING {STUDENT_COLUMNS}
        "#
    );
    let row = sqlx::query(&query)
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(student.is_visitor)
        .bind(&student.notes)
        .bind(student.date_of_birth)
        .fetch_one(pool)
        .await
        .map_err(AttendanceError::backend("save student"))?;
    info!(name, visitor = student.is_visitor, "student saved");
    student_from_row(&row)
}

/// Inserts an active student unless the name is already taken. An existing
/// row comes back exactly as stored, status and visitor flag included.
pub async fn ensure_student(pool: &PgPool, name: &str, is_visitor: bool) -> Result<Student> {
    let name = required_name(name)?;

    // The no-op update makes RETURNING yield the existing row on conflict.
    let query = format!(
        r#"
        INSERT INTO sunday_school.students (id, name, is_visitor, status)
        VALUES ($1, $2, $3, 'active')
        ON CONFLICT (name) DO UPDATE SET name = students.name
        RETURNING {STUDENT_COLUMNS}
        "#
    );
    let row = sqlx::query(&query)
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(is_visitor)
        .fetch_one(pool)
        .await
        .map_err(AttendanceError::backend("save student"))?;
    student_from_row(&row)
}

/// Finds or creates a visitor. A regular with the same name is returned
/// untouched and stays on the regular roster.
pub async fn add_visitor(pool: &PgPool, name: &str) -> Result<Student> {
    let student = ensure_student(pool, name, true).await?;
    info!(name = %student.name, visitor = student.is_visitor, "visitor resolved");
    Ok(student)
}

fn required_name(name: &str) -> Result<&str> {
    let name = name.trim();
    if name.is_empty() {
        return Err(AttendanceError::Validation(
            "student name must not be empty".to_string(),
        ));
    }
    Ok(name)
}

pub async fn update_student(pool: &PgPool, id: Uuid, update: &StudentUpdate) -> Result<Student> {
    if update.is_empty() {
        return Err(AttendanceError::Validation(
            "nothing to update".to_string(),
        ));
    }

    let query = format!(
        r#"
        UPDATE sunday_school.students
        SET name = COALESCE($2, name),
            is_visitor = COALESCE($3, is_visitor),
            status = COALESCE($4, status),
            notes = COALESCE($5, notes),
            date_of_birth = COALESCE($6, date_of_birth)
        WHERE id = $1
        RETURNING {STUDENT_COLUMNS}
        "#
    );
    let row = sqlx::query(&query)
        .bind(id)
        .bind(update.name.as_deref().map(str::trim))
        .bind(update.is_visitor)
        .bind(update.status.map(StudentStatus::as_str))
        .bind(&update.notes)
        .bind(update.date_of_birth)
        .fetch_optional(pool)
        .await
        .map_err(AttendanceError::backend("update student"))?
        .ok_or_else(|| AttendanceError::NotFound {
            entity: "student",
            key: id.to_string(),
        })?;
    student_from_row(&row)
}

/// Soft delete: students are never removed, only moved out of `active`.
pub async fn deactivate_student(pool: &PgPool, id: Uuid, status: StudentStatus) -> Result<Student> {
    if status == StudentStatus::Active {
        return Err(AttendanceError::Validation(
            "deactivation requires inactive, aged_out or moved".to_string(),
        ));
    }
    let student = update_student(
        pool,
        id,
        &StudentUpdate {
            status: Some(status),
            ..StudentUpdate::default()
        },
    )
    .await?;
    info!(student = %id, %status, "student deactivated");
    Ok(student)
}

pub async fn list_teachers(pool: &PgPool) -> Result<Vec<Teacher>> {
    let rows = sqlx::query(
        "SELECT id, name, email, is_active FROM sunday_school.teachers ORDER BY name",
    )
    .fetch_all(pool)
    .await
    .map_err(AttendanceError::backend("fetch teachers"))?;
    Ok(rows.iter().map(teacher_from_row).collect())
}

pub async fn find_active_teacher_by_email(pool: &PgPool, email: &str) -> Result<Option<Teacher>> {
    let row = sqlx::query(
        r#"
        SELECT id, name, email, is_active
        FROM sunday_school.teachers
        WHERE lower(email) = lower($1) AND is_active
        "#,
    )
    .bind(email.trim())
    .fetch_optional(pool)
    .await
    .map_err(AttendanceError::backend("fetch teacher"))?;
    Ok(row.as_ref().map(teacher_from_row))
}

pub async fn first_active_teacher(pool: &PgPool) -> Result<Option<Teacher>> {
    let row = sqlx::query(
        "SELECT id, name, email, is_active FROM sunday_school.teachers \
         WHERE is_active ORDER BY name LIMIT 1",
    )
    .fetch_optional(pool)
    .await
    .map_err(AttendanceError::backend("fetch teacher"))?;
    Ok(row.as_ref().map(teacher_from_row))
}

pub async fn list_service_times(pool: &PgPool) -> Result<Vec<ServiceTime>> {
    let rows = sqlx::query(
        "SELECT id, name, time FROM sunday_school.service_times ORDER BY time NULLS LAST, name",
    )
    .fetch_all(pool)
    .await
    .map_err(AttendanceError::backend("fetch service times"))?;
    Ok(rows
        .iter()
        .map(|row| ServiceTime {
            id: row.get("id"),
            name: row.get("name"),
            time: row.get("time"),
        })
        .collect())
}

pub async fn list_lessons(pool: &PgPool) -> Result<Vec<Lesson>> {
    let rows = sqlx::query(
        r#"
        SELECT id, name, resource_url, curriculum_series, lesson_number
        FROM sunday_school.lessons
        ORDER BY curriculum_series NULLS LAST, lesson_number NULLS LAST, name
        "#,
    )
    .fetch_all(pool)
    .await
    .map_err(AttendanceError::backend("fetch lessons"))?;
    Ok(rows.iter().map(lesson_from_row).collect())
}

pub async fn get_lesson(pool: &PgPool, id: Uuid) -> Result<Lesson> {
    let row = sqlx::query(
        r#"
        SELECT id, name, resource_url, curriculum_series, lesson_number
        FROM sunday_school.lessons
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await
    .map_err(AttendanceError::backend("fetch lesson"))?
    .ok_or_else(|| AttendanceError::NotFound {
        entity: "lesson",
        key: id.to_string(),
    })?;
    Ok(lesson_from_row(&row))
}

/// Upserts by name and keeps an existing link when none is given.
pub async fn upsert_lesson(pool: &PgPool, name: &str, resource_url: Option<&str>) -> Result<Uuid> {
    let id = sqlx::query(
        r#"
        INSERT INTO sunday_school.lessons (id, name, resource_url)
        VALUES ($1, $2, $3)
        ON CONFLICT (name) DO UPDATE
        SET resource_url = COALESCE(EXCLUDED.resource_url, lessons.resource_url)
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(name.trim())
    .bind(resource_url)
    .fetch_one(pool)
    .await
    .map_err(AttendanceError::backend("save lesson"))?
    .get("id");
    Ok(id)
}

pub async fn list_schedules_for_date(pool: &PgPool, date: NaiveDate) -> Result<Vec<Schedule>> {
    let query = format!("{SCHEDULE_SELECT} WHERE s.date = $1 ORDER BY st.time NULLS LAST, st.name");
    let rows = sqlx::query(&query)
        .bind(date)
        .fetch_all(pool)
        .await
        .map_err(AttendanceError::backend("fetch schedules"))?;
    Ok(rows.iter().map(schedule_from_row).collect())
}

async fn list_all_schedules(pool: &PgPool) -> Result<Vec<Schedule>> {
    let query = format!("{SCHEDULE_SELECT} ORDER BY s.date, st.name");
    let rows = sqlx::query(&query)
        .fetch_all(pool)
        .await
        .map_err(AttendanceError::backend("fetch schedules"))?;
    Ok(rows.iter().map(schedule_from_row).collect())
}

pub async fn find_schedule(pool: &PgPool, date: NaiveDate, service_time: &str) -> Result<Schedule> {
    let query = format!("{SCHEDULE_SELECT} WHERE s.date = $1 AND st.name = $2");
    let row = sqlx::query(&query)
        .bind(date)
        .bind(service_time)
        .fetch_optional(pool)
        .await
        .map_err(AttendanceError::backend("fetch schedule"))?
        .ok_or_else(|| AttendanceError::NotFound {
            entity: "schedule",
            key: format!("{date} {service_time}"),
        })?;
    Ok(schedule_from_row(&row))
}

/// Dates offered on the date-selection screen, most recent first.
pub async fn list_schedule_dates(pool: &PgPool, limit: i64) -> Result<Vec<NaiveDate>> {
    let rows = sqlx::query(
        r#"
        SELECT DISTINCT date
        FROM sunday_school.schedules
        WHERE NOT is_cancelled
        ORDER BY date DESC
        LIMIT $1
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .map_err(AttendanceError::backend("fetch schedule dates"))?;
    Ok(rows.iter().map(|row| row.get("date")).collect())
}

pub async fn upsert_schedule(
    pool: &PgPool,
    date: NaiveDate,
    service_time_id: Uuid,
    lesson_id: Option<Uuid>,
) -> Result<Uuid> {
    let id = sqlx::query(
        r#"
        INSERT INTO sunday_school.schedules (id, date, service_time_id, lesson_id)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (date, service_time_id) DO UPDATE
        SET lesson_id = COALESCE(EXCLUDED.lesson_id, schedules.lesson_id)
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(date)
    .bind(service_time_id)
    .bind(lesson_id)
    .fetch_one(pool)
    .await
    .map_err(AttendanceError::backend("save schedule"))?
    .get("id");
    Ok(id)
}

pub async fn schedule_teachers(pool: &PgPool, schedule_id: Uuid) -> Result<Vec<Teacher>> {
    let rows = sqlx::query(
        r#"
        SELECT t.id, t.name, t.email, t.is_active
        FROM sunday_school.schedule_assignments sa
        JOIN sunday_school.teachers t ON t.id = sa.teacher_id
        WHERE sa.schedule_id = $1
        ORDER BY t.name
        "#,
    )
    .bind(schedule_id)
    .fetch_all(pool)
    .await
    .map_err(AttendanceError::backend("fetch schedule assignments"))?;
    Ok(rows.iter().map(teacher_from_row).collect())
}

/// Replaces the whole teacher set of a schedule. Delete and insert share one
/// transaction, so a failure leaves the previous assignments in place.
pub async fn replace_schedule_assignments(
    pool: &PgPool,
    schedule_id: Uuid,
    teacher_ids: &[Uuid],
) -> Result<()> {
    let mut tx: Transaction<'_, Postgres> = pool
        .begin()
        .await
        .map_err(AttendanceError::backend("start assignment update"))?;

    sqlx::query("DELETE FROM sunday_school.schedule_assignments WHERE schedule_id = $1")
        .bind(schedule_id)
        .execute(&mut *tx)
        .await
        .map_err(AttendanceError::backend("clear schedule assignments"))?;

    for teacher_id in teacher_ids {
        sqlx::query(
            r#"
            INSERT INTO sunday_school.schedule_assignments (schedule_id, teacher_id)
            VALUES ($1, $2)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(schedule_id)
        .bind(teacher_id)
        .execute(&mut *tx)
        .await
        .map_err(AttendanceError::backend("assign teachers"))?;
    }

    tx.commit()
        .await
        .map_err(AttendanceError::backend("commit assignment update"))?;
    info!(schedule = %schedule_id, teachers = teacher_ids.len(), "schedule assignments replaced");
    Ok(())
}

/// Bulk upsert keyed by (student, schedule). Re-marking overwrites.
pub async fn save_attendance(pool: &PgPool, marks: &[AttendanceMark]) -> Result<usize> {
    if marks.is_empty() {
        return Ok(0);
    }

    let mut tx = pool
        .begin()
        .await
        .map_err(AttendanceError::backend("start attendance save"))?;

    for mark in marks {
        sqlx::query(
            r#"
            INSERT INTO sunday_school.attendance_records
            (id, student_id, schedule_id, status, marked_at, notes)
            VALUES ($1, $2, $3, $4, NOW(), $5)
            ON CONFLICT (student_id, schedule_id) DO UPDATE
            SET status = EXCLUDED.status,
                marked_at = EXCLUDED.marked_at,
                notes = EXCLUDED.notes
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(mark.student_id)
        .bind(mark.schedule_id)
        .bind(mark.status.as_str())
        .bind(&mark.notes)
        .execute(&mut *tx)
        .await
        .map_err(AttendanceError::backend("save attendance"))?;
    }

    tx.commit()
        .await
        .map_err(AttendanceError::backend("commit attendance"))?;
    info!(records = marks.len(), "attendance saved");
    Ok(marks.len())
}

pub async fn attendance_for_schedule(pool: &PgPool, schedule_id: Uuid) -> Result<Vec<AttendanceRecord>> {
    let rows = sqlx::query(
        r#"
        SELECT id, student_id, schedule_id, status, marked_at, notes
        FROM sunday_school.attendance_records
        WHERE schedule_id = $1
        "#,
    )
    .bind(schedule_id)
    .fetch_all(pool)
    .await
    .map_err(AttendanceError::backend("fetch attendance records"))?;

    rows.iter()
        .map(|row| {
            Ok(AttendanceRecord {
                id: row.get("id"),
                student_id: row.get("student_id"),
                schedule_id: row.get("schedule_id"),
                status: attendance_status(row, "attendance record")?,
                marked_at: row.get("marked_at"),
                notes: row.get("notes"),
            })
        })
        .collect()
}

pub async fn attendance_history(pool: &PgPool, filter: &HistoryFilter) -> Result<Vec<HistoryEntry>> {
    debug!(?filter, "fetching attendance history");
    let rows = sqlx::query(
        r#"
        SELECT s.date, st.name AS service_time_name, l.name AS lesson_name,
               st.time AS service_time,
               ar.student_id, stu.name AS student_name, ar.status, ar.notes
        FROM sunday_school.attendance_records ar
        JOIN sunday_school.schedules s ON s.id = ar.schedule_id
        JOIN sunday_school.service_times st ON st.id = s.service_time_id
        JOIN sunday_school.students stu ON stu.id = ar.student_id
        LEFT JOIN sunday_school.lessons l ON l.id = s.lesson_id
        WHERE ($1::uuid IS NULL OR ar.student_id = $1)
          AND ($2::date IS NULL OR s.date >= $2)
          AND ($3::date IS NULL OR s.date <= $3)
        ORDER BY s.date DESC, service_time NULLS LAST, stu.name
        "#,
    )
    .bind(filter.student_id)
    .bind(filter.from)
    .bind(filter.to)
    .fetch_all(pool)
    .await
    .map_err(AttendanceError::backend("fetch attendance history"))?;

    rows.iter()
        .map(|row| {
            Ok(HistoryEntry {
                date: row.get("date"),
                service_time_name: row.get("service_time_name"),
                lesson_name: row.get("lesson_name"),
                student_id: row.get("student_id"),
                student_name: row.get("student_name"),
                status: attendance_status(row, "attendance history")?,
                notes: row.get("notes"),
            })
        })
        .collect()
}

pub async fn fetch_attendance_before(
    pool: &PgPool,
    student_ids: &[Uuid],
    cutoff: NaiveDate,
) -> Result<Vec<DatedAttendance>> {
    let rows = sqlx::query(
        r#"
        SELECT ar.student_id, s.date, ar.status
        FROM sunday_school.attendance_records ar
        JOIN sunday_school.schedules s ON s.id = ar.schedule_id
        WHERE ar.student_id = ANY($1) AND s.date < $2
        ORDER BY s.date DESC
        "#,
    )
    .bind(student_ids)
    .bind(cutoff)
    .fetch_all(pool)
    .await
    .map_err(AttendanceError::backend("fetch attendance records"))?;

    rows.iter()
        .map(|row| {
            Ok(DatedAttendance {
                student_id: row.get("student_id"),
                date: row.get("date"),
                status: attendance_status(row, "attendance record")?,
            })
        })
        .collect()
}

/// Postgres-backed store. Reads go through the retry policy; mutations are
/// issued once.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    retry: RetryPolicy,
}

impl PgStore {
    pub fn new(pool: PgPool, retry: RetryPolicy) -> Self {
        Self { pool, retry }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl AttendanceSource for PgStore {
    async fn fetch_attendance_before(
        &self,
        student_ids: &[Uuid],
        cutoff: NaiveDate,
    ) -> Result<Vec<DatedAttendance>> {
        let pool = &self.pool;
        with_retry(
            &self.retry,
            "fetch attendance records",
            AttendanceError::is_transient,
            move || fetch_attendance_before(pool, student_ids, cutoff),
        )
        .await
    }

    async fn active_regular_student_ids(&self) -> Result<Vec<Uuid>> {
        let pool = &self.pool;
        let students = with_retry(
            &self.retry,
            "fetch active students",
            AttendanceError::is_transient,
            move || list_active_regular_students(pool),
        )
        .await?;
        Ok(students.into_iter().map(|student| student.id).collect())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use sqlx::postgres::PgPoolOptions;

    /// Connects to a scratch database when one is configured; tests that
    /// need Postgres return early otherwise.
    pub(crate) async fn test_pool() -> Option<PgPool> {
        let url = ["ATTENDANCE_TEST_DATABASE_URL", "ATTENDANCE_DATABASE_URL", "DATABASE_URL"]
            .into_iter()
            .find_map(|key| std::env::var(key).ok())?;
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(&url)
            .await
            .ok()?;
        init_db(&pool).await.ok()?;
        Some(pool)
    }

    pub(crate) fn unique_name(prefix: &str) -> String {
        format!("{prefix} {}", Uuid::new_v4())
    }

    fn regular(name: &str) -> NewStudent {
        NewStudent {
            name: name.to_string(),
            ..NewStudent::default()
        }
    }

    #[test]
    fn blank_names_are_rejected_before_any_query() {
        assert!(matches!(required_name("   "), Err(AttendanceError::Validation(_))));
        assert_eq!(required_name("  Ana Lima ").unwrap(), "Ana Lima");
    }

    #[tokio::test]
    async fn visitor_with_a_regulars_name_keeps_the_regular() {
        let Some(pool) = test_pool().await else { return };
        let name = unique_name("Davi Rocha");
        let student = create_student(&pool, &regular(&name)).await.unwrap();

        let visitor = add_visitor(&pool, &name).await.unwrap();

        assert_eq!(visitor.id, student.id);
        assert!(!visitor.is_visitor);
        let roster = list_active_regular_students(&pool).await.unwrap();
        assert!(roster.iter().any(|s| s.id == student.id));
    }

    #[tokio::test]
    async fn new_visitor_is_created_active_and_off_the_regular_roster() {
        let Some(pool) = test_pool().await else { return };
        let name = unique_name("Lia Prado");

        let visitor = add_visitor(&pool, &name).await.unwrap();

        assert!(visitor.is_visitor);
        assert_eq!(visitor.status, StudentStatus::Active);
        let roster = list_active_regular_students(&pool).await.unwrap();
        assert!(roster.iter().all(|s| s.id != visitor.id));
    }

    #[tokio::test]
    async fn re_adding_a_visitor_as_regular_promotes_but_never_demotes() {
        let Some(pool) = test_pool().await else { return };
        let name = unique_name("Caio Nunes");
        add_visitor(&pool, &name).await.unwrap();

        let promoted = create_student(&pool, &regular(&name)).await.unwrap();
        assert!(!promoted.is_visitor);

        let again = create_student(
            &pool,
            &NewStudent {
                name: name.clone(),
                is_visitor: true,
                ..NewStudent::default()
            },
        )
        .await
        .unwrap();
        assert!(!again.is_visitor);
    }

    #[tokio::test]
    async fn ensure_student_leaves_a_moved_student_alone() {
        let Some(pool) = test_pool().await else { return };
        let name = unique_name("Rita Faria");
        let student = create_student(&pool, &regular(&name)).await.unwrap();
        deactivate_student(&pool, student.id, StudentStatus::Moved)
            .await
            .unwrap();

        let existing = ensure_student(&pool, &name, false).await.unwrap();

        assert_eq!(existing.id, student.id);
        assert_eq!(existing.status, StudentStatus::Moved);
    }
}
