//! One-off import of the roster and lesson calendar from the spreadsheet
//! endpoint. Historical attendance stays in the sheet.

use std::collections::BTreeSet;

use chrono::NaiveDate;
use serde::Deserialize;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::db;
use crate::error::{AttendanceError, Result};
use crate::retry::{with_retry, RetryPolicy};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetPayload {
    pub dates: Vec<String>,
    #[serde(default)]
    pub lesson_names: Vec<Option<String>>,
    #[serde(default)]
    pub lesson_links: Vec<Option<String>>,
    #[serde(default)]
    pub students: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedLesson {
    pub date: NaiveDate,
    pub name: Option<String>,
    pub link: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MigrationPlan {
    pub lessons: Vec<PlannedLesson>,
    pub students: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MigrationSummary {
    pub students: usize,
    pub lessons: usize,
    pub schedules: usize,
}

pub async fn fetch_sheet(
    client: &reqwest::Client,
    url: &str,
    retry: &RetryPolicy,
) -> Result<SheetPayload> {
    let fetch = move || async move {
        let payload = client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json::<SheetPayload>()
            .await?;
        Ok::<_, AttendanceError>(payload)
    };
    with_retry(retry, "fetch spreadsheet", AttendanceError::is_transient, fetch).await
}

pub fn parse_sheet_date(value: &str) -> Result<NaiveDate> {
    let trimmed = value.trim();
    let day_part = trimmed.split('T').next().unwrap_or(trimmed);
    NaiveDate::parse_from_str(day_part, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(day_part, "%d/%m/%Y"))
        .map_err(|_| AttendanceError::Sheet(format!("unrecognised date '{value}'")))
}

fn non_blank(value: Option<&Option<String>>) -> Option<String> {
    value
        .and_then(|v| v.as_deref())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Validates the payload. Lesson names and links are positional with dates;
/// student names are trimmed and deduplicated.
pub fn plan(payload: &SheetPayload) -> Result<MigrationPlan> {
    if payload.lesson_names.len() > payload.dates.len() {
        return Err(AttendanceError::Sheet(format!(
            "{} lesson names for {} dates",
            payload.lesson_names.len(),
            payload.dates.len()
        )));
    }

    let mut lessons = Vec::with_capacity(payload.dates.len());
    for (index, raw) in payload.dates.iter().enumerate() {
        lessons.push(PlannedLesson {
            date: parse_sheet_date(raw)?,
            name: non_blank(payload.lesson_names.get(index)),
            link: non_blank(payload.lesson_links.get(index)),
        });
    }

    let mut seen = BTreeSet::new();
    let students = payload
        .students
        .iter()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty() && seen.insert(name.to_lowercase()))
        .collect();

    Ok(MigrationPlan { lessons, students })
}

/// Inserts missing students, upserts lessons by name, and a schedule for every
/// (date, service time) pair. Students already on file keep their status and
/// visitor flag, so re-running never revives a student who left.
pub async fn apply(pool: &PgPool, plan: &MigrationPlan) -> Result<MigrationSummary> {
    let service_times = db::list_service_times(pool).await?;
    if service_times.is_empty() && !plan.lessons.is_empty() {
        return Err(AttendanceError::Sheet(
            "no service times configured; run seed or add them first".to_string(),
        ));
    }

    let mut summary = MigrationSummary::default();

    for name in &plan.students {
        db::ensure_student(pool, name, false).await?;
        summary.students += 1;
    }

    for lesson in &plan.lessons {
        let lesson_id = match &lesson.name {
            Some(name) => {
                summary.lessons += 1;
                Some(db::upsert_lesson(pool, name, lesson.link.as_deref()).await?)
            }
            None => {
                warn!(date = %lesson.date, "no lesson name for date");
                None
            }
        };
        for service in &service_times {
            db::upsert_schedule(pool, lesson.date, service.id, lesson_id).await?;
            summary.schedules += 1;
        }
    }

    info!(
        students = summary.students,
        lessons = summary.lessons,
        schedules = summary.schedules,
        "spreadsheet migration applied"
    );
    Ok(summary)
}

pub async fn migrate(pool: &PgPool, url: &str, retry: &RetryPolicy) -> Result<MigrationSummary> {
    let client = reqwest::Client::new();
    let payload = fetch_sheet(&client, url, retry).await?;
    let plan = plan(&payload)?;
    apply(pool, &plan).await
}
