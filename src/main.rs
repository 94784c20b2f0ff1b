use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Context;
use chrono::{NaiveDate, Utc};
use clap::{ArgGroup, Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use sunday_school_attendance::auth::AppContext;
use sunday_school_attendance::config::Config;
use sunday_school_attendance::db::{self, PgStore};
use sunday_school_attendance::marking::{self, MarkingSession, NavigationDecision, NavigationGuard};
use sunday_school_attendance::models::{
    AttendanceStatus, HistoryFilter, NewStudent, StudentStatus, StudentUpdate,
};
use sunday_school_attendance::{alerts, report, sheet};

#[derive(Parser)]
#[command(name = "sunday-school-attendance")]
#[command(about = "Sunday school attendance tracker", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Email of the signed-in teacher, as confirmed by the identity provider
    #[arg(long = "as", global = true, env = "ATTENDANCE_TEACHER_EMAIL")]
    teacher_email: Option<String>,

    /// Sign in as the first active teacher (debug builds with ATTENDANCE_DEV_BYPASS only)
    #[arg(long, global = true)]
    dev_bypass: bool,

    /// Verbose logging
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load realistic seed data
    Seed,
    /// Import students, lessons and schedules from the spreadsheet endpoint
    MigrateSheet {
        #[arg(long)]
        url: Option<String>,
    },
    /// List dates that have services
    Dates {
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },
    /// Show the services scheduled on a date
    Schedules {
        #[arg(long, value_parser = iso_date)]
        date: NaiveDate,
    },
    /// List lessons
    Lessons,
    /// Show one lesson
    Lesson { id: Uuid },
    /// Manage the student roster
    Students {
        #[command(subcommand)]
        command: StudentCommands,
    },
    /// Mark attendance for one service
    #[command(group(
        ArgGroup::new("marks")
            .args(["csv", "present", "absent", "visitor"])
            .multiple(true)
            .required(true)
    ))]
    Mark {
        #[arg(long, value_parser = iso_date)]
        date: NaiveDate,
        #[arg(long)]
        service: String,
        /// CSV with student,status,note columns
        #[arg(long)]
        csv: Option<PathBuf>,
        #[arg(long, value_delimiter = ',')]
        present: Vec<String>,
        #[arg(long, value_delimiter = ',')]
        absent: Vec<String>,
        /// Visitors to add to the roster and mark present
        #[arg(long, value_delimiter = ',')]
        visitor: Vec<String>,
        /// Build the session without saving it
        #[arg(long)]
        dry_run: bool,
    },
    /// Replace the teachers assigned to a service
    Assign {
        #[arg(long, value_parser = iso_date)]
        date: NaiveDate,
        #[arg(long)]
        service: String,
        /// Teacher emails; an empty list clears the assignment
        #[arg(long, value_delimiter = ',')]
        teacher: Vec<String>,
    },
    /// Show attendance history
    History {
        #[arg(long)]
        student: Option<Uuid>,
        #[arg(long, value_parser = iso_date)]
        from: Option<NaiveDate>,
        #[arg(long, value_parser = iso_date)]
        to: Option<NaiveDate>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// List students with consecutive absences before a date
    Alerts {
        #[arg(long, value_parser = iso_date)]
        date: Option<NaiveDate>,
        #[arg(long, default_value_t = alerts::DEFAULT_ABSENCE_THRESHOLD)]
        threshold: usize,
        /// Restrict to these students instead of every active regular
        #[arg(long, value_delimiter = ',')]
        student: Vec<Uuid>,
    },
    /// Generate a markdown report for a date
    Report {
        #[arg(long, value_parser = iso_date)]
        date: NaiveDate,
        #[arg(long, default_value_t = alerts::DEFAULT_ABSENCE_THRESHOLD)]
        threshold: usize,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
}

#[derive(Subcommand)]
enum StudentCommands {
    /// List students
    List {
        /// Include inactive, aged-out and moved students
        #[arg(long)]
        all: bool,
    },
    /// Add a student to the roster
    Add {
        name: String,
        #[arg(long)]
        visitor: bool,
        #[arg(long)]
        notes: Option<String>,
        #[arg(long, value_parser = iso_date)]
        birth: Option<NaiveDate>,
    },
    /// Edit a student
    Update {
        id: Uuid,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        visitor: Option<bool>,
        #[arg(long)]
        status: Option<StudentStatus>,
        #[arg(long)]
        notes: Option<String>,
        #[arg(long, value_parser = iso_date)]
        birth: Option<NaiveDate>,
    },
    /// Take a student off the active roster
    Deactivate {
        id: Uuid,
        #[arg(long, default_value = "inactive")]
        status: StudentStatus,
    },
}

fn iso_date(value: &str) -> Result<NaiveDate, String> {
    alerts::parse_cutoff(value).map_err(|err| err.to_string())
}

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn connect(url: &str, max_connections: u32) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await
        .context("failed to connect to Postgres")
}

async fn sign_in(ctx: &mut AppContext, email: Option<&str>, dev_bypass: bool) -> anyhow::Result<()> {
    let teacher = if dev_bypass {
        ctx.dev_bypass_sign_in().await?
    } else {
        let email = email.context("sign in with --as <email> or ATTENDANCE_TEACHER_EMAIL")?;
        ctx.sign_in(email).await?
    };
    info!(teacher = %teacher.name, "session started");
    Ok(())
}

async fn student_names(pool: &PgPool) -> anyhow::Result<HashMap<Uuid, String>> {
    Ok(db::list_students(pool, true)
        .await?
        .into_iter()
        .map(|student| (student.id, student.name))
        .collect())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);
    let config = Config::from_env()?;

    match &cli.command {
        Commands::InitDb => {
            let pool = connect(&config.database_url, config.max_connections).await?;
            db::init_db(&pool).await?;
            println!("Schema ready.");
            return Ok(());
        }
        Commands::Seed => {
            let pool = connect(&config.database_url, config.max_connections).await?;
            db::seed(&pool).await?;
            println!("Seed data inserted.");
            return Ok(());
        }
        Commands::MigrateSheet { url } => {
            let url = url
                .clone()
                .or_else(|| config.sheet_url.clone())
                .context("pass --url or set ATTENDANCE_SHEET_URL")?;
            let pool = connect(config.service_database_url()?, config.max_connections).await?;
            let summary = sheet::migrate(&pool, &url, &config.retry).await?;
            println!(
                "Migrated {} students, {} lessons and {} schedules. Attendance history was not migrated.",
                summary.students, summary.lessons, summary.schedules
            );
            return Ok(());
        }
        _ => {}
    }

    let pool = connect(&config.database_url, config.max_connections).await?;
    let store = PgStore::new(pool.clone(), config.retry.clone());
    let mut ctx = AppContext::new(config, store);
    sign_in(&mut ctx, cli.teacher_email.as_deref(), cli.dev_bypass).await?;

    let result = run(&ctx, &pool, cli.command).await;
    ctx.sign_out()?;
    debug!(state = ?ctx.auth(), "session closed");
    result
}

async fn run(ctx: &AppContext, pool: &PgPool, command: Commands) -> anyhow::Result<()> {
    let teacher = ctx.require_teacher()?;
    debug!(teacher = %teacher.email, "running command");

    match command {
        Commands::InitDb | Commands::Seed | Commands::MigrateSheet { .. } => {}
        Commands::Dates { limit } => {
            let dates = db::list_schedule_dates(pool, limit).await?;
            if dates.is_empty() {
                println!("No services scheduled.");
            }
            for date in dates {
                println!("{date}");
            }
        }
        Commands::Schedules { date } => {
            let schedules = db::list_schedules_for_date(pool, date).await?;
            if schedules.is_empty() {
                println!("No services on {date}.");
            }
            for schedule in schedules {
                let teachers = db::schedule_teachers(pool, schedule.id).await?;
                let names: Vec<&str> = teachers.iter().map(|t| t.name.as_str()).collect();
                println!(
                    "- {} {}{} [{}]",
                    schedule.service_time_name,
                    schedule.lesson_name.as_deref().unwrap_or("no lesson"),
                    if schedule.is_cancelled { " (cancelled)" } else { "" },
                    names.join(", ")
                );
            }
        }
        Commands::Lessons => {
            for lesson in db::list_lessons(pool).await? {
                let series = match (&lesson.curriculum_series, lesson.lesson_number) {
                    (Some(series), Some(number)) => format!(" [{series} #{number}]"),
                    (Some(series), None) => format!(" [{series}]"),
                    _ => String::new(),
                };
                println!("- {} {}{}", lesson.id, lesson.name, series);
            }
        }
        Commands::Lesson { id } => {
            let lesson = db::get_lesson(pool, id).await?;
            println!("{}", lesson.name);
            if let Some(series) = &lesson.curriculum_series {
                println!("Series: {series}");
            }
            if let Some(number) = lesson.lesson_number {
                println!("Lesson number: {number}");
            }
            if let Some(url) = &lesson.resource_url {
                println!("Material: {url}");
            }
        }
        Commands::Students { command } => run_students(pool, command).await?,
        Commands::Mark {
            date,
            service,
            csv,
            present,
            absent,
            visitor,
            dry_run,
        } => {
            let schedule = db::find_schedule(pool, date, &service).await?;
            let roster = db::list_active_regular_students(pool).await?;
            let mut session = MarkingSession::start(schedule, roster)?;
            let existing = db::attendance_for_schedule(pool, session.schedule().id).await?;
            session.load_existing(&existing);

            for name in &visitor {
                session.queue_visitor(name)?;
            }
            for (names, status) in [(&present, AttendanceStatus::Present), (&absent, AttendanceStatus::Absent)] {
                for name in names {
                    let id = session
                        .find_by_name(name)
                        .map(|student| student.id)
                        .with_context(|| format!("{name} is not on the roster"))?;
                    session.mark(id, status, None)?;
                }
            }
            if let Some(path) = &csv {
                let file = std::fs::File::open(path)
                    .with_context(|| format!("failed to open {}", path.display()))?;
                marking::apply_csv(&mut session, file)?;
            }

            println!("Marked {} of {} students.", session.completed(), session.total());
            if session.is_complete() {
                println!("Everyone on the roster is marked.");
            } else if let Some(next) = session.next_unmarked() {
                println!("Still unmarked, starting with {}.", next.name);
            }
            if !session.pending_visitors().is_empty() {
                println!("Visitors to add: {}.", session.pending_visitors().join(", "));
            }

            let mut guard = NavigationGuard::default();
            if dry_run {
                if let NavigationDecision::Blocked { unsaved_marks } = guard.check(&session) {
                    guard.confirm_discard(&mut session);
                    println!("Dry run: discarded {unsaved_marks} unsaved marks.");
                }
                return Ok(());
            }

            if session.has_unsaved_changes() {
                for name in session.pending_visitors().to_vec() {
                    let student = db::add_visitor(pool, &name).await?;
                    session.admit_visitor(student)?;
                }
                let saved = session
                    .submit(|marks| async move { db::save_attendance(pool, &marks).await })
                    .await?;
                println!("Saved {saved} attendance records.");
            } else {
                println!("Nothing changed.");
            }

            let regulars: Vec<Uuid> = session
                .roster()
                .iter()
                .filter(|student| !student.is_visitor)
                .map(|student| student.id)
                .collect();
            let found = alerts::check_consecutive_absences(
                &ctx.store,
                &regulars,
                alerts::DEFAULT_ABSENCE_THRESHOLD,
                date,
            )
            .await?;
            let names = student_names(pool).await?;
            for alert in &found {
                let name = names.get(&alert.student_id).map(String::as_str).unwrap_or("Unknown student");
                println!("Alert: {}", report::describe_alert(alert, name));
            }
        }
        Commands::Assign {
            date,
            service,
            teacher,
        } => {
            let schedule = db::find_schedule(pool, date, &service).await?;
            let teachers = db::list_teachers(pool).await?;
            let mut teacher_ids = Vec::with_capacity(teacher.len());
            for email in &teacher {
                let found = teachers
                    .iter()
                    .find(|t| t.is_active && t.email.eq_ignore_ascii_case(email.trim()))
                    .with_context(|| format!("no active teacher with email {email}"))?;
                teacher_ids.push(found.id);
            }
            db::replace_schedule_assignments(pool, schedule.id, &teacher_ids).await?;
            println!(
                "{} teachers assigned to {} {}.",
                teacher_ids.len(),
                schedule.date,
                schedule.service_time_name
            );
        }
        Commands::History {
            student,
            from,
            to,
            limit,
        } => {
            let filter = HistoryFilter {
                student_id: student,
                from,
                to,
            };
            let entries = db::attendance_history(pool, &filter).await?;
            if entries.is_empty() {
                println!("No attendance recorded for this filter.");
            }
            for entry in entries.iter().take(limit) {
                println!(
                    "{} {} {}: {}{}",
                    entry.date,
                    entry.service_time_name,
                    entry.student_name,
                    entry.status,
                    entry
                        .notes
                        .as_deref()
                        .map(|note| format!(" ({note})"))
                        .unwrap_or_default()
                );
            }
        }
        Commands::Alerts {
            date,
            threshold,
            student,
        } => {
            let cutoff = date.unwrap_or_else(|| Utc::now().date_naive());
            let found = if student.is_empty() {
                alerts::check_all_active_students(&ctx.store, threshold, cutoff).await?
            } else {
                alerts::check_consecutive_absences(&ctx.store, &student, threshold, cutoff).await?
            };

            if found.is_empty() {
                println!("No students with {threshold} or more consecutive absences before {cutoff}.");
                return Ok(());
            }

            let names = student_names(pool).await?;
            for alert in &found {
                let name = names.get(&alert.student_id).map(String::as_str).unwrap_or("Unknown student");
                println!("- {}", report::describe_alert(alert, name));
            }
        }
        Commands::Report {
            date,
            threshold,
            out,
        } => {
            let roster = db::list_active_regular_students(pool).await?;
            let mut sessions = Vec::new();
            for schedule in db::list_schedules_for_date(pool, date).await? {
                let records = db::attendance_for_schedule(pool, schedule.id).await?;
                let summary = report::build_session_summary(&schedule, &roster, &records);
                sessions.push((schedule, summary));
            }
            let found = alerts::check_all_active_students(&ctx.store, threshold, date).await?;
            let history = db::attendance_history(
                pool,
                &HistoryFilter {
                    to: Some(date),
                    ..HistoryFilter::default()
                },
            )
            .await?;
            let names = student_names(pool).await?;
            let document = report::build_report(date, &sessions, &found, &names, &history);
            std::fs::write(&out, document)
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}

async fn run_students(pool: &PgPool, command: StudentCommands) -> anyhow::Result<()> {
    match command {
        StudentCommands::List { all } => {
            for student in db::list_students(pool, all).await? {
                println!(
                    "- {} {}{}{}",
                    student.id,
                    student.name,
                    if student.is_visitor { " (visitor)" } else { "" },
                    if student.status == StudentStatus::Active {
                        String::new()
                    } else {
                        format!(" [{}]", student.status)
                    }
                );
            }
        }
        StudentCommands::Add {
            name,
            visitor,
            notes,
            birth,
        } => {
            let student = db::create_student(
                pool,
                &NewStudent {
                    name,
                    is_visitor: visitor,
                    notes,
                    date_of_birth: birth,
                },
            )
            .await?;
            println!("Saved {} ({}).", student.name, student.id);
        }
        StudentCommands::Update {
            id,
            name,
            visitor,
            status,
            notes,
            birth,
        } => {
            let student = db::update_student(
                pool,
                id,
                &StudentUpdate {
                    name,
                    is_visitor: visitor,
                    status,
                    notes,
                    date_of_birth: birth,
                },
            )
            .await?;
            println!("Updated {}.", student.name);
        }
        StudentCommands::Deactivate { id, status } => {
            let student = db::deactivate_student(pool, id, status).await?;
            println!("{} is now {}.", student.name, student.status);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_accepts_visitors_alone() {
        let cli = Cli::try_parse_from([
            "attendance", "mark", "--date", "2024-03-03", "--service", "Manhã", "--visitor", "Lia",
        ])
        .expect("visitor-only mark should parse");
        match cli.command {
            Commands::Mark { visitor, .. } => assert_eq!(visitor, vec!["Lia".to_string()]),
            _ => panic!("expected the mark command"),
        }
    }

    #[test]
    fn mark_without_any_marks_is_rejected() {
        let result = Cli::try_parse_from([
            "attendance", "mark", "--date", "2024-03-03", "--service", "Manhã",
        ]);
        assert!(result.is_err());
    }
}
