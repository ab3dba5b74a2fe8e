use anyhow::Context;
use chrono::NaiveDate;
use sqlx::postgres::PgRow;
use sqlx::{Executor, PgPool, Postgres, Row};
use tracing::info;
use uuid::Uuid;

use crate::models::{
    LessonDetailRecord, LessonStatus, StudentProgressRecord, TeacherCompletionRecord,
    AT_RISK_THRESHOLD,
};
use crate::store::{self, RecordStore};

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Inserts every record of `store`; rows whose id already exists are kept.
pub async fn seed(pool: &PgPool, store: &RecordStore) -> anyhow::Result<u64> {
    let mut inserted = 0u64;

    for record in store.teachers() {
        inserted += insert_teacher(pool, record, None, false).await?;
    }

    for record in store.students() {
        let result = sqlx::query(
            r#"
            INSERT INTO completion_insights.student_progress
            (id, student_id, student_name, campus, grade_program, class_section,
             course_code, course_name, completion_percentage, last_activity_date, average_score)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(record.id)
        .bind(&record.student_id)
        .bind(&record.student_name)
        .bind(&record.campus)
        .bind(&record.grade_program)
        .bind(&record.class_section)
        .bind(&record.course_code)
        .bind(&record.course_name)
        .bind(record.completion_percentage)
        .bind(record.last_activity_date)
        .bind(record.average_score)
        .execute(pool)
        .await?;
        inserted += result.rows_affected();
    }

    for lesson in store.lessons() {
        let result = sqlx::query(
            r#"
            INSERT INTO completion_insights.lesson_details
            (id, teacher_completion_id, lesson_number, lesson_title, planned_date,
             completed_date, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(lesson.id)
        .bind(lesson.teacher_completion_id)
        .bind(lesson.lesson_number)
        .bind(&lesson.lesson_title)
        .bind(lesson.planned_date)
        .bind(lesson.completed_date)
        .bind(lesson.status.as_str())
        .execute(pool)
        .await?;
        inserted += result.rows_affected();
    }

    info!(inserted, "seeded records");
    Ok(inserted)
}

async fn insert_teacher<'c, E>(
    executor: E,
    record: &TeacherCompletionRecord,
    batch: Option<Uuid>,
    overwrite: bool,
) -> anyhow::Result<u64>
where
    E: Executor<'c, Database = Postgres>,
{
    let conflict = if overwrite {
        r#"ON CONFLICT (id) DO UPDATE SET
            campus = EXCLUDED.campus,
            grade_program = EXCLUDED.grade_program,
            class_section = EXCLUDED.class_section,
            teacher_name = EXCLUDED.teacher_name,
            course_code = EXCLUDED.course_code,
            course_name = EXCLUDED.course_name,
            total_lessons_planned = EXCLUDED.total_lessons_planned,
            on_time_lessons = EXCLUDED.on_time_lessons,
            delayed_lessons = EXCLUDED.delayed_lessons,
            import_batch = EXCLUDED.import_batch"#
    } else {
        "ON CONFLICT (id) DO NOTHING"
    };
    let query = format!(
        r#"
        INSERT INTO completion_insights.teacher_completions
        (id, campus, grade_program, class_section, teacher_name, course_code, course_name,
         total_lessons_planned, on_time_lessons, delayed_lessons, import_batch)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        {conflict}
        "#
    );

    let result = sqlx::query(&query)
        .bind(record.id)
        .bind(&record.campus)
        .bind(&record.grade_program)
        .bind(&record.class_section)
        .bind(&record.teacher_name)
        .bind(&record.course_code)
        .bind(&record.course_name)
        .bind(record.total_lessons_planned)
        .bind(record.on_time_lessons)
        .bind(record.delayed_lessons)
        .bind(batch)
        .execute(executor)
        .await?;
    Ok(result.rows_affected())
}

const LESSON_COLUMNS: &str = "id, teacher_completion_id, lesson_number, lesson_title, \
     planned_date, completed_date, status FROM completion_insights.lesson_details";

fn lesson_from_row(row: &PgRow) -> anyhow::Result<LessonDetailRecord> {
    let id: i64 = row.get("id");
    let status: String = row.get("status");
    Ok(LessonDetailRecord {
        id,
        teacher_completion_id: row.get("teacher_completion_id"),
        lesson_number: row.get("lesson_number"),
        lesson_title: row.get("lesson_title"),
        planned_date: row.get("planned_date"),
        completed_date: row.get("completed_date"),
        status: LessonStatus::parse_token(&status)
            .with_context(|| format!("lesson {id} has unknown status {status:?}"))?,
    })
}

/// Loads all three tables, in id order, into a validated store.
pub async fn fetch_store(pool: &PgPool) -> anyhow::Result<RecordStore> {
    let rows = sqlx::query(
        "SELECT id, campus, grade_program, class_section, teacher_name, course_code, \
         course_name, total_lessons_planned, on_time_lessons, delayed_lessons \
         FROM completion_insights.teacher_completions ORDER BY id",
    )
    .fetch_all(pool)
    .await?;

    let mut teachers = Vec::with_capacity(rows.len());
    for row in rows {
        let record = TeacherCompletionRecord {
            id: row.get("id"),
            campus: row.get("campus"),
            grade_program: row.get("grade_program"),
            class_section: row.get("class_section"),
            teacher_name: row.get("teacher_name"),
            course_code: row.get("course_code"),
            course_name: row.get("course_name"),
            total_lessons_planned: 0,
            lessons_completed: 0,
            completion_percentage: 0,
            on_time_lessons: 0,
            delayed_lessons: 0,
            behind_schedule_flag: false,
        };
        teachers.push(record.with_lessons(
            row.get("total_lessons_planned"),
            row.get("on_time_lessons"),
            row.get("delayed_lessons"),
        ));
    }

    let rows = sqlx::query(
        "SELECT id, student_id, student_name, campus, grade_program, class_section, \
         course_code, course_name, completion_percentage, last_activity_date, average_score \
         FROM completion_insights.student_progress ORDER BY id",
    )
    .fetch_all(pool)
    .await?;

    let mut students = Vec::with_capacity(rows.len());
    for row in rows {
        let completion_percentage: i32 = row.get("completion_percentage");
        students.push(StudentProgressRecord {
            id: row.get("id"),
            student_id: row.get("student_id"),
            student_name: row.get("student_name"),
            campus: row.get("campus"),
            grade_program: row.get("grade_program"),
            class_section: row.get("class_section"),
            course_code: row.get("course_code"),
            course_name: row.get("course_name"),
            completion_percentage,
            last_activity_date: row.get::<NaiveDate, _>("last_activity_date"),
            average_score: row.get("average_score"),
            at_risk_flag: completion_percentage < AT_RISK_THRESHOLD,
        });
    }

    let rows = sqlx::query(&format!("SELECT {LESSON_COLUMNS} ORDER BY id"))
        .fetch_all(pool)
        .await?;

    let lessons = rows
        .iter()
        .map(lesson_from_row)
        .collect::<anyhow::Result<Vec<_>>>()?;

    let store = RecordStore::new(teachers, students, lessons)
        .context("database rows violate record invariants")?;
    Ok(store)
}

/// Upserts teacher completion rows from a CSV export and records the batch.
///
/// Runs in one transaction. A row whose counts disagree with the lessons
/// already stored under its id rejects the whole import.
pub async fn import_teacher_csv(
    pool: &PgPool,
    csv_path: &std::path::Path,
) -> anyhow::Result<usize> {
    let rows: Vec<TeacherCompletionRecord> = store::read_csv(csv_path)?
        .with_context(|| format!("{} does not exist", csv_path.display()))?;
    let batch = Uuid::new_v4();
    let mut imported = 0usize;
    let mut tx = pool.begin().await?;

    for row in &rows {
        row.validate()?;
        let stored = sqlx::query(&format!(
            "SELECT {LESSON_COLUMNS} WHERE teacher_completion_id = $1 ORDER BY lesson_number"
        ))
        .bind(row.id)
        .fetch_all(&mut *tx)
        .await?
        .iter()
        .map(lesson_from_row)
        .collect::<anyhow::Result<Vec<_>>>()?;
        store::check_against_lessons(row, &stored).with_context(|| {
            format!(
                "row {} of {} disagrees with its stored lessons",
                row.id,
                csv_path.display()
            )
        })?;

        if insert_teacher(&mut *tx, row, Some(batch), true).await? > 0 {
            imported += 1;
        }
    }

    sqlx::query(
        r#"
        INSERT INTO completion_insights.import_batches (id, source_path, row_count)
        VALUES ($1, $2, $3)
        "#,
    )
    .bind(batch)
    .bind(csv_path.display().to_string())
    .bind(imported as i32)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    info!(%batch, imported, path = %csv_path.display(), "imported teacher completion csv");
    Ok(imported)
}
