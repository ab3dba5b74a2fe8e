use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::Path;

use anyhow::Context;
use chrono::{Duration, NaiveDate};
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::{Rng, SeedableRng};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::RecordError;
use crate::models::{
    LessonDetailRecord, LessonStatus, StudentProgressRecord, TeacherCompletionRecord,
    AT_RISK_THRESHOLD,
};

pub const TEACHER_COMPLETION_CSV: &str = "teacher_completion.csv";
pub const STUDENT_PROGRESS_CSV: &str = "student_progress.csv";
pub const LESSON_DETAILS_CSV: &str = "lesson_details.csv";

/// A lesson joined with the teacher-course pairing it belongs to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LessonRow<'a> {
    pub lesson: &'a LessonDetailRecord,
    pub parent: &'a TeacherCompletionRecord,
}

/// Validated, read-only record collections for one session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordStore {
    teachers: Vec<TeacherCompletionRecord>,
    students: Vec<StudentProgressRecord>,
    lessons: Vec<LessonDetailRecord>,
    teacher_index: HashMap<i64, usize>,
}

impl RecordStore {
    pub fn new(
        teachers: Vec<TeacherCompletionRecord>,
        students: Vec<StudentProgressRecord>,
        lessons: Vec<LessonDetailRecord>,
    ) -> Result<Self, RecordError> {
        let mut teacher_index = HashMap::with_capacity(teachers.len());
        for (position, record) in teachers.iter().enumerate() {
            record.validate()?;
            if teacher_index.insert(record.id, position).is_some() {
                return Err(RecordError::DuplicateId {
                    kind: "teacher completion",
                    id: record.id,
                });
            }
        }

        let mut student_ids = HashSet::with_capacity(students.len());
        for record in &students {
            record.validate()?;
            if !student_ids.insert(record.id) {
                return Err(RecordError::DuplicateId {
                    kind: "student progress",
                    id: record.id,
                });
            }
        }

        let mut lesson_ids = HashSet::with_capacity(lessons.len());
        let mut groups: HashMap<i64, Vec<&LessonDetailRecord>> = HashMap::new();
        for lesson in &lessons {
            lesson.validate()?;
            if !lesson_ids.insert(lesson.id) {
                return Err(RecordError::DuplicateId {
                    kind: "lesson",
                    id: lesson.id,
                });
            }
            if !teacher_index.contains_key(&lesson.teacher_completion_id) {
                return Err(RecordError::Lesson {
                    id: lesson.id,
                    reason: format!(
                        "unknown teacherCompletionId {}",
                        lesson.teacher_completion_id
                    ),
                });
            }
            groups
                .entry(lesson.teacher_completion_id)
                .or_default()
                .push(lesson);
        }

        for (parent_id, group) in &groups {
            let parent = &teachers[teacher_index[parent_id]];
            check_lesson_group(parent, group)?;
        }

        debug!(
            teachers = teachers.len(),
            students = students.len(),
            lessons = lessons.len(),
            "record store validated"
        );

        Ok(Self {
            teachers,
            students,
            lessons,
            teacher_index,
        })
    }

    pub fn teachers(&self) -> &[TeacherCompletionRecord] {
        &self.teachers
    }

    pub fn students(&self) -> &[StudentProgressRecord] {
        &self.students
    }

    pub fn lessons(&self) -> &[LessonDetailRecord] {
        &self.lessons
    }

    pub fn teacher(&self, id: i64) -> Option<&TeacherCompletionRecord> {
        self.teacher_index.get(&id).map(|&i| &self.teachers[i])
    }

    /// Every lesson with its parent row, in lesson insertion order.
    pub fn lesson_rows(&self) -> Vec<LessonRow<'_>> {
        self.lessons
            .iter()
            .filter_map(|lesson| {
                self.teacher(lesson.teacher_completion_id)
                    .map(|parent| LessonRow { lesson, parent })
            })
            .collect()
    }

    /// Lessons of one teacher-course pairing, by lesson number.
    pub fn lessons_for(&self, teacher_completion_id: i64) -> Vec<&LessonDetailRecord> {
        let mut lessons: Vec<&LessonDetailRecord> = self
            .lessons
            .iter()
            .filter(|l| l.teacher_completion_id == teacher_completion_id)
            .collect();
        lessons.sort_by_key(|l| l.lesson_number);
        lessons
    }
}

/// Groups without any lesson rows are not checked: a teacher-only import is
/// valid on its own.
fn check_lesson_group(
    parent: &TeacherCompletionRecord,
    group: &[&LessonDetailRecord],
) -> Result<(), RecordError> {
    let fail = |id: i64, reason: String| RecordError::Lesson { id, reason };
    let first = group[0].id;

    let mut numbers = HashSet::new();
    for lesson in group {
        if !numbers.insert(lesson.lesson_number) {
            return Err(fail(
                lesson.id,
                format!("duplicate lessonNumber {}", lesson.lesson_number),
            ));
        }
    }

    let done = group.iter().filter(|l| l.status.is_done()).count() as i32;
    if done != parent.lessons_completed {
        return Err(fail(
            first,
            format!(
                "{done} completed or delayed lessons but teacher completion {} reports {}",
                parent.id, parent.lessons_completed
            ),
        ));
    }

    let in_progress: Vec<&&LessonDetailRecord> = group
        .iter()
        .filter(|l| l.status == LessonStatus::InProgress)
        .collect();
    match in_progress.as_slice() {
        [] => Ok(()),
        [current] => {
            let last_done = group
                .iter()
                .filter(|l| l.status.is_done())
                .map(|l| l.lesson_number)
                .max()
                .unwrap_or(0);
            if current.lesson_number == last_done + 1 {
                Ok(())
            } else {
                Err(fail(
                    current.id,
                    format!(
                        "in-progress lesson {} does not follow last completed lesson {}",
                        current.lesson_number, last_done
                    ),
                ))
            }
        }
        [_, second, ..] => Err(fail(
            second.id,
            format!("more than one in-progress lesson for teacher completion {}", parent.id),
        )),
    }
}

/// Checks a replacement teacher row against the lessons already stored under
/// its id. A row with no stored lessons always passes.
pub fn check_against_lessons(
    record: &TeacherCompletionRecord,
    lessons: &[LessonDetailRecord],
) -> Result<(), RecordError> {
    if lessons.is_empty() {
        return Ok(());
    }
    let group: Vec<&LessonDetailRecord> = lessons.iter().collect();
    check_lesson_group(record, &group)
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecordPayload {
    #[serde(default)]
    teacher_completions: Vec<TeacherCompletionRecord>,
    #[serde(default)]
    student_progress: Vec<StudentProgressRecord>,
    #[serde(default)]
    lesson_details: Vec<LessonDetailRecord>,
}

/// Loads a backend-style JSON payload with `teacherCompletions`,
/// `studentProgress` and `lessonDetails` arrays.
pub fn load_json(path: &Path) -> anyhow::Result<RecordStore> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let payload: RecordPayload = serde_json::from_reader(file)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    let store = RecordStore::new(
        payload.teacher_completions,
        payload.student_progress,
        payload.lesson_details,
    )?;
    info!(path = %path.display(), "loaded records from json");
    Ok(store)
}

pub fn write_json(store: &RecordStore, path: &Path) -> anyhow::Result<()> {
    let payload = RecordPayload {
        teacher_completions: store.teachers.clone(),
        student_progress: store.students.clone(),
        lesson_details: store.lessons.clone(),
    };
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    serde_json::to_writer_pretty(file, &payload)?;
    Ok(())
}

/// Loads the three CSV files from `dir`. Only the teacher completion file
/// is required.
pub fn load_csv_dir(dir: &Path) -> anyhow::Result<RecordStore> {
    let teachers: Vec<TeacherCompletionRecord> = read_csv(&dir.join(TEACHER_COMPLETION_CSV))?
        .with_context(|| format!("{} is missing from {}", TEACHER_COMPLETION_CSV, dir.display()))?;
    let students: Vec<StudentProgressRecord> =
        read_csv(&dir.join(STUDENT_PROGRESS_CSV))?.unwrap_or_default();
    let lessons: Vec<LessonDetailRecord> =
        read_csv(&dir.join(LESSON_DETAILS_CSV))?.unwrap_or_default();

    let store = RecordStore::new(teachers, students, lessons)?;
    info!(dir = %dir.display(), "loaded records from csv");
    Ok(store)
}

pub fn read_csv<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Option<Vec<T>>> {
    if !path.exists() {
        return Ok(None);
    }
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mut rows = Vec::new();
    for (line, result) in reader.deserialize::<T>().enumerate() {
        let row = result.with_context(|| format!("{} row {}", path.display(), line + 1))?;
        rows.push(row);
    }
    Ok(Some(rows))
}

pub fn write_csv_dir(store: &RecordStore, dir: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(dir)?;
    write_csv(&dir.join(TEACHER_COMPLETION_CSV), &store.teachers)?;
    write_csv(&dir.join(STUDENT_PROGRESS_CSV), &store.students)?;
    write_csv(&dir.join(LESSON_DETAILS_CSV), &store.lessons)?;
    Ok(())
}

fn write_csv<T: Serialize>(path: &Path, rows: &[T]) -> anyhow::Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

const CAMPUSES: [&str; 2] = ["North Campus", "South Campus"];
const GRADES: [&str; 4] = ["Grade 5", "Grade 6", "Grade 7", "Grade 8"];
const SECTIONS: [&str; 2] = ["A", "B"];
const COURSES: [(&str, &str); 4] = [
    ("MATH", "Mathematics"),
    ("SCI", "Science"),
    ("ENG", "English"),
    ("SST", "Social Studies"),
];
const TEACHERS: [&str; 8] = [
    "Hari Prasad",
    "Meera Iyer",
    "Anil Shrestha",
    "Sunita Rai",
    "Bikash Thapa",
    "Priya Nair",
    "Rajesh Karki",
    "Kavya Menon",
];
const STUDENTS: [&str; 12] = [
    "Aarav Sharma",
    "Asha Gurung",
    "Diya Patel",
    "Ishaan Joshi",
    "Kiran Lama",
    "Maya Tamang",
    "Nikhil Rao",
    "Pooja Adhikari",
    "Rohan Das",
    "Sanjana Bhatt",
    "Tara Magar",
    "Vivek Pillai",
];

/// Deterministic demo dataset: the same seed always yields the same store.
pub fn generate(seed: u64) -> anyhow::Result<RecordStore> {
    let mut rng = StdRng::seed_from_u64(seed);
    let term_start = NaiveDate::from_ymd_opt(2026, 1, 5).context("invalid date")?;

    let mut teachers = Vec::new();
    let mut lessons = Vec::new();
    let mut next_id = 1_i64;
    let mut next_lesson_id = 1_i64;

    for campus in CAMPUSES {
        for (grade_index, grade) in GRADES.iter().enumerate() {
            for section in SECTIONS {
                for (course_index, (code, course)) in COURSES.iter().enumerate() {
                    let teacher = TEACHERS[(grade_index * 2 + course_index) % TEACHERS.len()];
                    let planned = rng.gen_range(20..=40);
                    let completed = rng.gen_range(planned / 3..=planned);
                    let delayed = rng.gen_range(0..=completed / 4);

                    let record = TeacherCompletionRecord {
                        id: next_id,
                        campus: campus.to_string(),
                        grade_program: grade.to_string(),
                        class_section: section.to_string(),
                        teacher_name: teacher.to_string(),
                        course_code: format!("{}{}", code, &grade[6..]),
                        course_name: course.to_string(),
                        total_lessons_planned: 0,
                        lessons_completed: 0,
                        completion_percentage: 0,
                        on_time_lessons: 0,
                        delayed_lessons: 0,
                        behind_schedule_flag: false,
                    }
                    .with_lessons(planned, completed - delayed, delayed);

                    let delayed_positions: HashSet<usize> =
                        sample(&mut rng, completed as usize, delayed as usize)
                            .into_iter()
                            .collect();

                    for n in 0..planned {
                        let planned_date = term_start + Duration::days(i64::from(n) * 3);
                        let (status, completed_date) = if n < completed {
                            if delayed_positions.contains(&(n as usize)) {
                                let late = rng.gen_range(1..=6);
                                (LessonStatus::Delayed, Some(planned_date + Duration::days(late)))
                            } else {
                                (LessonStatus::Completed, Some(planned_date))
                            }
                        } else if n == completed {
                            (LessonStatus::InProgress, None)
                        } else {
                            (LessonStatus::NotStarted, None)
                        };

                        lessons.push(LessonDetailRecord {
                            id: next_lesson_id,
                            teacher_completion_id: record.id,
                            lesson_number: n + 1,
                            lesson_title: format!("{} Lesson {}", course, n + 1),
                            planned_date,
                            completed_date,
                            status,
                        });
                        next_lesson_id += 1;
                    }

                    teachers.push(record);
                    next_id += 1;
                }
            }
        }
    }

    let mut students = Vec::new();
    for (index, name) in STUDENTS.iter().enumerate() {
        let campus = CAMPUSES[index % CAMPUSES.len()];
        let grade = GRADES[index % GRADES.len()];
        let section = SECTIONS[(index / GRADES.len()) % SECTIONS.len()];
        for (code, course) in COURSES {
            let percentage = rng.gen_range(0..=100);
            let score: f64 = rng.gen_range(35.0..=98.0);
            students.push(StudentProgressRecord {
                id: students.len() as i64 + 1,
                student_id: format!("STU-{:04}", index + 1),
                student_name: name.to_string(),
                campus: campus.to_string(),
                grade_program: grade.to_string(),
                class_section: section.to_string(),
                course_code: format!("{}{}", code, &grade[6..]),
                course_name: course.to_string(),
                completion_percentage: percentage,
                last_activity_date: term_start + Duration::days(rng.gen_range(0..60)),
                average_score: (score * 10.0).round() / 10.0,
                at_risk_flag: percentage < AT_RISK_THRESHOLD,
            });
        }
    }

    let store = RecordStore::new(teachers, students, lessons)?;
    info!(
        seed,
        teachers = store.teachers.len(),
        students = store.students.len(),
        lessons = store.lessons.len(),
        "generated record store"
    );
    Ok(store)
}
