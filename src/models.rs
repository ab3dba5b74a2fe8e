use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::RecordError;

/// Teacher-course pairings below this completion percentage are behind schedule.
pub const BEHIND_SCHEDULE_THRESHOLD: i32 = 70;
/// Student-course pairings below this completion percentage are at risk.
pub const AT_RISK_THRESHOLD: i32 = 50;

/// `round(100 * completed / planned)`, rounding halves up.
pub fn completion_percentage(completed: i32, planned: i32) -> i32 {
    if planned <= 0 {
        return 0;
    }
    let completed = i64::from(completed.max(0));
    let planned = i64::from(planned);
    ((200 * completed + planned) / (2 * planned)) as i32
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeacherCompletionRecord {
    pub id: i64,
    pub campus: String,
    pub grade_program: String,
    pub class_section: String,
    pub teacher_name: String,
    pub course_code: String,
    pub course_name: String,
    pub total_lessons_planned: i32,
    pub lessons_completed: i32,
    pub completion_percentage: i32,
    pub on_time_lessons: i32,
    pub delayed_lessons: i32,
    pub behind_schedule_flag: bool,
}

impl TeacherCompletionRecord {
    /// Fills in the derived fields from the lesson counts.
    pub fn with_lessons(mut self, planned: i32, on_time: i32, delayed: i32) -> Self {
        self.total_lessons_planned = planned;
        self.on_time_lessons = on_time;
        self.delayed_lessons = delayed;
        self.lessons_completed = on_time + delayed;
        self.completion_percentage = completion_percentage(self.lessons_completed, planned);
        self.behind_schedule_flag = self.completion_percentage < BEHIND_SCHEDULE_THRESHOLD;
        self
    }

    /// `"{gradeProgram} {classSection}"`, the value matched by `class=`.
    pub fn class_label(&self) -> String {
        format!("{} {}", self.grade_program, self.class_section)
    }

    pub fn not_started_lessons(&self) -> i32 {
        self.total_lessons_planned - self.lessons_completed
    }

    pub fn validate(&self) -> Result<(), RecordError> {
        let fail = |reason: String| RecordError::TeacherCompletion {
            id: self.id,
            reason,
        };

        if self.total_lessons_planned <= 0 {
            return Err(fail("totalLessonsPlanned must be positive".to_string()));
        }
        if self.lessons_completed < 0 || self.lessons_completed > self.total_lessons_planned {
            return Err(fail(format!(
                "lessonsCompleted {} outside 0..={}",
                self.lessons_completed, self.total_lessons_planned
            )));
        }
        if self.on_time_lessons < 0
            || self.delayed_lessons < 0
            || self.on_time_lessons + self.delayed_lessons != self.lessons_completed
        {
            return Err(fail(format!(
                "onTimeLessons {} + delayedLessons {} != lessonsCompleted {}",
                self.on_time_lessons, self.delayed_lessons, self.lessons_completed
            )));
        }
        let expected = completion_percentage(self.lessons_completed, self.total_lessons_planned);
        if self.completion_percentage != expected {
            return Err(fail(format!(
                "completionPercentage {} should be {}",
                self.completion_percentage, expected
            )));
        }
        if self.behind_schedule_flag != (self.completion_percentage < BEHIND_SCHEDULE_THRESHOLD) {
            return Err(fail("behindScheduleFlag disagrees with completionPercentage".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentProgressRecord {
    pub id: i64,
    pub student_id: String,
    pub student_name: String,
    pub campus: String,
    pub grade_program: String,
    pub class_section: String,
    pub course_code: String,
    pub course_name: String,
    pub completion_percentage: i32,
    pub last_activity_date: NaiveDate,
    pub average_score: f64,
    pub at_risk_flag: bool,
}

impl StudentProgressRecord {
    pub fn class_label(&self) -> String {
        format!("{} {}", self.grade_program, self.class_section)
    }

    pub fn validate(&self) -> Result<(), RecordError> {
        let fail = |reason: String| RecordError::StudentProgress {
            id: self.id,
            reason,
        };

        if !(0..=100).contains(&self.completion_percentage) {
            return Err(fail(format!(
                "completionPercentage {} outside 0..=100",
                self.completion_percentage
            )));
        }
        if self.at_risk_flag != (self.completion_percentage < AT_RISK_THRESHOLD) {
            return Err(fail("atRiskFlag disagrees with completionPercentage".to_string()));
        }
        if !self.average_score.is_finite() || !(0.0..=100.0).contains(&self.average_score) {
            return Err(fail(format!("averageScore {} outside 0..=100", self.average_score)));
        }
        if self.student_id.trim().is_empty() {
            return Err(fail("studentId is empty".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LessonStatus {
    Completed,
    InProgress,
    NotStarted,
    Delayed,
}

impl LessonStatus {
    /// Token used in `status=` query values and the database.
    pub fn as_str(self) -> &'static str {
        match self {
            LessonStatus::Completed => "completed",
            LessonStatus::InProgress => "in-progress",
            LessonStatus::NotStarted => "not-started",
            LessonStatus::Delayed => "delayed",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            LessonStatus::Completed => "Completed",
            LessonStatus::InProgress => "In Progress",
            LessonStatus::NotStarted => "Not Started",
            LessonStatus::Delayed => "Delayed",
        }
    }

    /// Case- and separator-insensitive: `In Progress`, `in_progress`,
    /// `in-progress` and `InProgress` all parse.
    pub fn parse_token(raw: &str) -> Option<Self> {
        let normalized: String = raw
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        match normalized.as_str() {
            "completed" => Some(LessonStatus::Completed),
            "inprogress" => Some(LessonStatus::InProgress),
            "notstarted" => Some(LessonStatus::NotStarted),
            "delayed" => Some(LessonStatus::Delayed),
            _ => None,
        }
    }

    /// Completed and delayed lessons both count towards `lessonsCompleted`.
    pub fn is_done(self) -> bool {
        matches!(self, LessonStatus::Completed | LessonStatus::Delayed)
    }
}

impl fmt::Display for LessonStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LessonDetailRecord {
    pub id: i64,
    pub teacher_completion_id: i64,
    pub lesson_number: i32,
    pub lesson_title: String,
    pub planned_date: NaiveDate,
    pub completed_date: Option<NaiveDate>,
    pub status: LessonStatus,
}

impl LessonDetailRecord {
    pub fn validate(&self) -> Result<(), RecordError> {
        let fail = |reason: String| RecordError::Lesson {
            id: self.id,
            reason,
        };

        if self.lesson_number < 1 {
            return Err(fail(format!("lessonNumber {} must start at 1", self.lesson_number)));
        }
        match (self.status.is_done(), self.completed_date) {
            (true, None) => Err(fail(format!("{} lesson has no completedDate", self.status))),
            (false, Some(_)) => Err(fail(format!("{} lesson has a completedDate", self.status))),
            _ => Ok(()),
        }
    }
}

/// One `{groupKey, value}` data point of a chart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedMetric {
    pub group_key: String,
    pub value: i64,
}

impl AggregatedMetric {
    pub fn new(group_key: impl Into<String>, value: i64) -> Self {
        Self {
            group_key: group_key.into(),
            value,
        }
    }
}

/// Completion histogram for one group; the last bucket includes 100.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BandHistogram {
    #[serde(rename = "groupKey")]
    pub group_key: String,
    pub band0_25: i64,
    pub band25_50: i64,
    pub band50_75: i64,
    pub band75_100: i64,
}

impl BandHistogram {
    pub fn total(&self) -> i64 {
        self.band0_25 + self.band25_50 + self.band50_75 + self.band75_100
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LessonStatusTotals {
    pub on_time: i64,
    pub delayed: i64,
    pub not_started: i64,
}

/// Dashboard summary cards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionSummary {
    pub records: usize,
    pub mean_completion: Option<i64>,
    pub behind_schedule: usize,
    pub at_risk: usize,
}

#[cfg(test)]
pub mod fixtures {
    use super::*;

    pub fn teacher(id: i64, teacher: &str, grade: &str, section: &str) -> TeacherCompletionRecord {
        TeacherCompletionRecord {
            id,
            campus: "North".to_string(),
            grade_program: grade.to_string(),
            class_section: section.to_string(),
            teacher_name: teacher.to_string(),
            course_code: format!("C{id:03}"),
            course_name: "Mathematics".to_string(),
            total_lessons_planned: 0,
            lessons_completed: 0,
            completion_percentage: 0,
            on_time_lessons: 0,
            delayed_lessons: 0,
            behind_schedule_flag: false,
        }
    }

    /// A teacher row with `percentage` of 100 planned lessons completed.
    pub fn teacher_at(
        id: i64,
        name: &str,
        grade: &str,
        percentage: i32,
    ) -> TeacherCompletionRecord {
        teacher(id, name, grade, "A").with_lessons(100, percentage, 0)
    }

    pub fn student(
        id: i64,
        student_id: &str,
        name: &str,
        percentage: i32,
    ) -> StudentProgressRecord {
        StudentProgressRecord {
            id,
            student_id: student_id.to_string(),
            student_name: name.to_string(),
            campus: "North".to_string(),
            grade_program: "Grade 5".to_string(),
            class_section: "A".to_string(),
            course_code: "MATH5".to_string(),
            course_name: "Mathematics".to_string(),
            completion_percentage: percentage,
            last_activity_date: NaiveDate::from_ymd_opt(2026, 3, 2).expect("valid date"),
            average_score: 72.5,
            at_risk_flag: percentage < AT_RISK_THRESHOLD,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn completion_percentage_rounds_half_up() {
        assert_eq!(completion_percentage(1, 8), 13); // 12.5
        assert_eq!(completion_percentage(1, 3), 33);
        assert_eq!(completion_percentage(2, 3), 67);
        assert_eq!(completion_percentage(0, 0), 0);
    }

    #[test]
    fn with_lessons_derives_flags() {
        let record = teacher(1, "Hari", "Grade 5", "A").with_lessons(20, 10, 3);
        assert_eq!(record.lessons_completed, 13);
        assert_eq!(record.completion_percentage, 65);
        assert!(record.behind_schedule_flag);
        assert_eq!(record.not_started_lessons(), 7);
        assert!(record.validate().is_ok());

        let on_track = teacher(2, "Meera", "Grade 5", "B").with_lessons(10, 7, 0);
        assert_eq!(on_track.completion_percentage, 70);
        assert!(!on_track.behind_schedule_flag);
    }

    #[test]
    fn validate_rejects_broken_teacher_invariants() {
        let mut record = teacher(1, "Hari", "Grade 5", "A").with_lessons(10, 4, 2);
        record.on_time_lessons = 5;
        assert!(record.validate().is_err());

        let mut record = teacher(2, "Hari", "Grade 5", "A").with_lessons(10, 4, 2);
        record.behind_schedule_flag = false;
        assert!(record.validate().is_err());

        let record = teacher(3, "Hari", "Grade 5", "A");
        assert!(record.validate().is_err());
    }

    #[test]
    fn validate_checks_student_risk_flag() {
        assert!(student(1, "STU-1", "Asha", 49).validate().is_ok());
        let mut record = student(2, "STU-2", "Ravi", 49);
        record.at_risk_flag = false;
        assert!(record.validate().is_err());
    }

    #[test]
    fn status_tokens_are_normalized() {
        for raw in ["in-progress", "In Progress", "in_progress", "InProgress", "IN-PROGRESS"] {
            assert_eq!(LessonStatus::parse_token(raw), Some(LessonStatus::InProgress));
        }
        assert_eq!(LessonStatus::parse_token("not-started"), Some(LessonStatus::NotStarted));
        assert_eq!(LessonStatus::parse_token("skipped"), None);
        for status in [
            LessonStatus::Completed,
            LessonStatus::InProgress,
            LessonStatus::NotStarted,
            LessonStatus::Delayed,
        ] {
            assert_eq!(LessonStatus::parse_token(status.as_str()), Some(status));
        }
    }

    #[test]
    fn records_use_camel_case_fields() {
        let value = serde_json::to_value(teacher_at(7, "Hari", "Grade 5", 80)).unwrap();
        assert_eq!(value["gradeProgram"], "Grade 5");
        assert_eq!(value["behindScheduleFlag"], false);

        let histogram = serde_json::to_value(BandHistogram::default()).unwrap();
        assert!(histogram.get("band75_100").is_some());
        assert!(histogram.get("groupKey").is_some());
    }
}
