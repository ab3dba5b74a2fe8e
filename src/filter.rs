use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use tracing::debug;

use crate::context::{Role, RoleContext};
use crate::error::FilterError;
use crate::models::{LessonStatus, StudentProgressRecord, TeacherCompletionRecord};
use crate::navigation;
use crate::store::LessonRow;

/// The attributes the filter pipeline and the aggregator read from a record.
///
/// An attribute a record type does not carry returns `None`, and the URL
/// filter on it then places no constraint on that type. Role scoping is
/// the exception: a record without the bound attribute is out of scope.
pub trait Filterable {
    fn campus(&self) -> &str;
    fn grade_program(&self) -> &str;
    fn class_section(&self) -> &str;
    fn course_name(&self) -> &str;

    fn teacher_name(&self) -> Option<&str> {
        None
    }

    fn student_id(&self) -> Option<&str> {
        None
    }

    fn completion_percentage(&self) -> Option<i32> {
        None
    }

    fn behind_schedule(&self) -> Option<bool> {
        None
    }

    fn at_risk(&self) -> Option<bool> {
        None
    }

    fn lesson_status(&self) -> Option<LessonStatus> {
        None
    }

    /// Fields the free-text search looks at.
    fn search_fields(&self) -> Vec<Cow<'_, str>>;
}

impl Filterable for TeacherCompletionRecord {
    fn campus(&self) -> &str {
        &self.campus
    }

    fn course_name(&self) -> &str {
        &self.course_name
    }

    fn grade_program(&self) -> &str {
        &self.grade_program
    }

    fn class_section(&self) -> &str {
        &self.class_section
    }

    fn teacher_name(&self) -> Option<&str> {
        Some(&self.teacher_name)
    }

    fn completion_percentage(&self) -> Option<i32> {
        Some(self.completion_percentage)
    }

    fn behind_schedule(&self) -> Option<bool> {
        Some(self.behind_schedule_flag)
    }

    fn search_fields(&self) -> Vec<Cow<'_, str>> {
        vec![
            Cow::Borrowed(self.teacher_name.as_str()),
            Cow::Borrowed(self.course_name.as_str()),
            Cow::Owned(self.class_label()),
        ]
    }
}

impl Filterable for StudentProgressRecord {
    fn campus(&self) -> &str {
        &self.campus
    }

    fn course_name(&self) -> &str {
        &self.course_name
    }

    fn grade_program(&self) -> &str {
        &self.grade_program
    }

    fn class_section(&self) -> &str {
        &self.class_section
    }

    fn student_id(&self) -> Option<&str> {
        Some(&self.student_id)
    }

    fn completion_percentage(&self) -> Option<i32> {
        Some(self.completion_percentage)
    }

    fn at_risk(&self) -> Option<bool> {
        Some(self.at_risk_flag)
    }

    fn search_fields(&self) -> Vec<Cow<'_, str>> {
        vec![
            Cow::Borrowed(self.student_name.as_str()),
            Cow::Borrowed(self.student_id.as_str()),
            Cow::Borrowed(self.course_name.as_str()),
        ]
    }
}

impl Filterable for LessonRow<'_> {
    fn campus(&self) -> &str {
        &self.parent.campus
    }

    fn course_name(&self) -> &str {
        &self.parent.course_name
    }

    fn grade_program(&self) -> &str {
        &self.parent.grade_program
    }

    fn class_section(&self) -> &str {
        &self.parent.class_section
    }

    fn teacher_name(&self) -> Option<&str> {
        Some(&self.parent.teacher_name)
    }

    fn completion_percentage(&self) -> Option<i32> {
        Some(self.parent.completion_percentage)
    }

    fn behind_schedule(&self) -> Option<bool> {
        Some(self.parent.behind_schedule_flag)
    }

    fn lesson_status(&self) -> Option<LessonStatus> {
        Some(self.lesson.status)
    }

    fn search_fields(&self) -> Vec<Cow<'_, str>> {
        vec![
            Cow::Borrowed(self.lesson.lesson_title.as_str()),
            Cow::Borrowed(self.parent.teacher_name.as_str()),
            Cow::Borrowed(self.parent.course_name.as_str()),
        ]
    }
}

/// `band=<min>-<max>`: `min <= pct < max`, except that a band ending at 100
/// also admits 100 so it lines up with the last histogram bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Band {
    pub min: i32,
    pub max: i32,
}

impl Band {
    pub const BUCKETS: [Band; 4] = [
        Band { min: 0, max: 25 },
        Band { min: 25, max: 50 },
        Band { min: 50, max: 75 },
        Band { min: 75, max: 100 },
    ];

    pub fn contains(&self, percentage: i32) -> bool {
        percentage >= self.min
            && (percentage < self.max || (self.max == 100 && percentage == 100))
    }

    /// Index into [`Band::BUCKETS`].
    pub fn bucket_of(percentage: i32) -> usize {
        match percentage {
            p if p < 25 => 0,
            p if p < 50 => 1,
            p if p < 75 => 2,
            _ => 3,
        }
    }
}

impl fmt::Display for Band {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.min, self.max)
    }
}

impl FromStr for Band {
    type Err = FilterError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (min, max) = raw
            .split_once('-')
            .ok_or_else(|| FilterError::invalid("band", raw, "expected <min>-<max>"))?;
        let min: i32 = min
            .trim()
            .parse()
            .map_err(|_| FilterError::invalid("band", raw, "lower bound is not a number"))?;
        let max: i32 = max
            .trim()
            .parse()
            .map_err(|_| FilterError::invalid("band", raw, "upper bound is not a number"))?;
        if min > max {
            return Err(FilterError::invalid("band", raw, "bounds are reversed"));
        }
        Ok(Band { min, max })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagFilter {
    BehindSchedule,
    AtRisk,
}

impl FlagFilter {
    pub fn as_str(self) -> &'static str {
        match self {
            FlagFilter::BehindSchedule => "behind",
            FlagFilter::AtRisk => "at-risk",
        }
    }
}

impl FromStr for FlagFilter {
    type Err = FilterError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "behind" => Ok(FlagFilter::BehindSchedule),
            "at-risk" | "at_risk" | "atrisk" => Ok(FlagFilter::AtRisk),
            _ => Err(FilterError::invalid("filter", raw, "expected behind or at-risk")),
        }
    }
}

/// Filters decoded from the destination view's query string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryFilters {
    pub flag: Option<FlagFilter>,
    pub grade: Option<String>,
    pub teacher: Option<String>,
    pub class: Option<String>,
    pub band: Option<Band>,
    pub status: Option<LessonStatus>,
}

impl QueryFilters {
    /// Accepts a full URL, `?query` or a bare `key=value&...` string.
    pub fn from_query_string(query: &str) -> Self {
        Self::from_pairs(navigation::parse_query(query))
    }

    /// The first occurrence of a key wins, even when its value is empty.
    /// Empty values, unknown keys and malformed values leave the filter unset.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut filters = QueryFilters::default();
        let mut seen: Vec<String> = Vec::new();

        for (key, value) in pairs {
            let key = key.as_ref();
            let value = value.as_ref().trim();
            if seen.iter().any(|k| k == key) {
                continue;
            }
            seen.push(key.to_string());
            if value.is_empty() {
                continue;
            }

            let parsed = match key {
                "filter" => value.parse::<FlagFilter>().map(|flag| filters.flag = Some(flag)),
                "grade" => {
                    filters.grade = Some(value.to_string());
                    Ok(())
                }
                "teacher" => {
                    filters.teacher = Some(value.to_string());
                    Ok(())
                }
                "class" => {
                    filters.class = Some(value.to_string());
                    Ok(())
                }
                "band" => value.parse::<Band>().map(|band| filters.band = Some(band)),
                "status" => LessonStatus::parse_token(value)
                    .map(|status| filters.status = Some(status))
                    .ok_or_else(|| FilterError::invalid("status", value, "unknown lesson status")),
                _ => Ok(()),
            };

            if let Err(e) = parsed {
                debug!(error = %e, "ignoring filter parameter");
            }
        }

        filters
    }

    pub fn matches<R: Filterable + ?Sized>(&self, record: &R) -> bool {
        if let Some(flag) = self.flag {
            let keep = match flag {
                FlagFilter::BehindSchedule => record.behind_schedule(),
                FlagFilter::AtRisk => record.at_risk(),
            };
            if keep == Some(false) {
                return false;
            }
        }
        if let Some(grade) = &self.grade {
            if record.grade_program() != grade {
                return false;
            }
        }
        if let Some(teacher) = &self.teacher {
            if record.teacher_name().is_some_and(|name| name != teacher) {
                return false;
            }
        }
        if let Some(class) = &self.class {
            if !is_class_label(record, class) {
                return false;
            }
        }
        if let Some(band) = &self.band {
            if record.completion_percentage().is_some_and(|pct| !band.contains(pct)) {
                return false;
            }
        }
        if let Some(status) = self.status {
            if record.lesson_status().is_some_and(|s| s != status) {
                return false;
            }
        }
        true
    }
}

fn is_class_label<R: Filterable + ?Sized>(record: &R, label: &str) -> bool {
    label
        .strip_prefix(record.grade_program())
        .and_then(|rest| rest.strip_prefix(' '))
        .is_some_and(|section| section == record.class_section())
}

/// Teachers see their own rows, students their own rows, everyone else all.
pub fn in_scope<R: Filterable + ?Sized>(record: &R, ctx: &RoleContext) -> bool {
    match ctx.role {
        Role::Teacher => match (&ctx.teacher_name, record.teacher_name()) {
            (Some(bound), Some(name)) => bound == name,
            _ => false,
        },
        Role::Student => match (&ctx.student_id, record.student_id()) {
            (Some(bound), Some(id)) => bound == id,
            _ => false,
        },
        Role::Admin | Role::Principal => true,
    }
}

/// `needle` must already be lowercased; an empty needle matches everything.
pub fn matches_search<R: Filterable + ?Sized>(record: &R, needle: &str) -> bool {
    needle.is_empty()
        || record
            .search_fields()
            .iter()
            .any(|field| field.to_lowercase().contains(needle))
}

/// Role scope, then URL filters, then search. Keeps the input order.
pub fn filter<R>(records: &[R], ctx: &RoleContext, filters: &QueryFilters, search: &str) -> Vec<R>
where
    R: Filterable + Clone,
{
    let needle = search.trim().to_lowercase();
    let kept: Vec<R> = records
        .iter()
        .filter(|record| in_scope(*record, ctx))
        .filter(|record| filters.matches(*record))
        .filter(|record| matches_search(*record, &needle))
        .cloned()
        .collect();

    debug!(
        role = %ctx.role,
        input = records.len(),
        output = kept.len(),
        "filtered records"
    );
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures::{student, teacher, teacher_at};

    fn params(query: &str) -> QueryFilters {
        QueryFilters::from_query_string(query)
    }

    fn sample_teachers() -> Vec<TeacherCompletionRecord> {
        vec![
            teacher_at(1, "Hari", "Grade 5", 80),
            teacher_at(2, "Meera", "Grade 5", 60),
            teacher_at(3, "Hari", "Grade 6", 25),
            teacher_at(4, "Anil", "Grade 6", 0),
            teacher_at(5, "Meera", "Grade 7", 100),
        ]
    }

    fn ids(records: &[TeacherCompletionRecord]) -> Vec<i64> {
        records.iter().map(|r| r.id).collect()
    }

    #[test]
    fn teacher_role_sees_only_own_rows() {
        let records = sample_teachers();
        let out = filter(&records, &RoleContext::teacher("Hari"), &QueryFilters::default(), "");
        assert_eq!(ids(&out), vec![1, 3]);
        assert!(out.iter().all(|r| r.teacher_name == "Hari"));
    }

    #[test]
    fn unbound_teacher_role_sees_nothing() {
        let records = sample_teachers();
        let ctx = RoleContext {
            role: Role::Teacher,
            teacher_name: None,
            student_id: None,
        };
        assert!(filter(&records, &ctx, &QueryFilters::default(), "").is_empty());
    }

    #[test]
    fn student_role_scopes_by_student_id() {
        let records = vec![
            student(1, "STU-1", "Asha", 40),
            student(2, "STU-2", "Ravi", 90),
            student(3, "STU-1", "Asha", 70),
        ];
        let out = filter(&records, &RoleContext::student("STU-1"), &QueryFilters::default(), "");
        assert_eq!(out.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 3]);

        // teacher rows carry no student id
        let teachers = sample_teachers();
        let ctx = RoleContext::student("STU-1");
        let scoped = filter(&teachers, &ctx, &QueryFilters::default(), "");
        assert!(scoped.is_empty());
    }

    #[test]
    fn url_filters_combine_with_and() {
        let records = sample_teachers();
        let filters = params("grade=Grade%205&filter=behind");
        let out = filter(&records, &RoleContext::admin(), &filters, "");
        assert_eq!(ids(&out), vec![2]);

        let filters = params("teacher=Meera&grade=Grade%207");
        let out = filter(&records, &RoleContext::principal(), &filters, "");
        assert_eq!(ids(&out), vec![5]);
    }

    #[test]
    fn class_filter_matches_grade_and_section() {
        let mut records = sample_teachers();
        records.push(teacher(6, "Anil", "Grade 5", "B").with_lessons(10, 5, 0));
        let out = filter(&records, &RoleContext::admin(), &params("class=Grade%205%20B"), "");
        assert_eq!(ids(&out), vec![6]);
        assert!(filter(&records, &RoleContext::admin(), &params("class=Grade%205"), "").is_empty());
    }

    #[test]
    fn band_bounds_are_half_open() {
        let records = sample_teachers();
        let out = filter(&records, &RoleContext::admin(), &params("band=0-25"), "");
        assert_eq!(ids(&out), vec![4]);

        let out = filter(&records, &RoleContext::admin(), &params("band=25-50"), "");
        assert_eq!(ids(&out), vec![3]);

        let out = filter(&records, &RoleContext::admin(), &params("band=40-50"), "");
        assert!(out.is_empty());
    }

    #[test]
    fn top_band_includes_one_hundred() {
        let records = sample_teachers();
        let out = filter(&records, &RoleContext::admin(), &params("band=75-100"), "");
        assert_eq!(ids(&out), vec![1, 5]);
    }

    #[test]
    fn malformed_values_are_ignored() {
        let records = sample_teachers();
        let queries = [
            "band=abc",
            "band=50-25",
            "band=10",
            "status=skipped",
            "filter=late",
            "colour=red",
        ];
        for query in queries {
            let filters = params(query);
            assert_eq!(filters, QueryFilters::default(), "{query} should not filter");
            assert_eq!(filter(&records, &RoleContext::admin(), &filters, "").len(), records.len());
        }
    }

    #[test]
    fn band_parse_reports_reason() {
        assert_eq!("25-50".parse::<Band>(), Ok(Band { min: 25, max: 50 }));
        assert!(matches!(
            "50-25".parse::<Band>(),
            Err(FilterError::InvalidFilterValue { key: "band", .. })
        ));
    }

    #[test]
    fn first_occurrence_of_a_key_wins() {
        let filters = params("grade=Grade%205&grade=Grade%206");
        assert_eq!(filters.grade.as_deref(), Some("Grade 5"));

        let filters = params("grade=&grade=Grade%205&band=&band=0-25");
        assert_eq!(filters, QueryFilters::default());
    }

    #[test]
    fn at_risk_filter_keeps_flagged_students() {
        let records = vec![
            student(1, "STU-1", "Asha", 40),
            student(2, "STU-2", "Ravi", 90),
            student(3, "STU-3", "Kiran", 10),
        ];
        let out = filter(&records, &RoleContext::admin(), &params("filter=at-risk"), "");
        assert_eq!(out.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 3]);
    }

    #[test]
    fn search_is_case_insensitive_over_fields() {
        let records = vec![
            student(1, "STU-1", "Asha Rao", 40),
            student(2, "STU-22", "Ravi Kumar", 90),
        ];
        let by_name = filter(&records, &RoleContext::admin(), &QueryFilters::default(), "ASHA");
        assert_eq!(by_name.len(), 1);
        let by_id = filter(&records, &RoleContext::admin(), &QueryFilters::default(), "stu-22");
        assert_eq!(by_id[0].id, 2);
        let by_course = filter(&records, &RoleContext::admin(), &QueryFilters::default(), "math");
        assert_eq!(by_course.len(), 2);

        let teachers = sample_teachers();
        let by_class = filter(
            &teachers,
            &RoleContext::admin(),
            &QueryFilters::default(),
            "grade 6 a",
        );
        assert_eq!(ids(&by_class), vec![3, 4]);
    }

    #[test]
    fn filtering_is_idempotent_and_a_subset() {
        let records = sample_teachers();
        let ctx = RoleContext::teacher("Meera");
        let filters = params("filter=behind");
        let once = filter(&records, &ctx, &filters, "math");
        let twice = filter(&once, &ctx, &filters, "math");
        assert_eq!(once, twice);
        assert!(once.iter().all(|r| records.contains(r)));
    }

    #[test]
    fn empty_result_is_not_an_error() {
        let records = sample_teachers();
        let out = filter(&records, &RoleContext::admin(), &params("grade=Grade%209"), "");
        assert!(out.is_empty());
    }
}
