use std::collections::HashMap;

use crate::filter::{Band, Filterable};
use crate::models::{
    AggregatedMetric, BandHistogram, CompletionSummary, LessonStatusTotals,
    StudentProgressRecord, TeacherCompletionRecord,
};

/// Length of the "top teachers" chart.
pub const TOP_TEACHERS: usize = 10;

/// Groups `records` by `key_fn` in first-seen key order and reduces each
/// group. A group whose reducer finds nothing eligible (`None`) is dropped.
pub fn aggregate<R, K, F>(records: &[R], key_fn: K, reduce_fn: F) -> Vec<AggregatedMetric>
where
    K: Fn(&R) -> String,
    F: Fn(&[&R]) -> Option<i64>,
{
    group_by(records, key_fn)
        .into_iter()
        .filter_map(|(group_key, members)| {
            reduce_fn(&members).map(|value| AggregatedMetric::new(group_key, value))
        })
        .collect()
}

fn group_by<R, K>(records: &[R], key_fn: K) -> Vec<(String, Vec<&R>)>
where
    K: Fn(&R) -> String,
{
    let mut groups: Vec<(String, Vec<&R>)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for record in records {
        let key = key_fn(record);
        match index.get(&key) {
            Some(&i) => groups[i].1.push(record),
            None => {
                index.insert(key.clone(), groups.len());
                groups.push((key, vec![record]));
            }
        }
    }
    groups
}

/// Mean completion percentage rounded half up.
pub fn mean_completion<R: Filterable>(group: &[&R]) -> Option<i64> {
    let values: Vec<i64> = group
        .iter()
        .filter_map(|r| r.completion_percentage())
        .map(i64::from)
        .collect();
    rounded_mean(&values)
}

pub fn count<R>(group: &[&R]) -> Option<i64> {
    (!group.is_empty()).then_some(group.len() as i64)
}

pub fn sum_by<R>(field: impl Fn(&R) -> i64) -> impl Fn(&[&R]) -> Option<i64> {
    move |group: &[&R]| {
        (!group.is_empty()).then(|| group.iter().map(|r| field(*r)).sum())
    }
}

fn rounded_mean(values: &[i64]) -> Option<i64> {
    if values.is_empty() {
        return None;
    }
    let n = values.len() as i64;
    let sum: i64 = values.iter().sum();
    Some((2 * sum + n).div_euclid(2 * n))
}

pub fn by_grade<R: Filterable>(record: &R) -> String {
    record.grade_program().to_string()
}

pub fn by_class<R: Filterable>(record: &R) -> String {
    format!("{} {}", record.grade_program(), record.class_section())
}

pub fn by_campus<R: Filterable>(record: &R) -> String {
    record.campus().to_string()
}

pub fn by_course<R: Filterable>(record: &R) -> String {
    record.course_name().to_string()
}

pub fn by_teacher<R: Filterable>(record: &R) -> String {
    record.teacher_name().unwrap_or("Unassigned").to_string()
}

pub fn by_status<R: Filterable>(record: &R) -> String {
    record
        .lesson_status()
        .map(|status| status.label())
        .unwrap_or("Unknown")
        .to_string()
}

/// Per-group counts of completion percentages in
/// `[0,25) [25,50) [50,75) [75,100]`.
pub fn band_histogram<R, K>(records: &[R], key_fn: K) -> Vec<BandHistogram>
where
    R: Filterable,
    K: Fn(&R) -> String,
{
    group_by(records, key_fn)
        .into_iter()
        .filter_map(|(group_key, members)| {
            let mut histogram = BandHistogram {
                group_key,
                ..BandHistogram::default()
            };
            for pct in members.iter().filter_map(|r| r.completion_percentage()) {
                let slot = match Band::bucket_of(pct) {
                    0 => &mut histogram.band0_25,
                    1 => &mut histogram.band25_50,
                    2 => &mut histogram.band50_75,
                    _ => &mut histogram.band75_100,
                };
                *slot += 1;
            }
            (histogram.total() > 0).then_some(histogram)
        })
        .collect()
}

/// Highest values first; ties keep first-seen order.
pub fn top_n(mut metrics: Vec<AggregatedMetric>, n: usize) -> Vec<AggregatedMetric> {
    metrics.sort_by(|a, b| b.value.cmp(&a.value));
    metrics.truncate(n);
    metrics
}

/// Flat totals across the filtered teacher rows.
pub fn lesson_status_totals(records: &[TeacherCompletionRecord]) -> LessonStatusTotals {
    records
        .iter()
        .fold(LessonStatusTotals::default(), |mut totals, record| {
            totals.on_time += i64::from(record.on_time_lessons);
            totals.delayed += i64::from(record.delayed_lessons);
            totals.not_started += i64::from(record.not_started_lessons());
            totals
        })
}

pub fn summarize_teachers(records: &[TeacherCompletionRecord]) -> CompletionSummary {
    let refs: Vec<&TeacherCompletionRecord> = records.iter().collect();
    CompletionSummary {
        records: records.len(),
        mean_completion: mean_completion(&refs),
        behind_schedule: records.iter().filter(|r| r.behind_schedule_flag).count(),
        at_risk: 0,
    }
}

pub fn summarize_students(records: &[StudentProgressRecord]) -> CompletionSummary {
    let refs: Vec<&StudentProgressRecord> = records.iter().collect();
    CompletionSummary {
        records: records.len(),
        mean_completion: mean_completion(&refs),
        behind_schedule: 0,
        at_risk: records.iter().filter(|r| r.at_risk_flag).count(),
    }
}
