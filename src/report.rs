use std::fmt::Write;

use crate::aggregate::{self, by_grade, by_teacher, mean_completion};
use crate::context::RoleContext;
use crate::filter::{filter, Band, FlagFilter, QueryFilters};
use crate::models::TeacherCompletionRecord;
use crate::navigation::{
    Dimension, DrillDown, LESSON_DETAILS_ROUTE, STUDENT_PROGRESS_ROUTE, TEACHER_COMPLETION_ROUTE,
};
use crate::store::RecordStore;

fn describe_filters(filters: &QueryFilters, search: &str) -> String {
    let mut parts = Vec::new();
    if let Some(flag) = filters.flag {
        parts.push(format!("filter={}", flag.as_str()));
    }
    if let Some(grade) = &filters.grade {
        parts.push(format!("grade={grade}"));
    }
    if let Some(teacher) = &filters.teacher {
        parts.push(format!("teacher={teacher}"));
    }
    if let Some(class) = &filters.class {
        parts.push(format!("class={class}"));
    }
    if let Some(band) = filters.band {
        parts.push(format!("band={band}"));
    }
    if let Some(status) = filters.status {
        parts.push(format!("status={}", status.as_str()));
    }
    if !search.trim().is_empty() {
        parts.push(format!("search \"{}\"", search.trim()));
    }
    if parts.is_empty() {
        "no filters".to_string()
    } else {
        parts.join(", ")
    }
}

fn percent(value: Option<i64>) -> String {
    value.map(|v| format!("{v}%")).unwrap_or_else(|| "n/a".to_string())
}

pub fn build_report(
    store: &RecordStore,
    ctx: &RoleContext,
    filters: &QueryFilters,
    search: &str,
    top_n: usize,
) -> String {
    let teachers = filter(store.teachers(), ctx, filters, search);
    let students = filter(store.students(), ctx, filters, search);
    let lesson_rows = store.lesson_rows();
    let lessons = filter(&lesson_rows, ctx, filters, search);

    let teacher_summary = aggregate::summarize_teachers(&teachers);
    let student_summary = aggregate::summarize_students(&students);
    let drill = |route: &str| DrillDown::carrying(route, filters);

    let mut output = String::new();
    let _ = writeln!(output, "# Completion Insights Report");
    let _ = writeln!(
        output,
        "Generated for the {} view ({})",
        ctx.role,
        describe_filters(filters, search)
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Summary");
    let _ = writeln!(
        output,
        "- Teacher courses: {} (mean completion {})",
        teacher_summary.records,
        percent(teacher_summary.mean_completion)
    );
    let _ = writeln!(
        output,
        "- Behind schedule: {} ([view]({}))",
        teacher_summary.behind_schedule,
        drill(TEACHER_COMPLETION_ROUTE)
            .with(Dimension::BehindSchedule, FlagFilter::BehindSchedule.as_str())
            .url()
    );
    let _ = writeln!(
        output,
        "- Student courses: {} (mean completion {})",
        student_summary.records,
        percent(student_summary.mean_completion)
    );
    let _ = writeln!(
        output,
        "- At risk: {} ([view]({}))",
        student_summary.at_risk,
        drill(STUDENT_PROGRESS_ROUTE)
            .with(Dimension::AtRisk, FlagFilter::AtRisk.as_str())
            .url()
    );

    let _ = writeln!(output);
    let _ = writeln!(output, "## Mean Completion by Grade");
    let by_grade_metrics = aggregate::aggregate(&teachers, by_grade, mean_completion);
    if by_grade_metrics.is_empty() {
        let _ = writeln!(output, "No teacher courses match these filters.");
    } else {
        for metric in &by_grade_metrics {
            let _ = writeln!(
                output,
                "- [{}]({}): {}%",
                metric.group_key,
                drill(TEACHER_COMPLETION_ROUTE)
                    .with(Dimension::Grade, &metric.group_key)
                    .url(),
                metric.value
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Top Teachers");
    let top = aggregate::top_n(
        aggregate::aggregate(&teachers, by_teacher, mean_completion),
        top_n,
    );
    if top.is_empty() {
        let _ = writeln!(output, "No teachers match these filters.");
    } else {
        for (rank, metric) in top.iter().enumerate() {
            let _ = writeln!(
                output,
                "{}. [{}]({}): {}%",
                rank + 1,
                metric.group_key,
                drill(TEACHER_COMPLETION_ROUTE)
                    .with(Dimension::Teacher, &metric.group_key)
                    .url(),
                metric.value
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Student Completion Bands by Grade");
    let histogram = aggregate::band_histogram(&students, by_grade);
    if histogram.is_empty() {
        let _ = writeln!(output, "No student courses match these filters.");
    } else {
        let _ = writeln!(output, "| Grade | 0-25 | 25-50 | 50-75 | 75-100 |");
        let _ = writeln!(output, "|---|---|---|---|---|");
        for row in &histogram {
            let counts = [row.band0_25, row.band25_50, row.band50_75, row.band75_100];
            let cells: Vec<String> = Band::BUCKETS
                .iter()
                .zip(counts)
                .map(|(band, count)| {
                    let url = drill(STUDENT_PROGRESS_ROUTE)
                        .with(Dimension::Grade, &row.group_key)
                        .band(*band)
                        .url();
                    format!("[{count}]({url})")
                })
                .collect();
            let _ = writeln!(output, "| {} | {} |", row.group_key, cells.join(" | "));
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Lesson Status");
    let totals = aggregate::lesson_status_totals(&teachers);
    let _ = writeln!(
        output,
        "- On time: {}\n- Delayed: {}\n- Not started: {}",
        totals.on_time, totals.delayed, totals.not_started
    );
    let planned = aggregate::aggregate(
        &teachers,
        by_grade,
        aggregate::sum_by(|r: &TeacherCompletionRecord| i64::from(r.total_lessons_planned)),
    );
    for metric in &planned {
        let _ = writeln!(output, "- {} planned lessons: {}", metric.group_key, metric.value);
    }
    let by_status = aggregate::aggregate(&lessons, aggregate::by_status, aggregate::count);
    for metric in &by_status {
        let _ = writeln!(
            output,
            "- {} lessons: [{}]({})",
            metric.group_key,
            metric.value,
            drill(LESSON_DETAILS_ROUTE)
                .with(Dimension::Status, &metric.group_key)
                .url()
        );
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## At-Risk Students");
    let at_risk: Vec<_> = students.iter().filter(|s| s.at_risk_flag).collect();
    if at_risk.is_empty() {
        let _ = writeln!(output, "No at-risk students for these filters.");
    } else {
        for student in at_risk.iter().take(10) {
            let _ = writeln!(
                output,
                "- {} ({}, {} {}) {}: {}% complete, last active {}",
                student.student_name,
                student.student_id,
                student.grade_program,
                student.class_section,
                student.course_name,
                student.completion_percentage,
                student.last_activity_date
            );
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures::{student, teacher_at};

    fn store() -> RecordStore {
        RecordStore::new(
            vec![
                teacher_at(1, "Hari", "Grade 5", 80),
                teacher_at(2, "Meera", "Grade 5", 60),
            ],
            vec![student(1, "STU-1", "Asha", 40), student(2, "STU-2", "Ravi", 90)],
            Vec::new(),
        )
        .unwrap()
    }

    #[test]
    fn report_links_each_grade_and_teacher() {
        let filters = QueryFilters::default();
        let report = build_report(&store(), &RoleContext::admin(), &filters, "", 10);
        assert!(report.contains("- [Grade 5](/dashboard/teacher-completion?grade=Grade%205): 70%"));
        assert!(report.contains("1. [Hari](/dashboard/teacher-completion?teacher=Hari): 80%"));
        let behind = "- Behind schedule: 1 ([view](/dashboard/teacher-completion?filter=behind))";
        assert!(report.contains(behind));
        assert!(report.contains("[1](/dashboard/student-progress?grade=Grade%205&band=25-50)"));
        assert!(report.contains("Asha (STU-1, Grade 5 A) Mathematics: 40% complete"));
    }

    #[test]
    fn drill_links_carry_active_filters() {
        let filters = QueryFilters::from_query_string("filter=behind");
        let report = build_report(&store(), &RoleContext::admin(), &filters, "", 10);
        assert!(report.contains("(filter=behind)"));
        let meera = "[Meera](/dashboard/teacher-completion?filter=behind&teacher=Meera): 60%";
        assert!(report.contains(meera));
        assert!(!report.contains("[Hari]"));
    }

    #[test]
    fn empty_views_render_empty_states() {
        let filters = QueryFilters::from_query_string("grade=Grade%209");
        let report = build_report(&store(), &RoleContext::admin(), &filters, "", 10);
        assert!(report.contains("No teacher courses match these filters."));
        assert!(report.contains("No teachers match these filters."));
        assert!(report.contains("No student courses match these filters."));
        assert!(report.contains("No at-risk students for these filters."));
        assert!(report.contains("mean completion n/a"));
    }
}
