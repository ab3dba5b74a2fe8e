use tracing::debug;

use crate::filter::{Band, FlagFilter, QueryFilters};
use crate::models::LessonStatus;

pub const TEACHER_COMPLETION_ROUTE: &str = "/dashboard/teacher-completion";
pub const STUDENT_PROGRESS_ROUTE: &str = "/dashboard/student-progress";
pub const LESSON_DETAILS_ROUTE: &str = "/dashboard/lesson-details";

/// Appends `params` to `base_route` as a percent-encoded query string.
///
/// Parameters keep the given order; pairs with an empty value are dropped.
pub fn build_drill_down_url<I, K, V>(base_route: &str, params: I) -> String
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let query = params
        .into_iter()
        .filter(|(_, value)| !value.as_ref().is_empty())
        .map(|(key, value)| {
            format!(
                "{}={}",
                urlencoding::encode(key.as_ref()),
                urlencoding::encode(value.as_ref())
            )
        })
        .collect::<Vec<_>>()
        .join("&");

    if query.is_empty() {
        return base_route.to_string();
    }

    let separator = match base_route.find('?') {
        None => "?",
        Some(_) if base_route.ends_with('?') || base_route.ends_with('&') => "",
        Some(_) => "&",
    };
    format!("{base_route}{separator}{query}")
}

/// Decodes the query of a URL (or a bare `key=value&...` string) into
/// ordered pairs. `+` decodes to a space, as browsers do.
pub fn parse_query(input: &str) -> Vec<(String, String)> {
    let input = input.split('#').next().unwrap_or_default();
    let query = match input.split_once('?') {
        Some((_, query)) => query,
        None if input.starts_with('/') || input.contains("://") => return Vec::new(),
        None => input,
    };

    let mut pairs = Vec::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        match (decode_component(key), decode_component(value)) {
            (Some(key), Some(value)) => pairs.push((key, value)),
            _ => debug!(pair, "skipping undecodable query pair"),
        }
    }
    pairs
}

fn decode_component(raw: &str) -> Option<String> {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced).ok().map(|v| v.into_owned())
}

/// What a clicked chart bar or summary card stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dimension {
    Grade,
    Teacher,
    Class,
    Band,
    Status,
    BehindSchedule,
    AtRisk,
}

impl Dimension {
    pub fn key(self) -> &'static str {
        match self {
            Dimension::Grade => "grade",
            Dimension::Teacher => "teacher",
            Dimension::Class => "class",
            Dimension::Band => "band",
            Dimension::Status => "status",
            Dimension::BehindSchedule | Dimension::AtRisk => "filter",
        }
    }
}

/// Builds the destination URL for a drill-down click.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrillDown {
    route: String,
    params: Vec<(&'static str, String)>,
}

impl DrillDown {
    pub fn new(route: impl Into<String>) -> Self {
        Self {
            route: route.into(),
            params: Vec::new(),
        }
    }

    /// Starts from the filters already active on the current view.
    pub fn carrying(route: impl Into<String>, filters: &QueryFilters) -> Self {
        let mut drill = Self::new(route);
        if let Some(flag) = filters.flag {
            drill.set("filter", flag.as_str().to_string());
        }
        if let Some(grade) = &filters.grade {
            drill.set("grade", grade.clone());
        }
        if let Some(teacher) = &filters.teacher {
            drill.set("teacher", teacher.clone());
        }
        if let Some(class) = &filters.class {
            drill.set("class", class.clone());
        }
        if let Some(band) = filters.band {
            drill.set("band", band.to_string());
        }
        if let Some(status) = filters.status {
            drill.set("status", status.as_str().to_string());
        }
        drill
    }

    /// Narrows on the clicked data point. Replaces an earlier value for the
    /// same query key.
    pub fn with(mut self, dimension: Dimension, group_key: &str) -> Self {
        let value = match dimension {
            Dimension::BehindSchedule => FlagFilter::BehindSchedule.as_str().to_string(),
            Dimension::AtRisk => FlagFilter::AtRisk.as_str().to_string(),
            Dimension::Status => LessonStatus::parse_token(group_key)
                .map(|s| s.as_str().to_string())
                .unwrap_or_else(|| group_key.to_string()),
            _ => group_key.to_string(),
        };
        self.set(dimension.key(), value);
        self
    }

    pub fn band(self, band: Band) -> Self {
        self.with(Dimension::Band, &band.to_string())
    }

    pub fn url(&self) -> String {
        build_drill_down_url(&self.route, self.params.iter().map(|(k, v)| (*k, v.as_str())))
    }

    fn set(&mut self, key: &'static str, value: String) {
        match self.params.iter_mut().find(|(k, _)| *k == key) {
            Some(existing) => existing.1 = value,
            None => self.params.push((key, value)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_spaces_and_slashes() {
        let url = build_drill_down_url(
            TEACHER_COMPLETION_ROUTE,
            [("grade", "Grade 5/6"), ("filter", "behind")],
        );
        assert_eq!(url, "/dashboard/teacher-completion?grade=Grade%205%2F6&filter=behind");
    }

    #[test]
    fn round_trips_through_parse_query() {
        let url = build_drill_down_url("/dashboard", [("grade", "Grade 5")]);
        assert_eq!(parse_query(&url), vec![("grade".to_string(), "Grade 5".to_string())]);

        let tricky = "Grade 5 A&B = 100% + more";
        let url = build_drill_down_url("/dashboard", [("class", tricky)]);
        assert_eq!(parse_query(&url), vec![("class".to_string(), tricky.to_string())]);
    }

    #[test]
    fn empty_params_leave_route_untouched() {
        let none: [(&str, &str); 0] = [];
        assert_eq!(build_drill_down_url("/dashboard", none), "/dashboard");
        assert_eq!(build_drill_down_url("/dashboard", [("grade", "")]), "/dashboard");
    }

    #[test]
    fn appends_to_existing_query() {
        let url = build_drill_down_url("/dashboard?tab=chart", [("band", "25-50")]);
        assert_eq!(url, "/dashboard?tab=chart&band=25-50");
    }

    #[test]
    fn parse_query_handles_plus_and_fragments() {
        assert_eq!(
            parse_query("https://lms.example/x?teacher=Meera+Iyer#table"),
            vec![("teacher".to_string(), "Meera Iyer".to_string())]
        );
        assert!(parse_query("/dashboard/student-progress").is_empty());
        assert_eq!(parse_query("grade=Grade%205").len(), 1);
    }

    #[test]
    fn drill_down_url_narrows_like_typed_filters() {
        let url = DrillDown::new(TEACHER_COMPLETION_ROUTE)
            .with(Dimension::Grade, "Grade 5")
            .with(Dimension::BehindSchedule, "")
            .band(Band { min: 25, max: 50 })
            .url();
        let decoded = QueryFilters::from_query_string(&url);
        let typed = QueryFilters::from_pairs([
            ("grade", "Grade 5"),
            ("filter", "behind"),
            ("band", "25-50"),
        ]);
        assert_eq!(decoded, typed);
    }

    #[test]
    fn carrying_keeps_current_filters_and_replaces_keys() {
        let current = QueryFilters::from_query_string("grade=Grade%205&filter=at-risk");
        let url = DrillDown::carrying(STUDENT_PROGRESS_ROUTE, &current)
            .with(Dimension::Grade, "Grade 6")
            .url();
        assert_eq!(url, "/dashboard/student-progress?filter=at-risk&grade=Grade%206");
    }

    #[test]
    fn status_values_use_canonical_tokens() {
        let url = DrillDown::new(LESSON_DETAILS_ROUTE)
            .with(Dimension::Status, "In Progress")
            .url();
        assert_eq!(url, "/dashboard/lesson-details?status=in-progress");
        assert_eq!(
            QueryFilters::from_query_string(&url).status,
            Some(LessonStatus::InProgress)
        );
    }
}
