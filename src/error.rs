/// A query-string value that could not be turned into a filter.
///
/// Never surfaced to the user: the pipeline logs it and treats the
/// parameter as absent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FilterError {
    #[error("invalid value {value:?} for filter {key:?}: {reason}")]
    InvalidFilterValue {
        key: &'static str,
        value: String,
        reason: &'static str,
    },
}

impl FilterError {
    pub fn invalid(key: &'static str, value: &str, reason: &'static str) -> Self {
        FilterError::InvalidFilterValue {
            key,
            value: value.to_string(),
            reason,
        }
    }
}

/// Record Store boundary validation failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    #[error("teacher completion {id}: {reason}")]
    TeacherCompletion { id: i64, reason: String },

    #[error("student progress {id}: {reason}")]
    StudentProgress { id: i64, reason: String },

    #[error("lesson {id}: {reason}")]
    Lesson { id: i64, reason: String },

    #[error("duplicate {kind} id {id}")]
    DuplicateId { kind: &'static str, id: i64 },
}
