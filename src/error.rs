use thiserror::Error;

#[derive(Debug, Error)]
pub enum ForecastError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("no comparable data: {0}")]
    NoComparableData(String),

    #[error("record store failure: {0}")]
    UpstreamFailure(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("query failed: {0}")]
    Query(#[from] sqlx::Error),

    #[error("malformed record: {0}")]
    Malformed(#[from] RecordParseError),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RecordParseError {
    #[error("malformed student id {id:?}: expected YYYY + degree + program + sequence")]
    MalformedStudentId { id: String },

    #[error("malformed cohort id {id:?}: expected a four digit year")]
    MalformedCohortId { id: String },

    #[error("student {student_id}: missing {field}")]
    MissingField {
        student_id: String,
        field: &'static str,
    },

    #[error("student {student_id}: term {term} is not a valid term number")]
    InvalidTerm { student_id: String, term: i64 },

    #[error("student {student_id}: term {term} has invalid {field} {value}")]
    InvalidAverage {
        student_id: String,
        term: u32,
        field: &'static str,
        value: f64,
    },
}

pub type ForecastResult<T> = Result<T, ForecastError>;
