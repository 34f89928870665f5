//! Error types for the verification harness

use thiserror::Error;

#[derive(Error, Debug)]
pub enum E2eError {
    #[error("Element not found: {0}")]
    NotFound(String),

    #[error("Ambiguous match: {locator} matched {count} elements")]
    AmbiguousMatch { locator: String, count: usize },

    #[error("Data region not found: {0}")]
    RegionNotFound(String),

    #[error("Timeout after {waited_ms} ms waiting for: {what}")]
    Timeout { what: String, waited_ms: u64 },

    #[error("Wizard '{wizard}' did not open: {reason}")]
    WizardNotOpened { wizard: String, reason: String },

    #[error("Field '{field}' is declared as {expected} but was given {actual}")]
    FieldTypeMismatch {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("Field '{field}' does not exist on wizard page '{page}'")]
    UnknownField { field: String, page: String },

    #[error("Wizard '{wizard}' has no page {page}")]
    NoSuchPage { wizard: String, page: String },

    #[error("Wizard '{0}' is already closed")]
    WizardClosed(String),

    #[error("Field '{field}' on page '{page}' lost its value: expected {expected:?}, found {found:?}")]
    StateLost {
        page: String,
        field: String,
        expected: String,
        found: String,
    },

    #[error("Stale snapshot of region '{region}': generation {held} is older than {current}")]
    StaleSnapshot {
        region: String,
        held: u64,
        current: u64,
    },

    #[error("Column '{column}' not present in region '{region}'")]
    UnknownColumn { region: String, column: String },

    #[error("Row {row} out of range for region '{region}' ({rows} rows)")]
    RowOutOfRange {
        region: String,
        row: usize,
        rows: usize,
    },

    #[error("Assertion failed: {0}")]
    AssertionFailed(String),

    #[error("Panicked in {phase}: {message}")]
    Panicked { phase: String, message: String },

    #[error("Fixture already exists: {0}")]
    FixtureCollision(String),

    #[error("Expected {expected} '{kind}' job(s) but found {found}")]
    JobCountExceeded {
        kind: String,
        expected: usize,
        found: usize,
    },

    #[error("Pipeline job failed: {0}")]
    JobFailed(String),

    #[error("Server health check failed after {0} attempts")]
    ServerHealthCheck(usize),

    #[error("Node.js not found. Install node and run: npx playwright install")]
    PlaywrightNotFound,

    #[error("Driver error: {0}")]
    Driver(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Plan parse error: {0}")]
    PlanParse(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

impl E2eError {
    /// Whether this error came from an expired bounded wait.
    pub fn is_timeout(&self) -> bool {
        matches!(self, E2eError::Timeout { .. })
    }
}

pub type E2eResult<T> = Result<T, E2eError>;
