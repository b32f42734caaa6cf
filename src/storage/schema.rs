//! Database schema definitions.
//!
//! The `evaluations` CHECK constraints enforce the record invariants at the
//! database level: score and report travel together, and `completed_at`
//! is set exactly for terminal statuses.

/// SQL schema for the evaluations table.
pub const CREATE_EVALUATIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS evaluations (
    id UUID PRIMARY KEY,
    status VARCHAR(16) NOT NULL
        CHECK (status IN ('pending', 'running', 'complete', 'failed')),
    contextual_debt_score DOUBLE PRECISION
        CHECK (contextual_debt_score >= 0 AND contextual_debt_score <= 1),
    report JSONB,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    completed_at TIMESTAMPTZ,
    CONSTRAINT evaluations_score_with_report
        CHECK ((contextual_debt_score IS NULL) = (report IS NULL)),
    CONSTRAINT evaluations_completed_when_terminal
        CHECK ((completed_at IS NOT NULL) = (status IN ('complete', 'failed')))
)
"#;

/// SQL schema for the thoughts table backing the task pool.
pub const CREATE_THOUGHTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS thoughts (
    id VARCHAR(255) PRIMARY KEY,
    title TEXT,
    content TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

pub const CREATE_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_evaluations_status ON evaluations(status);
CREATE INDEX IF NOT EXISTS idx_evaluations_created_at ON evaluations(created_at);
CREATE INDEX IF NOT EXISTS idx_thoughts_created_at ON thoughts(created_at)
"#;

/// Returns all schema creation statements in order.
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![CREATE_EVALUATIONS_TABLE, CREATE_THOUGHTS_TABLE, CREATE_INDEXES]
}

/// Table names in the schema.
pub mod tables {
    pub const EVALUATIONS: &str = "evaluations";
    pub const THOUGHTS: &str = "thoughts";
    pub const MIGRATIONS: &str = "_migrations";
}
