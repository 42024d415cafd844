use std::fmt;

/// Errors returned by engine queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// No live identity is linked to this id, or the identity has no
    /// contributing records yet.
    NotFound { external_id: String },
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryError::NotFound { external_id } => {
                write!(f, "no batch known for id '{external_id}'")
            }
        }
    }
}

impl std::error::Error for QueryError {}
