//! SQL Server CDC error types

use crate::common::CdcError;
use thiserror::Error;

/// SQL Server number for "Invalid object name".
pub const INVALID_OBJECT_NAME: u32 = 208;

/// SQL Server CDC errors
#[derive(Debug, Error)]
pub enum SqlServerError {
    /// TDS protocol error
    #[error("TDS protocol error: {0}")]
    Tds(String),

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// CDC is not enabled on the database
    #[error("CDC is not enabled on database '{0}'")]
    CdcNotEnabled(String),

    /// Capture agent is not running
    #[error("SQL Server Agent is not running - CDC capture job cannot run")]
    AgentNotRunning,

    /// Invalid LSN format
    #[error("Invalid LSN: {0}")]
    InvalidLsn(String),

    /// Change table no longer exists
    #[error("Change table for capture instance '{0}' no longer exists")]
    ChangeTableGone(String),

    /// Query execution failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// A bound query returned NULL
    #[error("{0} returned no log position")]
    NullPosition(&'static str),

    /// CDC cleanup removed the requested range
    #[error("Log truncated: requested LSN {requested} is older than minimum available {min_available}")]
    LogTruncated {
        requested: String,
        min_available: String,
    },

    /// Update before-image without its after-image
    #[error("Update before-image at {0} has no matching after-image")]
    UnpairedUpdate(String),
}

impl From<SqlServerError> for CdcError {
    fn from(err: SqlServerError) -> Self {
        match err {
            SqlServerError::Tds(msg)
            | SqlServerError::QueryFailed(msg)
            | SqlServerError::Connection(msg) => CdcError::ReadFailure(msg),
            SqlServerError::ChangeTableGone(capture_instance) => {
                CdcError::ChangeTableGone { capture_instance }
            }
            e @ (SqlServerError::NullPosition(_) | SqlServerError::LogTruncated { .. }) => {
                CdcError::NotAvailable(e.to_string())
            }
            e @ (SqlServerError::CdcNotEnabled(_)
            | SqlServerError::Authentication(_)
            | SqlServerError::AgentNotRunning) => CdcError::Config(e.to_string()),
            e @ SqlServerError::InvalidLsn(_) => CdcError::InvalidState(e.to_string()),
            e @ SqlServerError::UnpairedUpdate(_) => CdcError::Other(e.to_string()),
        }
    }
}
