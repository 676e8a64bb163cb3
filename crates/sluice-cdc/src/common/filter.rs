//! Data collection filtering
//!
//! Include/exclude policy over tables, using glob patterns matched against
//! `schema.table`, `catalog.schema.table` or the bare table name.
//!
//! # Example
//!
//! ```rust
//! use sluice_cdc::common::{DataCollectionFilter, TableId};
//!
//! let filter = DataCollectionFilter::new(
//!     &["dbo.*".to_string()],
//!     &["*.audit_log".to_string()],
//! ).unwrap();
//!
//! assert!(filter.is_included(&TableId::new("testdb", "dbo", "orders")));
//! assert!(!filter.is_included(&TableId::new("testdb", "dbo", "audit_log")));
//! ```

use crate::common::schema::TableId;
use crate::common::{CdcError, Result};
use regex::Regex;

/// Compiled include/exclude filter.
#[derive(Debug, Clone)]
pub struct DataCollectionFilter {
    include_patterns: Vec<Regex>,
    exclude_patterns: Vec<Regex>,
}

impl Default for DataCollectionFilter {
    fn default() -> Self {
        Self::include_all()
    }
}

impl DataCollectionFilter {
    /// Compile a filter from glob patterns.
    ///
    /// An empty include list includes everything not excluded.
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self> {
        let compile = |patterns: &[String]| {
            patterns
                .iter()
                .map(|p| Self::glob_to_regex(p))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| CdcError::config(format!("Invalid table pattern: {}", e)))
        };

        Ok(Self {
            include_patterns: compile(include)?,
            exclude_patterns: compile(exclude)?,
        })
    }

    /// Filter that includes every collection.
    pub fn include_all() -> Self {
        Self {
            include_patterns: Vec::new(),
            exclude_patterns: Vec::new(),
        }
    }

    /// Convert glob pattern to regex
    fn glob_to_regex(pattern: &str) -> std::result::Result<Regex, regex::Error> {
        let escaped = regex::escape(pattern);
        let regex_pattern = escaped.replace(r"\*", ".*").replace(r"\?", ".");
        Regex::new(&format!("(?i)^{}$", regex_pattern))
    }

    fn matches(pattern: &Regex, id: &TableId) -> bool {
        pattern.is_match(&id.schema_qualified())
            || pattern.is_match(&id.to_string())
            || pattern.is_match(&id.table)
    }

    /// Check if a collection passes the policy.
    pub fn is_included(&self, id: &TableId) -> bool {
        // Excludes win over includes
        if self.exclude_patterns.iter().any(|p| Self::matches(p, id)) {
            return false;
        }

        if self.include_patterns.is_empty() {
            return true;
        }

        self.include_patterns.iter().any(|p| Self::matches(p, id))
    }
}
