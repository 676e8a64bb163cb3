//! Change table range queries
//!
//! [`ChangesQuery`] describes one bounded read of a change table. It renders
//! to T-SQL for the TDS client and evaluates the same predicate in process
//! for change logs that are not backed by a database.
//!
//! The lower bound is exclusive over `(start_lsn, seqval, operation)`:
//!
//! ```text
//! WHERE (([__$start_lsn] = @from AND [__$seqval] = @seq AND [__$operation] > @op)
//!     OR ([__$start_lsn] = @from AND [__$seqval] > @seq)
//!     OR ([__$start_lsn] > @from))
//!   AND [__$start_lsn] <= @to
//!   AND [__$operation] NOT IN (...)
//! ```

use super::change_table::{ChangeRow, ChangeTable};
use super::lsn::Lsn;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt::Write;

/// How change rows are read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataQueryMode {
    /// `cdc.fn_cdc_get_all_changes_<capture>` table-valued function
    #[default]
    Function,
    /// Select straight from the `cdc.<capture>_CT` table
    Direct,
}

/// Positional parameter of a rendered query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryParam {
    Lsn(Lsn),
    Int(i32),
}

/// One bounded, ordered read of a change table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangesQuery {
    pub mode: DataQueryMode,
    /// Exclusive lower bound position (already clamped to the table start)
    pub from_lsn: Lsn,
    pub from_seqval: Lsn,
    pub from_operation: i32,
    /// Inclusive upper bound
    pub to_lsn: Lsn,
    /// 0 = unbounded
    pub max_rows: u32,
    /// `__$operation` codes to leave out
    pub excluded_operations: BTreeSet<i32>,
}

impl ChangesQuery {
    pub fn new(mode: DataQueryMode, from_lsn: Lsn, to_lsn: Lsn) -> Self {
        Self {
            mode,
            from_lsn,
            from_seqval: Lsn::ZERO,
            from_operation: 0,
            to_lsn,
            max_rows: 0,
            excluded_operations: BTreeSet::new(),
        }
    }

    /// Resume after the change at `(seqval, operation)` of `from_lsn`.
    pub fn after(mut self, seqval: Lsn, operation: i32) -> Self {
        self.from_seqval = seqval;
        self.from_operation = operation;
        self
    }

    pub fn with_max_rows(mut self, max_rows: u32) -> Self {
        self.max_rows = max_rows;
        self
    }

    pub fn excluding(mut self, ranks: BTreeSet<i32>) -> Self {
        self.excluded_operations = ranks;
        self
    }

    /// Whether a row falls inside the bounds and is not excluded.
    ///
    /// NULL bounds match nothing, like SQL comparisons against NULL.
    pub fn matches(&self, row: &ChangeRow) -> bool {
        if !self.from_lsn.is_available()
            || !self.from_seqval.is_available()
            || !self.to_lsn.is_available()
        {
            return false;
        }
        let after_lower = match row.commit_lsn.cmp(&self.from_lsn) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => match row.seqval.cmp(&self.from_seqval) {
                Ordering::Greater => true,
                Ordering::Less => false,
                Ordering::Equal => row.operation > self.from_operation,
            },
        };
        after_lower
            && row.commit_lsn <= self.to_lsn
            && !self.excluded_operations.contains(&row.operation)
    }

    /// Result ordering of this query mode.
    pub fn compare(&self, a: &ChangeRow, b: &ChangeRow) -> Ordering {
        match self.mode {
            DataQueryMode::Function => a.order_key().cmp(&b.order_key()),
            DataQueryMode::Direct => (a.commit_lsn, a.command_id, a.seqval, a.operation).cmp(&(
                b.commit_lsn,
                b.command_id,
                b.seqval,
                b.operation,
            )),
        }
    }

    /// Render the T-SQL text with `@P<n>` placeholders.
    pub fn to_sql(&self, database: &str, table: &ChangeTable) -> String {
        let columns = table
            .captured_columns
            .iter()
            .map(|c| quote_identifier(c))
            .collect::<Vec<_>>()
            .join(", ");
        let db = quote_identifier(database);
        let top = if self.max_rows > 0 {
            format!("TOP {} ", self.max_rows)
        } else {
            String::new()
        };

        let mut sql = format!(
            "SELECT {top}[__$start_lsn], [__$seqval], [__$operation], [__$update_mask], {columns}, \
             TODATETIMEOFFSET({db}.sys.fn_cdc_map_lsn_to_time([__$start_lsn]), DATEPART(TZOFFSET, SYSDATETIMEOFFSET())) "
        );

        let mut p = 1;
        match self.mode {
            DataQueryMode::Function => {
                let function = quote_identifier(&format!(
                    "fn_cdc_get_all_changes_{}",
                    table.capture_instance
                ));
                let _ = write!(
                    sql,
                    "FROM {db}.cdc.{function}(@P{}, @P{}, N'all update old') ",
                    p,
                    p + 1
                );
                p += 2;
            }
            DataQueryMode::Direct => {
                let _ = write!(
                    sql,
                    "FROM {db}.cdc.{} ",
                    quote_identifier(&table.change_table_name())
                );
            }
        }

        let _ = write!(
            sql,
            "WHERE (([__$start_lsn] = @P{} AND [__$seqval] = @P{} AND [__$operation] > @P{}) \
             OR ([__$start_lsn] = @P{} AND [__$seqval] > @P{}) \
             OR ([__$start_lsn] > @P{})) AND [__$start_lsn] <= @P{} ",
            p,
            p + 1,
            p + 2,
            p + 3,
            p + 4,
            p + 5,
            p + 6
        );

        if !self.excluded_operations.is_empty() {
            let ranks = self
                .excluded_operations
                .iter()
                .map(|r| r.to_string())
                .collect::<Vec<_>>()
                .join(",");
            let _ = write!(sql, "AND [__$operation] NOT IN ({}) ", ranks);
        }

        sql.push_str(match self.mode {
            DataQueryMode::Function => {
                "ORDER BY [__$start_lsn] ASC, [__$seqval] ASC, [__$operation] ASC"
            }
            DataQueryMode::Direct => {
                "ORDER BY [__$start_lsn] ASC, [__$command_id] ASC, [__$seqval] ASC, [__$operation] ASC"
            }
        });
        sql
    }

    /// Parameters in placeholder order.
    pub fn params(&self) -> Vec<QueryParam> {
        let mut params = Vec::with_capacity(9);
        if self.mode == DataQueryMode::Function {
            params.push(QueryParam::Lsn(self.from_lsn));
            params.push(QueryParam::Lsn(self.to_lsn));
        }
        params.extend([
            QueryParam::Lsn(self.from_lsn),
            QueryParam::Lsn(self.from_seqval),
            QueryParam::Int(self.from_operation),
            QueryParam::Lsn(self.from_lsn),
            QueryParam::Lsn(self.from_seqval),
            QueryParam::Lsn(self.from_lsn),
            QueryParam::Lsn(self.to_lsn),
        ]);
        params
    }
}

/// `[name]` with closing brackets escaped.
pub fn quote_identifier(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}
