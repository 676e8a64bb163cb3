//! SQL Server TDS change log
//!
//! [`SqlServerChangeLog`] answers [`ChangeLog`] queries over one Tiberius
//! connection. Every query names its database explicitly (`[db].cdc...`),
//! so one connection serves all captured databases of the server.

use super::change_table::{CapturedColumn, ChangeRow, ChangeTable, ChangeTableEntry};
use super::config::SqlServerConnectorConfig;
use super::error::{SqlServerError, INVALID_OBJECT_NAME};
use super::log::{ChangeLog, ChangeRowStream};
use super::lsn::Lsn;
use super::query::{quote_identifier, ChangesQuery, QueryParam};
use crate::common::{CdcError, ColumnDefinition, DataCollectionSchema, Result};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::time::Duration;
use tiberius::{AuthMethod, Client, Config, EncryptionLevel, Row, ToSql};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info, trace};

/// Number of CDC metadata columns selected ahead of the captured columns.
const METADATA_COLUMNS: usize = 4;

/// [`ChangeLog`] backed by a live SQL Server.
pub struct SqlServerChangeLog {
    client: Mutex<Client<Compat<TcpStream>>>,
    server: String,
}

impl std::fmt::Debug for SqlServerChangeLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlServerChangeLog")
            .field("server", &self.server)
            .finish_non_exhaustive()
    }
}

impl SqlServerChangeLog {
    /// Connect and verify CDC is enabled on every configured database.
    pub async fn connect(config: &SqlServerConnectorConfig) -> Result<Self> {
        let database = config
            .database_names
            .first()
            .ok_or_else(|| CdcError::config("At least one database is required"))?;
        debug!(
            connection = %config.redacted_connection_string(database),
            "Connecting to SQL Server"
        );

        let mut tds = Config::new();
        tds.host(&config.host);
        tds.port(config.port);
        tds.database(database);
        tds.application_name(&config.application_name);

        let password = config.password.as_deref().ok_or_else(|| {
            CdcError::config("Password is required for SQL Server authentication")
        })?;
        tds.authentication(AuthMethod::sql_server(&config.username, password));

        if config.encrypt {
            tds.encryption(EncryptionLevel::Required);
            if config.trust_server_certificate {
                tds.trust_cert();
            }
        } else {
            tds.encryption(EncryptionLevel::NotSupported);
        }

        let timeout = Duration::from_secs(config.connect_timeout_secs);
        let tcp = tokio::time::timeout(timeout, TcpStream::connect(tds.get_addr()))
            .await
            .map_err(|_| {
                SqlServerError::Connection(format!(
                    "Timed out connecting to {}:{} after {:?}",
                    config.host, config.port, timeout
                ))
            })?
            .map_err(|e| SqlServerError::Connection(e.to_string()))?;
        tcp.set_nodelay(true)
            .map_err(|e| SqlServerError::Connection(e.to_string()))?;

        let client = Client::connect(tds, tcp.compat_write())
            .await
            .map_err(|e| match e {
                tiberius::error::Error::Server(ref token) if token.code() == 18456 => {
                    SqlServerError::Authentication(token.message().to_string())
                }
                other => SqlServerError::Tds(other.to_string()),
            })?;

        info!(host = %config.host, port = config.port, "Connected to SQL Server");

        let log = Self {
            client: Mutex::new(client),
            server: format!("{}:{}", config.host, config.port),
        };
        for database in &config.database_names {
            log.verify_cdc_enabled(database).await?;
        }
        Ok(log)
    }

    /// Fail unless CDC is enabled on `database`.
    pub async fn verify_cdc_enabled(&self, database: &str) -> Result<()> {
        let rows = self
            .query(
                "SELECT is_cdc_enabled FROM sys.databases WHERE name = @P1",
                &[&database],
            )
            .await?;
        let enabled = rows
            .first()
            .and_then(|row| row.try_get::<bool, _>(0).ok().flatten())
            .unwrap_or(false);
        if !enabled {
            return Err(SqlServerError::CdcNotEnabled(database.to_string()).into());
        }
        debug!(database, "CDC is enabled");
        Ok(())
    }

    async fn query(&self, sql: &str, params: &[&dyn ToSql]) -> Result<Vec<Row>> {
        trace!(sql, "Executing query");
        let mut client = self.client.lock().await;
        let rows = client
            .query(sql, params)
            .await
            .map_err(query_error)?
            .into_first_result()
            .await
            .map_err(query_error)?;
        Ok(rows)
    }

    /// Single LSN-valued result, NULL when the query yields nothing.
    async fn query_lsn(&self, sql: &str, params: &[&dyn ToSql]) -> Result<Lsn> {
        let rows = self.query(sql, params).await?;
        match rows.first() {
            Some(row) => lsn_column(row, 0),
            None => Ok(Lsn::NULL),
        }
    }
}

#[async_trait]
impl ChangeLog for SqlServerChangeLog {
    async fn max_lsn(&self, database: &str) -> Result<Lsn> {
        let sql = format!("SELECT {}.sys.fn_cdc_get_max_lsn()", quote_identifier(database));
        self.query_lsn(&sql, &[]).await
    }

    async fn min_lsn(&self, database: &str, capture_instance: &str) -> Result<Lsn> {
        let sql = format!("SELECT {}.sys.fn_cdc_get_min_lsn(@P1)", quote_identifier(database));
        self.query_lsn(&sql, &[&capture_instance]).await
    }

    async fn increment_lsn(&self, database: &str, lsn: &Lsn) -> Result<Lsn> {
        let Some(bytes) = lsn.as_bytes() else {
            return Ok(Lsn::NULL);
        };
        let sql = format!(
            "SELECT {}.sys.fn_cdc_increment_lsn(@P1)",
            quote_identifier(database)
        );
        self.query_lsn(&sql, &[&&bytes[..]]).await
    }

    async fn max_transaction_lsn(&self, database: &str) -> Result<Lsn> {
        let sql = format!(
            "SELECT MAX(start_lsn) FROM {}.cdc.lsn_time_mapping WHERE tran_id <> 0x00",
            quote_identifier(database)
        );
        self.query_lsn(&sql, &[]).await
    }

    async fn nth_transaction_lsn_from_beginning(&self, database: &str, n: u32) -> Result<Lsn> {
        let sql = format!(
            "SELECT MAX(start_lsn) FROM (SELECT TOP (@P1) start_lsn FROM {}.cdc.lsn_time_mapping \
             WHERE tran_id <> 0x00 ORDER BY start_lsn) AS nth",
            quote_identifier(database)
        );
        let top = i64::from(n);
        self.query_lsn(&sql, &[&top]).await
    }

    async fn nth_transaction_lsn_from_last(
        &self,
        database: &str,
        last: &Lsn,
        n: u32,
    ) -> Result<Lsn> {
        let Some(bytes) = last.as_bytes() else {
            return Ok(Lsn::NULL);
        };
        let sql = format!(
            "SELECT MAX(start_lsn) FROM (SELECT TOP (@P1) start_lsn FROM {}.cdc.lsn_time_mapping \
             WHERE tran_id <> 0x00 AND start_lsn >= @P2 ORDER BY start_lsn) AS nth",
            quote_identifier(database)
        );
        let top = i64::from(n) + 1;
        self.query_lsn(&sql, &[&top, &&bytes[..]]).await
    }

    async fn min_change_table_lsn(&self, database: &str) -> Result<Lsn> {
        let sql = format!(
            "SELECT MIN(start_lsn) FROM {}.cdc.change_tables",
            quote_identifier(database)
        );
        self.query_lsn(&sql, &[]).await
    }

    async fn change_table_entries(&self, database: &str) -> Result<Vec<ChangeTableEntry>> {
        let db = quote_identifier(database);
        let sql = format!(
            "SELECT s.name, t.name, ct.capture_instance, ct.object_id, ct.source_object_id, \
             ct.start_lsn, ct.create_date \
             FROM {db}.cdc.change_tables ct \
             JOIN {db}.sys.tables t ON ct.source_object_id = t.object_id \
             JOIN {db}.sys.schemas s ON t.schema_id = s.schema_id"
        );
        let rows = self.query(&sql, &[]).await?;
        let mut entries = Vec::with_capacity(rows.len());
        for row in &rows {
            entries.push(ChangeTableEntry {
                database: database.to_string(),
                source_schema: string_column(row, 0)?,
                source_table: string_column(row, 1)?,
                capture_instance: string_column(row, 2)?,
                object_id: int_column(row, 3)?,
                source_object_id: int_column(row, 4)?,
                start_lsn: lsn_column(row, 5)?,
                create_date: row
                    .try_get::<chrono::NaiveDateTime, _>(6)
                    .map_err(query_error)?
                    .map(|t| t.and_utc())
                    .unwrap_or_else(Utc::now),
            });
        }
        debug!(database, change_tables = entries.len(), "Read change tables");
        Ok(entries)
    }

    async fn captured_columns(&self, database: &str) -> Result<Vec<CapturedColumn>> {
        let sql = format!(
            "SELECT object_id, column_name, column_ordinal FROM {}.cdc.captured_columns \
             ORDER BY object_id, column_ordinal",
            quote_identifier(database)
        );
        let rows = self.query(&sql, &[]).await?;
        rows.iter()
            .map(|row| {
                Ok(CapturedColumn {
                    object_id: int_column(row, 0)?,
                    column_name: string_column(row, 1)?,
                    column_id: int_column(row, 2)?,
                })
            })
            .collect()
    }

    async fn table_schema(&self, table: &ChangeTable) -> Result<DataCollectionSchema> {
        let id = &table.source_table;
        let db = quote_identifier(&id.catalog);
        let object = format!(
            "{}.{}.{}",
            db,
            quote_identifier(&id.schema),
            quote_identifier(&id.table)
        );

        let columns_sql = format!(
            "SELECT c.name, ty.name, c.column_id, c.is_nullable \
             FROM {db}.sys.columns c \
             JOIN {db}.sys.types ty ON c.user_type_id = ty.user_type_id \
             WHERE c.object_id = OBJECT_ID(@P1) ORDER BY c.column_id"
        );
        let rows = self.query(&columns_sql, &[&object.as_str()]).await?;
        let mut columns = Vec::with_capacity(rows.len());
        for row in &rows {
            let position = int_column(row, 2)?;
            let column = ColumnDefinition::new(
                string_column(row, 0)?,
                string_column(row, 1)?,
                u32::try_from(position).unwrap_or_default(),
            );
            let nullable = row.try_get::<bool, _>(3).ok().flatten().unwrap_or(true);
            columns.push(if nullable { column } else { column.not_null() });
        }

        let key_sql = format!(
            "SELECT c.name \
             FROM {db}.sys.index_columns ic \
             JOIN {db}.sys.columns c ON ic.object_id = c.object_id AND ic.column_id = c.column_id \
             JOIN {db}.sys.indexes i ON ic.object_id = i.object_id AND ic.index_id = i.index_id \
             WHERE i.is_primary_key = 1 AND ic.object_id = OBJECT_ID(@P1) \
             ORDER BY ic.key_ordinal"
        );
        let key_columns = self
            .query(&key_sql, &[&object.as_str()])
            .await?
            .iter()
            .map(|row| string_column(row, 0))
            .collect::<Result<Vec<_>>>()?;

        Ok(DataCollectionSchema::new(id.clone(), columns, key_columns))
    }

    async fn is_agent_running(&self, _database: &str) -> Result<bool> {
        let rows = self
            .query(
                "SELECT CASE WHEN EXISTS (SELECT 1 FROM sys.dm_server_services \
                 WHERE servicename LIKE N'SQL Server Agent%' AND status = 4) \
                 THEN 1 ELSE 0 END",
                &[],
            )
            .await?;
        Ok(rows
            .first()
            .and_then(|row| row.try_get::<i32, _>(0).ok().flatten())
            .map_or(false, |running| running == 1))
    }

    async fn fetch_changes(
        &self,
        table: &ChangeTable,
        query: &ChangesQuery,
    ) -> Result<ChangeRowStream> {
        let params = query.params();
        if params
            .iter()
            .any(|p| matches!(p, QueryParam::Lsn(lsn) if !lsn.is_available()))
        {
            return Ok(stream::empty().boxed());
        }

        let sql = query.to_sql(&table.source_table.catalog, table);
        let bytes: Vec<Vec<u8>> = params
            .iter()
            .filter_map(|p| match p {
                QueryParam::Lsn(lsn) => lsn.as_bytes().map(|b| b.to_vec()),
                QueryParam::Int(_) => None,
            })
            .collect();
        let ints: Vec<i32> = params
            .iter()
            .filter_map(|p| match p {
                QueryParam::Int(i) => Some(*i),
                QueryParam::Lsn(_) => None,
            })
            .collect();
        let (mut next_bytes, mut next_int) = (bytes.iter(), ints.iter());
        let mut bound: Vec<&dyn ToSql> = Vec::with_capacity(params.len());
        for param in &params {
            match param {
                QueryParam::Lsn(_) => {
                    if let Some(b) = next_bytes.next() {
                        bound.push(b);
                    }
                }
                QueryParam::Int(_) => {
                    if let Some(i) = next_int.next() {
                        bound.push(i);
                    }
                }
            }
        }

        let result = self.query(&sql, &bound).await;
        let rows = match result {
            Err(CdcError::ChangeTableGone { .. }) => {
                return Err(SqlServerError::ChangeTableGone(table.capture_instance.clone()).into())
            }
            other => other?,
        };

        let columns = table.captured_columns.len();
        let mut changes = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut change = ChangeRow {
                commit_lsn: lsn_column(row, 0)?,
                seqval: lsn_column(row, 1)?,
                operation: int_column(row, 2)?,
                update_mask: row
                    .try_get::<&[u8], _>(3)
                    .ok()
                    .flatten()
                    .map(<[u8]>::to_vec)
                    .unwrap_or_default(),
                command_id: 0,
                commit_time: None,
                values: (0..columns)
                    .map(|i| column_value(row, METADATA_COLUMNS + i))
                    .collect(),
            };
            change.commit_time = row
                .try_get::<DateTime<FixedOffset>, _>(METADATA_COLUMNS + columns)
                .ok()
                .flatten()
                .map(|t| t.with_timezone(&Utc));
            changes.push(change);
        }

        trace!(
            table = %table.change_table_name(),
            rows = changes.len(),
            "Fetched change rows"
        );
        Ok(stream::iter(changes.into_iter().map(Ok)).boxed())
    }
}

/// Map a Tiberius failure, recognizing dropped change tables.
fn query_error(e: tiberius::error::Error) -> CdcError {
    match e {
        tiberius::error::Error::Server(ref token) if token.code() == INVALID_OBJECT_NAME => {
            CdcError::change_table_gone(token.message())
        }
        other => SqlServerError::QueryFailed(other.to_string()).into(),
    }
}

fn lsn_column(row: &Row, index: usize) -> Result<Lsn> {
    let bytes = row.try_get::<&[u8], _>(index).map_err(query_error)?;
    Ok(Lsn::from_bytes(bytes)?)
}

fn string_column(row: &Row, index: usize) -> Result<String> {
    row.try_get::<&str, _>(index)
        .map_err(query_error)?
        .map(str::to_string)
        .ok_or_else(|| SqlServerError::QueryFailed(format!("NULL in column {}", index)).into())
}

fn int_column(row: &Row, index: usize) -> Result<i32> {
    if let Ok(Some(v)) = row.try_get::<i32, _>(index) {
        return Ok(v);
    }
    if let Ok(Some(v)) = row.try_get::<i16, _>(index) {
        return Ok(i32::from(v));
    }
    if let Ok(Some(v)) = row.try_get::<u8, _>(index) {
        return Ok(i32::from(v));
    }
    Err(SqlServerError::QueryFailed(format!("Expected an integer in column {}", index)).into())
}

/// Convert one column to JSON, binary as base64.
fn column_value(row: &Row, index: usize) -> Value {
    if index >= row.len() {
        return Value::Null;
    }
    if let Some(v) = row.try_get::<&str, _>(index).ok().flatten() {
        Value::String(v.to_string())
    } else if let Some(v) = row.try_get::<i64, _>(index).ok().flatten() {
        Value::Number(v.into())
    } else if let Some(v) = row.try_get::<i32, _>(index).ok().flatten() {
        Value::Number(v.into())
    } else if let Some(v) = row.try_get::<i16, _>(index).ok().flatten() {
        Value::Number(v.into())
    } else if let Some(v) = row.try_get::<u8, _>(index).ok().flatten() {
        Value::Number(v.into())
    } else if let Some(v) = row.try_get::<f64, _>(index).ok().flatten() {
        serde_json::Number::from_f64(v)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    } else if let Some(v) = row.try_get::<f32, _>(index).ok().flatten() {
        serde_json::Number::from_f64(f64::from(v))
            .map(Value::Number)
            .unwrap_or(Value::Null)
    } else if let Some(v) = row.try_get::<bool, _>(index).ok().flatten() {
        Value::Bool(v)
    } else if let Some(v) = row.try_get::<tiberius::numeric::Numeric, _>(index).ok().flatten() {
        Value::String(v.to_string())
    } else if let Some(v) = row.try_get::<&[u8], _>(index).ok().flatten() {
        Value::String(base64_encode(v))
    } else if let Some(v) = row.try_get::<DateTime<FixedOffset>, _>(index).ok().flatten() {
        Value::String(v.to_rfc3339())
    } else if let Some(v) = row.try_get::<chrono::NaiveDateTime, _>(index).ok().flatten() {
        Value::String(v.format("%Y-%m-%d %H:%M:%S%.f").to_string())
    } else if let Some(v) = row.try_get::<chrono::NaiveDate, _>(index).ok().flatten() {
        Value::String(v.format("%Y-%m-%d").to_string())
    } else if let Some(v) = row.try_get::<chrono::NaiveTime, _>(index).ok().flatten() {
        Value::String(v.format("%H:%M:%S%.f").to_string())
    } else if let Some(v) = row.try_get::<uuid::Uuid, _>(index).ok().flatten() {
        Value::String(v.to_string())
    } else {
        Value::Null
    }
}

fn base64_encode(data: &[u8]) -> String {
    use base64::{engine::general_purpose::STANDARD, Engine};
    STANDARD.encode(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base64_encode() {
        assert_eq!(base64_encode(b"hello world"), "aGVsbG8gd29ybGQ=");
    }

    #[tokio::test]
    async fn test_connect_requires_password() {
        let config = SqlServerConnectorConfig::builder()
            .topic_prefix("srv1")
            .database("testdb")
            .username("sa")
            .build()
            .unwrap();
        let err = SqlServerChangeLog::connect(&config).await.unwrap_err();
        assert!(matches!(err, CdcError::Config(_)));
    }
}
