//! Live SQL Server tests
//!
//! Require a CDC-enabled database; run with
//! `SLUICE_MSSQL_HOST=... SLUICE_MSSQL_PASSWORD=... cargo test --features sqlserver -- --ignored`.
//! The database must contain a captured `dbo.orders(id int primary key, name nvarchar(50))`.

#![cfg(feature = "sqlserver")]

mod harness;

use harness::*;
use sluice_cdc::common::{ChangeEventQueue, EventDispatcher, HistorizedSchema};
use sluice_cdc::sqlserver::{
    ChangeLog, PositionLedger, SqlServerChangeLog, SqlServerConnectorConfig,
    SqlServerStreamingSource,
};
use std::sync::Arc;

fn live_config() -> Option<SqlServerConnectorConfig> {
    let host = std::env::var("SLUICE_MSSQL_HOST").ok()?;
    let password = std::env::var("SLUICE_MSSQL_PASSWORD").ok()?;
    let database = std::env::var("SLUICE_MSSQL_DATABASE").unwrap_or_else(|_| "testdb".into());
    SqlServerConnectorConfig::builder()
        .topic_prefix("live")
        .host(host)
        .username(std::env::var("SLUICE_MSSQL_USER").unwrap_or_else(|_| "sa".into()))
        .password(password)
        .database(database)
        .trust_server_certificate(true)
        .build()
        .ok()
}

#[tokio::test]
#[ignore = "requires a live SQL Server with CDC enabled"]
async fn test_live_discovery_and_bounds() -> anyhow::Result<()> {
    init_test_logging();
    let Some(config) = live_config() else {
        return Ok(());
    };
    let database = config.database_names[0].clone();
    let log = Arc::new(SqlServerChangeLog::connect(&config).await?);
    assert!(log.is_agent_running(&database).await?);

    let ledger = PositionLedger::new(log.clone());
    let tables = ledger.discover_change_tables(&database, None).await?;
    assert!(!tables.is_empty());
    let max = ledger.max_position(&database).await?;
    for table in &tables {
        assert!(table.start_lsn <= max);
        assert!(!table.captured_columns.is_empty());
    }
    Ok(())
}

#[tokio::test]
#[ignore = "requires a live SQL Server with CDC enabled"]
async fn test_live_poll_is_idle_without_changes() -> anyhow::Result<()> {
    init_test_logging();
    let Some(config) = live_config() else {
        return Ok(());
    };
    let log = Arc::new(SqlServerChangeLog::connect(&config).await?);
    let (queue, mut consumer) = ChangeEventQueue::new(config.connector.max_queue_size);
    let dispatcher = EventDispatcher::builder(
        config.connector.clone(),
        Arc::new(HistorizedSchema::new()),
        queue,
    )
    .build()?;
    let source = SqlServerStreamingSource::new(config, log, Arc::new(dispatcher))?;

    // first poll only publishes the captured tables' structure
    assert_eq!(source.poll_once().await?, 0);
    assert!(consumer
        .drain()
        .iter()
        .all(|record| record.operation().is_none()));
    Ok(())
}
