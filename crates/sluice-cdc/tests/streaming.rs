//! SQL Server streaming source end to end over the in-memory change log

mod harness;

use harness::*;
use pretty_assertions::assert_eq;
use serde_json::json;
use sluice_cdc::common::{OffsetContext, Operation, NEW_KEY_HEADER};
use sluice_cdc::sqlserver::{RowOperation, SqlServerOffsetContext, TxLogPosition};
use sluice_cdc::{CdcSource, TaskState};
use std::time::Duration;

#[tokio::test]
async fn test_merges_tables_in_log_order() -> anyhow::Result<()> {
    init_test_logging();
    let log = orders_log();
    log.create_change_table(
        change_table_entry("customers", "dbo_customers", 1002, 502, 100),
        &["id", "email"],
    );
    log.register_schema(customers_schema());

    let (source, mut pipeline) = streaming_source(log.clone(), |b| b);
    assert_eq!(source.poll_once().await?, 0);
    // one CREATE schema change per captured table
    assert_eq!(pipeline.consumer.drain().len(), 2);

    write(&log, "dbo_orders", row(110, 2, RowOperation::Insert, 1, "o1"));
    write(&log, "dbo_customers", row(110, 1, RowOperation::Insert, 9, "c@x"));
    write(&log, "dbo_customers", row(120, 1, RowOperation::Delete, 9, "c@x"));
    write(&log, "dbo_orders", row(115, 1, RowOperation::Insert, 2, "o2"));

    assert_eq!(source.poll_once().await?, 4);
    let records = pipeline.consumer.drain();
    assert_eq!(
        after_images(&records),
        vec![
            json!({"id": 9, "email": "c@x"}),
            json!({"id": 1, "name": "o1"}),
            json!({"id": 2, "name": "o2"}),
            serde_json::Value::Null,
        ]
    );
    let last = records.last().unwrap();
    assert_eq!(last.operation(), Some(Operation::Delete));
    assert_eq!(last.value.as_ref().unwrap()["source"]["table"], "customers");
    assert_eq!(pipeline.listener.events(), 4);
    Ok(())
}

#[tokio::test]
async fn test_transaction_boundaries_and_serials() -> anyhow::Result<()> {
    let log = orders_log();
    let (source, mut pipeline) =
        streaming_source(log.clone(), |b| b.connector(|c| c.provide_transaction_metadata(true)));
    source.poll_once().await?;
    pipeline.consumer.drain();

    write(&log, "dbo_orders", row(110, 1, RowOperation::Insert, 1, "a"));
    write(&log, "dbo_orders", row(110, 2, RowOperation::Insert, 2, "b"));
    write(&log, "dbo_orders", row(120, 1, RowOperation::Insert, 3, "c"));
    assert_eq!(source.poll_once().await?, 3);

    let records = pipeline.consumer.drain();
    let shape: Vec<String> = records
        .iter()
        .map(|r| match r.operation() {
            Some(op) => op.to_string(),
            None => r.value.as_ref().unwrap()["status"]
                .as_str()
                .unwrap_or_default()
                .to_string(),
        })
        .collect();
    assert_eq!(shape, vec!["BEGIN", "CREATE", "CREATE", "END", "BEGIN", "CREATE", "END"]);
    assert!(records
        .iter()
        .filter(|r| r.operation().is_none())
        .all(|r| r.topic == "srv1.transaction"));

    let second = records[2].value.as_ref().unwrap();
    assert_eq!(second["transaction"]["total_order"], 2);
    assert_eq!(second["source"]["event_serial_no"], 1);
    assert_eq!(second["source"]["commit_lsn"], lsn(110).to_string());
    Ok(())
}

#[tokio::test]
async fn test_key_change_becomes_delete_and_create() -> anyhow::Result<()> {
    let log = orders_log();
    let (source, mut pipeline) =
        streaming_source(log.clone(), |b| b.connector(|c| c.emit_tombstones_on_delete(true)));
    source.poll_once().await?;
    pipeline.consumer.drain();

    write(&log, "dbo_orders", row(110, 1, RowOperation::UpdateBefore, 1, "a"));
    write(&log, "dbo_orders", row(110, 1, RowOperation::UpdateAfter, 5, "a"));
    assert_eq!(source.poll_once().await?, 1);

    let records = pipeline.consumer.drain();
    assert_eq!(records.len(), 3);
    assert_eq!(records[0].operation(), Some(Operation::Delete));
    assert_eq!(records[0].key, Some(json!({"id": 1})));
    assert_eq!(
        records[0].headers.last_with_name(NEW_KEY_HEADER),
        Some(&json!({"id": 5}))
    );
    assert!(records[1].value.is_none());
    assert_eq!(records[1].key, records[0].key);
    assert_eq!(records[2].operation(), Some(Operation::Create));
    assert_eq!(records[2].key, Some(json!({"id": 5})));
    Ok(())
}

#[tokio::test]
async fn test_bounded_iterations() -> anyhow::Result<()> {
    let log = orders_log();
    let (source, mut pipeline) =
        streaming_source(log.clone(), |b| b.max_transactions_per_iteration(1));
    source.poll_once().await?;
    pipeline.consumer.drain();

    for pos in [110, 120, 130] {
        write(&log, "dbo_orders", row(pos, 1, RowOperation::Insert, pos.into(), "x"));
    }
    assert_eq!(source.poll_once().await?, 2);
    assert_eq!(
        source.position(TEST_DB).await,
        Some(TxLogPosition::at_commit(lsn(120)))
    );
    assert_eq!(source.poll_once().await?, 1);
    assert_eq!(source.poll_once().await?, 0);
    assert_eq!(after_images(&pipeline.consumer.drain()).len(), 3);
    Ok(())
}

#[tokio::test]
async fn test_skipped_updates_never_read() -> anyhow::Result<()> {
    let log = orders_log();
    let (source, mut pipeline) =
        streaming_source(log.clone(), |b| b.skipped_operations([Operation::Update]));
    source.poll_once().await?;
    pipeline.consumer.drain();

    write(&log, "dbo_orders", row(110, 1, RowOperation::Insert, 1, "a"));
    write(&log, "dbo_orders", row(120, 1, RowOperation::UpdateBefore, 1, "a"));
    write(&log, "dbo_orders", row(120, 1, RowOperation::UpdateAfter, 1, "b"));
    assert_eq!(source.poll_once().await?, 1);
    assert_eq!(pipeline.dispatcher.stats().skipped(), 0);
    assert_eq!(source.position(TEST_DB).await.unwrap().commit_lsn, lsn(120));
    Ok(())
}

#[tokio::test]
async fn test_new_capture_instance_alters_schema() -> anyhow::Result<()> {
    let log = orders_log();
    let (source, mut pipeline) = streaming_source(log.clone(), |b| b);
    source.poll_once().await?;
    pipeline.consumer.drain();

    write(&log, "dbo_orders", row(110, 1, RowOperation::Insert, 1, "a"));
    log.create_change_table(
        change_table_entry("orders", "dbo_orders_v2", 1003, 501, 115),
        &["id", "name"],
    );
    write(&log, "dbo_orders_v2", row(120, 1, RowOperation::Insert, 2, "b"));
    // rows still captured by the old instance past the switch are ignored
    write(&log, "dbo_orders", row(120, 1, RowOperation::Insert, 2, "b"));

    assert_eq!(source.poll_once().await?, 2);
    let records = pipeline.consumer.drain();
    let schema_changes = records
        .iter()
        .filter(|r| r.operation().is_none())
        .count();
    assert_eq!(schema_changes, 1);
    assert_eq!(after_images(&records).len(), 2);
    assert_eq!(source.metrics().capture_instances, 2);
    Ok(())
}

#[tokio::test]
async fn test_stored_position_outside_log_fails() {
    let log = orders_log();
    let (source, _pipeline) = streaming_source(log.clone(), |b| b);
    let stored = SqlServerOffsetContext::new(SERVER, TEST_DB);
    stored.set_position(TxLogPosition::at_commit(lsn(50)), 0, 0);
    source.restore_offset(TEST_DB, &stored.offset()).await.unwrap();

    let err = source.poll_once().await.unwrap_err();
    assert!(matches!(err, sluice_cdc::CdcError::NotAvailable(_)));
}

#[tokio::test]
async fn test_background_loop_surfaces_fatal_cause() -> anyhow::Result<()> {
    init_test_logging();
    let log = orders_log();
    let (mut source, _pipeline) = streaming_source(log.clone(), |b| b);
    let stored = SqlServerOffsetContext::new(SERVER, TEST_DB);
    stored.set_position(TxLogPosition::at_commit(lsn(50)), 0, 0);
    source.restore_offset(TEST_DB, &stored.offset()).await?;

    source.start().await?;
    tokio::time::timeout(Duration::from_secs(5), async {
        while source.failure().is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;
    assert!(!source.is_healthy().await);
    assert!(source.failure().unwrap().contains(&lsn(50).to_string()));

    let err = source.stop().await.unwrap_err();
    assert_eq!(source.state(), TaskState::Stopped);
    let sluice_cdc::CdcError::EventProcessing { offset, source: cause } = &err else {
        panic!("unexpected error: {err}");
    };
    assert!(offset.contains(&lsn(50).to_string()));
    assert!(matches!(**cause, sluice_cdc::CdcError::NotAvailable(_)));
    assert!(err.to_string().starts_with("Error while processing event at offset"));

    // the cause is reported once
    assert!(source.failure().is_none());
    Ok(())
}

#[tokio::test]
async fn test_background_loop_recovers_from_read_failures() -> anyhow::Result<()> {
    init_test_logging();
    let log = orders_log();
    let (mut source, mut pipeline) = streaming_source(log.clone(), |b| b);
    source.start().await?;
    assert_eq!(source.state(), TaskState::Running);
    assert!(source.start().await.is_err());

    // schema change of the discovered table
    tokio::time::timeout(Duration::from_secs(5), pipeline.consumer.recv())
        .await?
        .unwrap();

    log.fail_next_reads(2);
    for id in 1..=3 {
        write(&log, "dbo_orders", row(100 + id * 10, 1, RowOperation::Insert, id.into(), "x"));
    }

    let mut received = Vec::new();
    while received.len() < 3 {
        let record = tokio::time::timeout(Duration::from_secs(5), pipeline.consumer.recv())
            .await?
            .unwrap();
        if record.operation().is_some() {
            received.push(record.key.unwrap());
        }
    }
    assert_eq!(received, vec![json!({"id": 1}), json!({"id": 2}), json!({"id": 3})]);
    assert!(source.metrics().read_failures >= 1);

    source.stop().await?;
    assert_eq!(source.state(), TaskState::Stopped);
    assert!(!source.is_healthy().await);
    Ok(())
}
