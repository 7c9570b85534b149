//! Workload driver for the doc-op execution core.
//!
//! Seeds an in-memory tablet store, runs a partition fan-out scan through a
//! real read doc-op, then drives a pair of writes (the second a deliberate
//! duplicate) to show the error taxonomy. Useful for eyeballing dispatch
//! behavior with `RUST_LOG=debug`.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use rand::Rng;
use tracing::info;
use tracing_subscriber::EnvFilter;

use keel_gate::{ExecFlags, ReadDocOp, WriteDocOp};
use keel_store::descriptor::TableDescriptor;
use keel_store::mem::{decode_rows, MemSession, MemTabletStore};
use keel_store::op::WriteOp;
use keel_store::request::{Datum, Expression, WriteKind, WriteRequest};
use keel_store::session::StorageSession;

const ORDERS_TABLE_ID: u64 = 100;

#[derive(Parser, Debug)]
#[command(
    name = "keel-workload",
    about = "Exercise the doc-op execution core against an in-memory tablet store"
)]
struct Args {
    /// Distinct values of the hash column to seed and scan.
    #[arg(long, default_value_t = 4)]
    partitions: i64,

    /// Rows seeded per partition.
    #[arg(long, default_value_t = 250)]
    rows_per_partition: i64,

    /// Per-request prefetch cap used by the scan.
    #[arg(long, default_value_t = 64)]
    prefetch_limit: u64,

    /// Scan in reverse order.
    #[arg(long)]
    backward: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let descriptor = TableDescriptor::new(ORDERS_TABLE_ID, "orders", 1, 2, 1);
    let store = MemTabletStore::new();
    store.create_table(&descriptor);

    let mut rng = rand::rng();
    for partition in 0..args.partitions {
        store.seed_rows(
            ORDERS_TABLE_ID,
            (0..args.rows_per_partition).map(|seq| {
                vec![
                    Datum::Int64(partition),
                    Datum::Int64(seq),
                    Datum::Int64(rng.random_range(100..100_000)),
                    Datum::Text("seeded".to_string()),
                ]
            }),
        );
    }
    info!(
        partitions = args.partitions,
        rows = store.row_count(ORDERS_TABLE_ID),
        "seeded tablet store"
    );

    let flags = ExecFlags {
        prefetch_limit: args.prefetch_limit,
        ..ExecFlags::from_env()
    };

    let session = MemSession::new(Arc::clone(&store));
    let scan = ReadDocOp::with_flags(session, Arc::new(descriptor.clone()), flags);
    scan.with_template(|template| {
        template.partition_column_values = vec![Expression::in_list(
            0,
            (0..args.partitions).map(Datum::Int64).collect(),
        )];
        template.is_forward_scan = !args.backward;
    });

    let started = Instant::now();
    scan.execute().context("start scan")?;
    let mut scanned_rows = 0usize;
    let mut blobs = 0usize;
    while !scan.end_of_result().context("check scan progress")? {
        if let Some(blob) = scan.fetch().context("fetch scan page")? {
            scanned_rows += decode_rows(&blob).context("decode scan page")?.len();
            blobs += 1;
        }
    }
    let elapsed = started.elapsed();

    let snapshot = scan.metrics().snapshot();
    println!(
        "scan: {scanned_rows} rows in {blobs} blobs over {} round trips ({elapsed:?})",
        snapshot.flushes_issued
    );
    println!(
        "scan dispatch: {} sub-requests applied, {} blobs cached",
        snapshot.sub_requests_applied, snapshot.rows_blobs_cached
    );

    // One clean insert, then the same key again to show the duplicate path.
    let session = MemSession::new(Arc::clone(&store));
    let fresh_row = vec![
        Datum::Int64(0),
        Datum::Int64(args.rows_per_partition + 1),
        Datum::Int64(0),
        Datum::Text("inserted".to_string()),
    ];
    let insert = WriteOp::new(WriteRequest::new(
        ORDERS_TABLE_ID,
        WriteKind::Insert,
        fresh_row.clone(),
    ));
    let write = WriteDocOp::with_flags(session.clone() as Arc<dyn StorageSession>, insert, flags);
    write.execute().context("start insert")?;
    while !write.end_of_result().context("check insert progress")? {
        write.fetch().context("drive insert")?;
    }
    println!("insert: {} row(s) affected", write.rows_affected_count());

    let duplicate = WriteOp::new(WriteRequest::new(
        ORDERS_TABLE_ID,
        WriteKind::Insert,
        fresh_row,
    ));
    let write = WriteDocOp::with_flags(session, duplicate, flags);
    write.execute().context("start duplicate insert")?;
    match write.fetch() {
        Err(err) => println!(
            "duplicate insert rejected: {err} (sqlstate {})",
            err.pg_error_code().map(|code| code.sqlstate()).unwrap_or("?????")
        ),
        Ok(_) => anyhow::bail!("duplicate insert unexpectedly succeeded"),
    }

    Ok(())
}
