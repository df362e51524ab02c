//! End-to-end ring scenarios over real kernel objects

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use arrow::array::{Float64Array, Int64Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use std::sync::Arc;

use qads::{Arena, ArenaError, BatchStream};

fn unique(tag: &str) -> String {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    format!(
        "scenario_{tag}_{}_{}",
        std::process::id(),
        SEQ.fetch_add(1, Ordering::Relaxed)
    )
}

fn wide_batch(rows: usize) -> RecordBatch {
    let schema = Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("v", DataType::Float64, false),
    ]));
    let ids = Int64Array::from_iter_values(0..rows as i64);
    let vs = Float64Array::from_iter_values((0..rows).map(|i| i as f64 * 0.5));
    RecordBatch::try_new(schema, vec![Arc::new(ids), Arc::new(vs)]).unwrap()
}

fn seq_batch(seq: i64) -> RecordBatch {
    let schema = Arc::new(Schema::new(vec![Field::new("seq", DataType::Int64, false)]));
    RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(vec![seq]))]).unwrap()
}

fn seq_of(batch: &RecordBatch) -> i64 {
    batch
        .column(0)
        .as_any()
        .downcast_ref::<Int64Array>()
        .unwrap()
        .value(0)
}

#[test]
fn single_batch_round_trip() {
    let name = unique("t1");
    let producer = Arena::attach_producer(&name, 4 * 1024 * 1024, 3).unwrap();
    let batch = wide_batch(10);
    producer.produce(&batch).unwrap();

    let consumer = Arena::attach_consumer(&name).unwrap();
    let got = consumer.consume(Some(Duration::from_millis(1000))).unwrap();
    assert_eq!(got.num_rows(), 10);
    assert_eq!(got, batch);

    let produced = producer.stats();
    assert_eq!(produced.writes_count, 1);
    assert!(produced.bytes_written > 0);

    let consumed = consumer.stats();
    assert_eq!(consumed.reads_count, 1);
    assert_eq!(consumed.wait_timeouts, 0);
    assert_eq!(consumed.bytes_read, produced.bytes_written);
}

#[test]
fn ring_full_blocks_producer() {
    let name = unique("full");
    let producer = Arena::attach_producer(&name, 4 * 1024 * 1024, 2).unwrap();

    let writer = thread::spawn(move || {
        for i in 0..3 {
            producer.produce(&seq_batch(i)).unwrap();
        }
        producer
    });

    // Give the writer time to fill both slots and block on the third.
    thread::sleep(Duration::from_millis(300));
    assert!(!writer.is_finished());

    let consumer = Arena::attach_consumer(&name).unwrap();
    let first = consumer.consume(Some(Duration::from_millis(500))).unwrap();
    assert_eq!(seq_of(&first), 0);

    let producer = writer.join().unwrap();
    assert_eq!(producer.write_sequence(), 3);

    for expected in 1..3 {
        let batch = consumer.consume(Some(Duration::from_millis(500))).unwrap();
        assert_eq!(seq_of(&batch), expected);
    }
}

#[test]
fn consumer_timeout_then_delivery() {
    let name = unique("t3");
    let producer = Arena::attach_producer(&name, 4 * 1024 * 1024, 3).unwrap();
    let consumer = Arena::attach_consumer(&name).unwrap();

    let err = consumer
        .consume(Some(Duration::from_millis(100)))
        .unwrap_err();
    assert!(matches!(err, ArenaError::Timeout));
    assert_eq!(consumer.stats().wait_timeouts, 1);

    producer.produce(&wide_batch(4)).unwrap();
    let got = consumer.consume(Some(Duration::from_millis(1000))).unwrap();
    assert_eq!(got.num_rows(), 4);
    assert_eq!(consumer.stats().reads_count, 1);
}

#[test]
fn two_consumers_split_the_stream() {
    let name = unique("split");
    let producer = Arena::attach_producer(&name, 4 * 1024 * 1024, 4).unwrap();
    let consumer_a = Arena::attach_consumer(&name).unwrap();
    let consumer_b = Arena::attach_consumer(&name).unwrap();

    let writer = thread::spawn(move || {
        for seq in 0..10 {
            producer.produce(&seq_batch(seq)).unwrap();
        }
        producer
    });

    let drain = |consumer: Arena| {
        thread::spawn(move || {
            let mut seen = Vec::new();
            loop {
                match consumer.consume(Some(Duration::from_millis(1000))) {
                    Ok(batch) => seen.push(seq_of(&batch)),
                    Err(ArenaError::Timeout) => return seen,
                    Err(e) => panic!("unexpected consume error: {e}"),
                }
            }
        })
    };

    let handle_a = drain(consumer_a);
    let handle_b = drain(consumer_b);
    let _producer = writer.join().unwrap();

    let seen_a = handle_a.join().unwrap();
    let seen_b = handle_b.join().unwrap();

    let mut all: Vec<i64> = seen_a.iter().chain(seen_b.iter()).copied().collect();
    all.sort_unstable();
    assert_eq!(all, (0..10).collect::<Vec<_>>(), "duplicates or losses");

    let union: BTreeSet<i64> = all.into_iter().collect();
    assert_eq!(union.len(), 10);
}

#[test]
fn oversize_batch_rejected_without_advancing() {
    let name = unique("t5");
    // Smallest accepted region: two slots of under 2 KiB each.
    let producer = Arena::attach_producer(&name, 4096, 2).unwrap();
    let capacity = producer.geometry().buffer_size;
    assert!(capacity < 2048);

    match producer.produce(&wide_batch(4096)).unwrap_err() {
        ArenaError::PayloadTooLarge { size, capacity: cap } => {
            assert_eq!(cap, capacity);
            assert!(size > cap, "rejecting size {size} must exceed {cap}");
        }
        other => panic!("expected PayloadTooLarge, got {other:?}"),
    }
    assert_eq!(producer.write_sequence(), 0);
    assert_eq!(producer.stats().writes_count, 0);

    // A batch that fits lands in slot 0 as if the failure never happened.
    producer.produce(&seq_batch(42)).unwrap();
    assert_eq!(producer.write_sequence(), 1);

    let consumer = Arena::attach_consumer(&name).unwrap();
    let got = consumer.consume(Some(Duration::from_millis(500))).unwrap();
    assert_eq!(seq_of(&got), 42);
}

#[test]
fn wait_for_data_is_non_destructive() {
    let name = unique("probe");
    let producer = Arena::attach_producer(&name, 4 * 1024 * 1024, 3).unwrap();
    let consumer = Arena::attach_consumer(&name).unwrap();

    assert!(matches!(
        consumer.wait_for_data(Some(Duration::from_millis(50))),
        Err(ArenaError::Timeout)
    ));

    producer.produce(&seq_batch(7)).unwrap();
    consumer
        .wait_for_data(Some(Duration::from_millis(500)))
        .unwrap();
    // Sole consumer: the probe re-posted the token, so a poll must win it.
    let got = consumer.try_consume().unwrap();
    assert_eq!(seq_of(&got), 7);
}

#[test]
fn reader_count_returns_to_zero() {
    let name = unique("readers");
    let producer = Arena::attach_producer(&name, 4 * 1024 * 1024, 2).unwrap();

    let consumers: Vec<Arena> = (0..3)
        .map(|_| Arena::attach_consumer(&name).unwrap())
        .collect();
    assert_eq!(producer.reader_count(), 3);

    drop(consumers);
    assert_eq!(producer.reader_count(), 0);
}

#[test]
fn producer_close_releases_kernel_names() {
    let name = unique("reattach");
    let producer = Arena::attach_producer(&name, 4 * 1024 * 1024, 2).unwrap();
    drop(producer);

    // Region and semaphore names were unlinked; the name is reusable.
    let producer = Arena::attach_producer(&name, 4 * 1024 * 1024, 2).unwrap();
    producer.produce(&seq_batch(1)).unwrap();
}

#[test]
fn finish_flips_end_of_stream() {
    let name = unique("finish");
    let producer = Arena::attach_producer(&name, 4 * 1024 * 1024, 4).unwrap();
    let consumer = Arena::attach_consumer(&name).unwrap();

    for seq in 0..3 {
        producer.produce(&seq_batch(seq)).unwrap();
    }
    producer.finish().unwrap();
    assert!(!consumer.writer_active());

    let mut stream = BatchStream::new(consumer).unwrap();
    let mut seen = Vec::new();
    while let Some(batch) = stream.next_batch(Some(Duration::from_millis(100))).unwrap() {
        seen.push(seq_of(&batch));
    }
    assert_eq!(seen, vec![0, 1, 2]);
    assert!(stream.is_done());
}

#[test]
fn sequence_window_never_exceeds_ring_depth() {
    let name = unique("window");
    let depth = 3u64;
    let producer = Arena::attach_producer(&name, 4 * 1024 * 1024, depth as usize).unwrap();
    let consumer = Arena::attach_consumer(&name).unwrap();

    let writer = thread::spawn(move || {
        for seq in 0..50 {
            producer.produce(&seq_batch(seq)).unwrap();
        }
        producer
    });

    let mut received = 0;
    while received < 50 {
        let batch = consumer.consume(Some(Duration::from_millis(1000))).unwrap();
        assert_eq!(seq_of(&batch), received);
        received += 1;

        let write = consumer.write_sequence();
        let read = consumer.read_sequence();
        assert!(write >= read);
        assert!(write - read <= depth);
    }

    writer.join().unwrap();
}
