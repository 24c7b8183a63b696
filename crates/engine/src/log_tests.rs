// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use proptest::prelude::*;
use std::time::Duration;

fn recording(agg: &LogAggregator) -> Arc<Mutex<Vec<(LogStream, String)>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    agg.add_observer(move |stream, line| {
        sink.lock().unwrap().push((stream, line.to_string()));
    });
    seen
}

fn lines(seen: &Arc<Mutex<Vec<(LogStream, String)>>>) -> Vec<String> {
    seen.lock().unwrap().iter().map(|(_, l)| l.clone()).collect()
}

#[test]
fn direct_write_delivers_synchronously() {
    let agg = LogAggregator::new();
    let seen = recording(&agg);
    agg.write(LogStream::Stderr, "boom");
    assert_eq!(
        seen.lock().unwrap().as_slice(),
        &[(LogStream::Stderr, "boom".to_string())]
    );
    assert_eq!(agg.pending(), 0);
}

#[test]
fn writer_enqueues_until_dispatch() {
    let agg = LogAggregator::new();
    let seen = recording(&agg);
    let writer = agg.writer();

    writer.write(LogStream::Stdout, "a");
    writer.write(LogStream::Stdout, "b");
    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(agg.pending(), 2);

    assert_eq!(agg.dispatch(), 2);
    assert_eq!(lines(&seen), vec!["a", "b"]);
}

#[test]
fn dispatch_is_capped_per_pass() {
    let agg = LogAggregator::new();
    let seen = recording(&agg);
    let writer = agg.writer();
    for i in 0..(DISPATCH_BATCH + 5) {
        writer.write(LogStream::Stdout, i.to_string());
    }

    assert_eq!(agg.dispatch(), DISPATCH_BATCH);
    assert_eq!(agg.pending(), 5);
    assert_eq!(agg.dispatch(), 5);
    assert_eq!(agg.dispatch(), 0);
    assert_eq!(seen.lock().unwrap().len(), DISPATCH_BATCH + 5);
}

#[test]
fn observers_run_in_registration_order() {
    let agg = LogAggregator::new();
    let order = Arc::new(Mutex::new(Vec::new()));
    for tag in ["first", "second", "third"] {
        let order = Arc::clone(&order);
        agg.add_observer(move |_, _| order.lock().unwrap().push(tag));
    }
    agg.write(LogStream::Stdout, "x");
    assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
}

#[test]
fn removed_observer_stops_receiving() {
    let agg = LogAggregator::new();
    let seen = Arc::new(Mutex::new(0));
    let counter = Arc::clone(&seen);
    let id = agg.add_observer(move |_, _| *counter.lock().unwrap() += 1);

    agg.write(LogStream::Stdout, "one");
    assert!(agg.remove_observer(id));
    assert!(!agg.remove_observer(id));
    agg.write(LogStream::Stdout, "two");
    assert_eq!(*seen.lock().unwrap(), 1);
}

#[test]
fn observer_ids_are_never_reused() {
    let agg = LogAggregator::new();
    let a = agg.add_observer(|_, _| {});
    agg.remove_observer(a);
    let b = agg.add_observer(|_, _| {});
    assert!(b > a);
}

#[tokio::test]
async fn ready_wakes_after_background_write() {
    let agg = LogAggregator::new();
    let seen = recording(&agg);
    let writer = agg.writer();

    tokio::spawn(async move {
        writer.write(LogStream::Stdout, "from task");
    });

    tokio::time::timeout(Duration::from_secs(1), agg.ready())
        .await
        .unwrap();
    agg.flush();
    assert_eq!(lines(&seen), vec!["from task"]);
}

#[tokio::test]
async fn remaining_entries_rearm_the_wakeup() {
    let agg = LogAggregator::new();
    let writer = agg.writer();
    for i in 0..(DISPATCH_BATCH * 2) {
        writer.write(LogStream::Stdout, i.to_string());
    }

    agg.ready().await;
    assert_eq!(agg.dispatch(), DISPATCH_BATCH);
    tokio::time::timeout(Duration::from_secs(1), agg.ready())
        .await
        .unwrap();
    assert_eq!(agg.dispatch(), DISPATCH_BATCH);
}

#[test]
fn concurrent_producers_keep_per_producer_order() {
    let agg = LogAggregator::new();
    let seen = recording(&agg);

    let handles: Vec<_> = ["out", "err"]
        .into_iter()
        .map(|tag| {
            let writer = agg.writer();
            std::thread::spawn(move || {
                for i in 0..100 {
                    writer.write(LogStream::Stdout, format!("{tag}-{i}"));
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    agg.flush();

    let all = lines(&seen);
    assert_eq!(all.len(), 200);
    for tag in ["out", "err"] {
        let mine: Vec<usize> = all
            .iter()
            .filter_map(|l| l.strip_prefix(&format!("{tag}-")).map(|n| n.parse().unwrap()))
            .collect();
        assert_eq!(mine, (0..100).collect::<Vec<_>>());
    }
}

proptest! {
    #[test]
    fn single_producer_lines_arrive_once_in_order(
        messages in proptest::collection::vec("[a-z]{0,8}", 0..60),
        passes in 1usize..4,
    ) {
        let agg = LogAggregator::new();
        let seen = recording(&agg);
        let writer = agg.writer();

        for (i, m) in messages.iter().enumerate() {
            writer.write(LogStream::Stdout, m.clone());
            if i % passes == 0 {
                agg.dispatch();
            }
        }
        agg.flush();

        prop_assert_eq!(lines(&seen), messages);
    }
}
