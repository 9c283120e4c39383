// Copyright 2023 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use std::sync::Arc;
use std::time::Duration;

use perfcommon_recorder::{DoubleIntervalRecorder, IntervalRecorder};
use rand::Rng;

const WRITERS: usize = 2;
const RECORDS_PER_WRITER: u64 = 200_000;

// every record call that returned before a snapshot was requested must land
// in exactly one snapshot
#[test]
fn concurrent_snapshots_account_for_every_record() {
    let recorder = Arc::new(IntervalRecorder::with_max(3_600_000_000, 3).unwrap());

    let writers: Vec<_> = (0..WRITERS)
        .map(|_| {
            let recorder = recorder.clone();
            std::thread::spawn(move || {
                for _ in 0..RECORDS_PER_WRITER {
                    recorder.record(42).unwrap();
                }
            })
        })
        .collect();

    let mut total = 0;
    let mut count_at_42 = 0;
    for _ in 0..5 {
        std::thread::sleep(Duration::from_millis(2));
        let snapshot = recorder.interval_histogram();
        total += snapshot.total_count();
        count_at_42 += snapshot.count_at(42).unwrap();
    }

    for writer in writers {
        writer.join().unwrap();
    }

    let last = recorder.interval_histogram();
    total += last.total_count();
    count_at_42 += last.count_at(42).unwrap();

    let expected = WRITERS as u64 * RECORDS_PER_WRITER;
    assert_eq!(total, expected);
    assert_eq!(count_at_42, expected);

    // nothing left behind in either buffer
    assert_eq!(recorder.interval_histogram().total_count(), 0);
    assert_eq!(recorder.interval_histogram().total_count(), 0);
}

#[test]
fn recycling_under_concurrency_loses_nothing() {
    let recorder = Arc::new(IntervalRecorder::with_max(1_000_000, 3).unwrap());

    let writers: Vec<_> = (0..WRITERS)
        .map(|seed| {
            let recorder = recorder.clone();
            std::thread::spawn(move || {
                let mut rng = rand::thread_rng();
                let mut recorded = 0_u64;
                for _ in 0..RECORDS_PER_WRITER {
                    let value = rng.gen_range(1..1_000_000);
                    recorder.record(value).unwrap();
                    recorded += 1;
                }
                // stagger completion a little between writers
                std::thread::sleep(Duration::from_millis(seed as u64));
                recorded
            })
        })
        .collect();

    let mut total = 0;
    let mut recycle = recorder.interval_histogram();
    for _ in 0..10 {
        std::thread::sleep(Duration::from_millis(1));
        total += recycle.total_count();
        recycle = recorder.interval_histogram_recycling(recycle).unwrap();
    }
    total += recycle.total_count();

    let mut expected = 0;
    for writer in writers {
        expected += writer.join().unwrap();
    }

    let last = recorder.interval_histogram();
    total += last.total_count();
    assert_eq!(total, expected);
}

#[test]
fn double_recorder_accounts_for_every_record() {
    let recorder = Arc::new(DoubleIntervalRecorder::with_ratio(1 << 40, 2).unwrap());

    let writers: Vec<_> = (0..WRITERS)
        .map(|_| {
            let recorder = recorder.clone();
            std::thread::spawn(move || {
                let mut rng = rand::thread_rng();
                for _ in 0..(RECORDS_PER_WRITER / 10) {
                    let value = rng.gen_range(0.5_f64..500.0);
                    recorder.record(value).unwrap();
                }
            })
        })
        .collect();

    let mut total = 0;
    for _ in 0..5 {
        std::thread::sleep(Duration::from_millis(2));
        total += recorder.interval_histogram().total_count();
    }

    for writer in writers {
        writer.join().unwrap();
    }

    total += recorder.interval_histogram().total_count();
    assert_eq!(total, WRITERS as u64 * (RECORDS_PER_WRITER / 10));
}

// a snapshot and the live histogram never double-count: draining the
// recorder right after a snapshot returns only what was recorded after it
#[test]
fn snapshot_and_live_histogram_are_disjoint() {
    let recorder = IntervalRecorder::with_max(1_000_000, 3).unwrap();
    recorder.record(5).unwrap();
    recorder.record(6).unwrap();

    let snapshot = recorder.interval_histogram();
    recorder.record(7).unwrap();
    let rest = recorder.interval_histogram();

    assert_eq!(snapshot.total_count(), 2);
    assert_eq!(rest.total_count(), 1);
    assert_eq!(snapshot.count_at(7).unwrap(), 0);
    assert_eq!(rest.count_at(5).unwrap(), 0);
}
