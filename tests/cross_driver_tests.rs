mod common;
use common::*;

use std::collections::HashSet;
use std::time::Duration;

use membound::record::U32TupleSerializer;
use membound::{
    Collector, CountingCollector, CrossDriver, IterSource, KvRecord, KvSerializer, LocalStrategy,
    MEGABYTE, OperatorError, Outcome, RecordSource, TaskConfig,
};

const ALL_STRATEGIES: [LocalStrategy; 4] = [
    LocalStrategy::StreamedOuterFirst,
    LocalStrategy::StreamedOuterSecond,
    LocalStrategy::BlockedOuterFirst,
    LocalStrategy::BlockedOuterSecond,
];

const CROSS_SEGMENT_SIZE: usize = 32 * 1024;

fn one_megabyte_env() -> TestEnv {
    TestEnv::new(MEGABYTE, CROSS_SEGMENT_SIZE)
}

fn count_pairs(
    env: &TestEnv,
    strategy: LocalStrategy,
    first: impl RecordSource<KvRecord>,
    second: impl RecordSource<KvRecord>,
) -> (Outcome<u64>, u64) {
    let driver = CrossDriver::new(
        TaskConfig::new(1).with_strategy(strategy),
        env.context(),
        KvSerializer,
        KvSerializer,
    );
    let mut out = CountingCollector::new();
    let outcome = driver
        .run(
            first,
            second,
            |_a: &KvRecord, _b: &KvRecord, out: &mut dyn Collector<()>| {
                out.collect(());
                Ok(())
            },
            &mut out,
        )
        .unwrap();
    (outcome.map(|stats| stats.invocations), out.count())
}

#[test]
fn test_every_strategy_calls_each_pair_once() {
    for strategy in ALL_STRATEGIES {
        let env = one_megabyte_env();
        let (outcome, emitted) = count_pairs(
            &env,
            strategy,
            UniformRecordGenerator::new(10, 1),
            UniformRecordGenerator::new(100, 4),
        );
        assert_eq!(outcome, Outcome::Completed(4000), "{strategy}");
        assert_eq!(emitted, 4000, "{strategy}");
        env.assert_released();
    }
}

#[test]
fn test_function_receives_first_then_second() {
    let first: Vec<KvRecord> = (0..7u8).map(|i| (vec![i], vec![b'f'])).collect();
    let second: Vec<(u32, u32)> = (0..13).map(|i| (i, i * 2)).collect();

    for strategy in ALL_STRATEGIES {
        let env = one_megabyte_env();
        let driver = CrossDriver::new(
            TaskConfig::new(1).with_strategy(strategy),
            env.context(),
            KvSerializer,
            U32TupleSerializer,
        );
        let mut pairs: Vec<(u8, u32)> = Vec::new();
        let outcome = driver
            .run(
                IterSource::new(first.clone()),
                IterSource::new(second.clone()),
                |a: &KvRecord, b: &(u32, u32), out: &mut dyn Collector<(u8, u32)>| {
                    assert_eq!(b.1, b.0 * 2);
                    out.collect((a.0[0], b.0));
                    Ok(())
                },
                &mut pairs,
            )
            .unwrap();
        assert!(!outcome.is_cancelled());

        let distinct: HashSet<_> = pairs.iter().copied().collect();
        assert_eq!(pairs.len(), 7 * 13, "{strategy}");
        assert_eq!(distinct.len(), 7 * 13, "{strategy}");
        env.assert_released();
    }
}

#[test]
fn test_empty_side_means_no_calls() {
    for strategy in ALL_STRATEGIES {
        let env = one_megabyte_env();
        let (outcome, emitted) = count_pairs(
            &env,
            strategy,
            UniformRecordGenerator::new(0, 1),
            UniformRecordGenerator::new(100, 4),
        );
        assert_eq!(outcome, Outcome::Completed(0), "{strategy}");
        assert_eq!(emitted, 0);

        let (outcome, emitted) = count_pairs(
            &env,
            strategy,
            UniformRecordGenerator::new(10, 1),
            UniformRecordGenerator::new(0, 0),
        );
        assert_eq!(outcome, Outcome::Completed(0), "{strategy}");
        assert_eq!(emitted, 0);
        env.assert_released();
    }
}

#[test]
fn test_function_failure_is_fatal() {
    for strategy in ALL_STRATEGIES {
        let env = one_megabyte_env();
        let driver = CrossDriver::new(
            TaskConfig::new(1).with_strategy(strategy),
            env.context(),
            KvSerializer,
            KvSerializer,
        );
        let mut calls = 0;
        let mut out = CountingCollector::new();
        let err = driver
            .run(
                UniformRecordGenerator::new(10, 1),
                UniformRecordGenerator::new(100, 4),
                |_a: &KvRecord, _b: &KvRecord, _out: &mut dyn Collector<()>| {
                    calls += 1;
                    if calls == 10 {
                        return Err("pair function failed".into());
                    }
                    Ok(())
                },
                &mut out,
            )
            .err()
            .unwrap();
        assert!(matches!(err, OperatorError::UserFunction(_)), "{strategy}: {err}");
        assert!(err.to_string().contains("pair function failed"));
        assert_eq!(calls, 10);
        env.assert_released();
    }
}

#[test]
fn test_cancel_with_endless_second_input() {
    for strategy in ALL_STRATEGIES {
        let env = one_megabyte_env();
        let canceller = cancel_after(&env.signal, Duration::from_millis(300));

        let (env, outcome) = run_with_timeout(Duration::from_secs(30), move || {
            let (outcome, _) = count_pairs(
                &env,
                strategy,
                UniformRecordGenerator::new(10, 1),
                DelayingInfiniteSource::new(Duration::from_millis(1)),
            );
            (env, outcome)
        });
        canceller.join().unwrap();
        assert_eq!(outcome, Outcome::Cancelled, "{strategy}");
        env.assert_released();
    }
}

#[test]
fn test_cancel_with_endless_first_input() {
    for strategy in ALL_STRATEGIES {
        let env = one_megabyte_env();
        let canceller = cancel_after(&env.signal, Duration::from_millis(200));

        let (env, outcome) = run_with_timeout(Duration::from_secs(30), move || {
            let (outcome, _) = count_pairs(
                &env,
                strategy,
                DelayingInfiniteSource::new(Duration::from_millis(1)),
                UniformRecordGenerator::new(10, 1),
            );
            (env, outcome)
        });
        canceller.join().unwrap();
        assert_eq!(outcome, Outcome::Cancelled, "{strategy}");
        env.assert_released();
    }
}

/// Records keyed by their index with a fixed-size payload, 72 bytes encoded.
fn padded_records(count: u32) -> Vec<KvRecord> {
    (0..count)
        .map(|i| (i.to_be_bytes().to_vec(), vec![b'p'; 60]))
        .collect()
}

fn index_of(record: &KvRecord) -> usize {
    u32::from_be_bytes([record.0[0], record.0[1], record.0[2], record.0[3]]) as usize
}

#[test]
fn test_spilled_materialization_and_multiple_blocks() {
    // 16 segments of 4 KB: blocked strategies get a 7 segment block and 8
    // segments of materialization, streamed ones 15 segments.
    let config = TaskConfig::with_memory_bytes(16 * TEST_SEGMENT_SIZE);
    let (first_count, second_count) = (500usize, 1200usize);

    for strategy in ALL_STRATEGIES {
        let env = TestEnv::new(16 * TEST_SEGMENT_SIZE, TEST_SEGMENT_SIZE);
        let driver = CrossDriver::new(
            config.clone().with_strategy(strategy),
            env.context(),
            KvSerializer,
            KvSerializer,
        );
        let mut first_hits = vec![0usize; first_count];
        let mut second_hits = vec![0usize; second_count];
        let mut out = CountingCollector::new();
        let stats = driver
            .run(
                IterSource::new(padded_records(first_count as u32)),
                IterSource::new(padded_records(second_count as u32)),
                |a: &KvRecord, b: &KvRecord, _out: &mut dyn Collector<()>| {
                    first_hits[index_of(a)] += 1;
                    second_hits[index_of(b)] += 1;
                    Ok(())
                },
                &mut out,
            )
            .unwrap()
            .completed()
            .unwrap();

        assert_eq!(stats.invocations, (first_count * second_count) as u64);
        assert!(first_hits.iter().all(|&n| n == second_count), "{strategy}");
        assert!(second_hits.iter().all(|&n| n == first_count), "{strategy}");
        if strategy != LocalStrategy::StreamedOuterSecond {
            assert!(stats.spilled_bytes > 0, "{strategy}: {stats}");
        }
        if strategy.is_blocked() {
            assert!(stats.blocks >= 2, "{strategy}: {stats}");
        }
        env.assert_released();
    }
}

#[test]
fn test_grant_too_small_for_strategy() {
    let env = TestEnv::new(MEGABYTE, TEST_SEGMENT_SIZE);
    let driver = CrossDriver::new(
        TaskConfig::with_memory_bytes(2 * TEST_SEGMENT_SIZE),
        env.context(),
        KvSerializer,
        KvSerializer,
    );
    let mut out = CountingCollector::new();
    let err = driver
        .run(
            UniformRecordGenerator::new(1, 1),
            UniformRecordGenerator::new(1, 1),
            |_a: &KvRecord, _b: &KvRecord, _out: &mut dyn Collector<()>| Ok(()),
            &mut out,
        )
        .err()
        .unwrap();
    assert!(matches!(err, OperatorError::InvalidConfig(_)), "{err}");
    env.assert_released();
}
