//! 연속성 엔진 통합 테스트
//!
//! 메모리 작업 큐와 고정 시계로 간격 분류, 단일 실행 백필, 원자적 캐시 교체를 검증합니다.

mod common;

use common::{kline_event, key, ms, rest_history, FixedClock, MemoryQueue, MemorySource, HOUR};
use feed_core::{Bar, ContinuityConfig, SubscriptionKey, Timeframe};
use feed_store::{StoreNotification, TaskOutcome};
use feed_sync::{
    ContinuityEngine, FeedState, FillOutcome, FillStats, GapClass, RepairReason, UpdateDecision,
};
use rust_decimal_macros::dec;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// 2024-01-01T00:00:00Z, 캐시의 마지막 마감 바
const LAST: i64 = 1_704_067_200_000;
/// 다음 기간이 막 시작된 시각
const NOW: i64 = LAST + HOUR + 1_000;
const WATCHED: &str = "BINANCE:BTCUSDT@KLINE_60";

// ============================================================================
// 테스트 헬퍼 함수
// ============================================================================

fn engine_with(queue: MemoryQueue) -> (ContinuityEngine, Arc<MemorySource>) {
    let source = Arc::new(MemorySource::default());
    let config = ContinuityConfig {
        watch: vec![WATCHED.to_string()],
        ..Default::default()
    };
    let engine = ContinuityEngine::new(
        source.clone(),
        Arc::new(queue),
        config,
        Arc::new(FixedClock(NOW)),
    )
    .unwrap();
    (engine, source)
}

fn bar_at(open: i64) -> Bar {
    Bar {
        open_time: ms(open),
        open: dec!(100),
        high: dec!(110),
        low: dec!(90),
        close: dec!(105),
        volume: dec!(1),
        close_time: ms(open + HOUR - 1),
        closed: false,
    }
}

fn watched() -> SubscriptionKey {
    key(WATCHED)
}

/// 백필을 시작시키고 결과를 기다립니다.
async fn expect_repair(decision: UpdateDecision) -> (RepairReason, FillOutcome) {
    match decision {
        UpdateDecision::RepairStarted { reason, handle } => (reason, handle.await.unwrap()),
        other => panic!("백필이 시작되어야 함: {:?}", other),
    }
}

/// 300개 바로 워밍업된 엔진
async fn warm_engine(queue: MemoryQueue) -> ContinuityEngine {
    let (engine, _source) = engine_with(queue);
    let (reason, outcome) = expect_repair(engine.on_bar(&watched(), bar_at(LAST))).await;
    assert_eq!(reason, RepairReason::Cold);
    assert!(outcome.is_filled());
    engine
}

// ============================================================================
// 간격 분류 시나리오
// ============================================================================

#[tokio::test]
async fn test_normal_append_creates_no_task() {
    let queue = MemoryQueue::scripted(vec![TaskOutcome::Completed(rest_history(300, LAST))]);
    let engine = warm_engine(queue.clone()).await;
    assert!(engine.is_warm(&watched()));
    assert_eq!(engine.snapshot(&watched()).unwrap().len(), 300);

    let decision = engine.on_bar(&watched(), bar_at(LAST + HOUR));
    assert!(matches!(decision, UpdateDecision::Applied(GapClass::Next)));

    let series = engine.snapshot(&watched()).unwrap();
    assert_eq!(series.len(), 301);
    assert_eq!(series.last().unwrap().open_time_ms(), LAST + HOUR);
    assert!(series.is_contiguous());
    assert_eq!(queue.submitted(), 1);
}

#[tokio::test]
async fn test_same_period_refines_last_bar() {
    let queue = MemoryQueue::scripted(vec![TaskOutcome::Completed(rest_history(300, LAST))]);
    let engine = warm_engine(queue.clone()).await;

    let mut refined = bar_at(LAST);
    refined.close = dec!(123.45);
    let decision = engine.on_bar(&watched(), refined);
    assert!(matches!(decision, UpdateDecision::Applied(GapClass::Same)));

    let series = engine.snapshot(&watched()).unwrap();
    assert_eq!(series.len(), 300);
    assert_eq!(series.last().unwrap().close, dec!(123.45));
    assert_eq!(queue.submitted(), 1);
}

#[tokio::test]
async fn test_exact_threshold_is_not_data_gap() {
    let queue = MemoryQueue::scripted(vec![TaskOutcome::Completed(rest_history(300, LAST))]);
    let engine = warm_engine(queue).await;

    let (reason, _) = expect_repair(engine.on_bar(&watched(), bar_at(LAST + HOUR * 3 / 2))).await;
    assert_eq!(reason, RepairReason::Gap(GapClass::AbnormalGap));

    let (reason, _) =
        expect_repair(engine.on_bar(&watched(), bar_at(LAST + HOUR * 3 / 2 + 1))).await;
    assert_eq!(reason, RepairReason::Gap(GapClass::DataGap));
}

#[tokio::test]
async fn test_out_of_order_bar_is_abnormal() {
    let queue = MemoryQueue::scripted(vec![TaskOutcome::Completed(rest_history(300, LAST))]);
    let engine = warm_engine(queue).await;

    let (reason, _) = expect_repair(engine.on_bar(&watched(), bar_at(LAST - HOUR))).await;
    assert_eq!(reason, RepairReason::Gap(GapClass::AbnormalGap));
}

// ============================================================================
// 채우기 루프 테스트
// ============================================================================

#[tokio::test]
async fn test_warmup_rejects_279_then_accepts_280() {
    let queue = MemoryQueue::scripted(vec![
        TaskOutcome::Completed(rest_history(279, LAST)),
        TaskOutcome::Completed(rest_history(280, LAST)),
    ]);
    let (engine, _source) = engine_with(queue.clone());

    let (_, outcome) = expect_repair(engine.on_bar(&watched(), bar_at(LAST))).await;
    assert_eq!(
        outcome,
        FillOutcome::Filled {
            bars: 280,
            attempts: 2
        }
    );
    assert_eq!(queue.submitted(), 2);
    assert!(engine.is_warm(&watched()));

    let payload = &queue.payloads()[0];
    assert_eq!(payload.symbol, "BTCUSDT");
    assert_eq!(payload.interval, "1h");
    assert_eq!(payload.limit, 1000);
}

#[tokio::test]
async fn test_exhausted_fill_leaves_key_stale() {
    let queue = MemoryQueue::scripted(vec![
        TaskOutcome::Failed(None),
        TaskOutcome::Completed(rest_history(300, LAST - HOUR)),
    ]);
    let (engine, _source) = engine_with(queue.clone());

    let (_, outcome) = expect_repair(engine.on_bar(&watched(), bar_at(LAST))).await;
    assert_eq!(outcome, FillOutcome::Exhausted { attempts: 5 });
    assert_eq!(queue.submitted(), 5);
    assert_eq!(queue.opened(), 1);
    assert_eq!(queue.closed(), 1);
    assert_eq!(engine.feed_state(&watched()), FeedState::Stale);
    assert!(!engine.is_warm(&watched()));
    assert_eq!(FillStats::get(&engine.stats().exhausted), 1);
    assert_eq!(FillStats::get(&engine.stats().failed_tasks), 1);
    assert_eq!(FillStats::get(&engine.stats().rejected), 1);
}

#[tokio::test]
async fn test_stale_key_retries_on_next_normal_update() {
    let queue = MemoryQueue::scripted(vec![TaskOutcome::Completed(rest_history(300, LAST))]);
    let engine = warm_engine(queue.clone()).await;

    // 늦게 도착한 바로 시작된 백필이 모두 타임아웃
    let (reason, outcome) = expect_repair(engine.on_bar(&watched(), bar_at(LAST - HOUR))).await;
    assert_eq!(reason, RepairReason::Gap(GapClass::AbnormalGap));
    assert_eq!(outcome, FillOutcome::Exhausted { attempts: 5 });
    assert_eq!(engine.feed_state(&watched()), FeedState::Stale);
    assert_eq!(queue.submitted(), 6);

    // 이어지는 정상 갱신은 캐시에 반영되고 백필을 다시 시작한다
    queue.push_outcome(TaskOutcome::Completed(rest_history(300, LAST)));
    let (reason, outcome) = expect_repair(engine.on_bar(&watched(), bar_at(LAST))).await;
    assert_eq!(reason, RepairReason::Stale);
    assert!(outcome.is_filled());
    assert_eq!(queue.submitted(), 7);
    assert_eq!(engine.feed_state(&watched()), FeedState::Warm);
    assert!(engine.is_warm(&watched()));

    // warm으로 돌아온 뒤의 정상 갱신은 작업을 만들지 않음
    let decision = engine.on_bar(&watched(), bar_at(LAST + HOUR));
    assert!(matches!(decision, UpdateDecision::Applied(GapClass::Next)));
    assert_eq!(queue.submitted(), 7);
}

#[tokio::test]
async fn test_session_unavailable_releases_lock() {
    let queue = MemoryQueue::scripted(vec![TaskOutcome::Completed(rest_history(300, LAST))]);
    queue.fail_next_opens(1);
    let (engine, _source) = engine_with(queue.clone());

    let (_, outcome) = expect_repair(engine.on_bar(&watched(), bar_at(LAST))).await;
    assert!(matches!(outcome, FillOutcome::SessionUnavailable(_)));
    assert_eq!(engine.feed_state(&watched()), FeedState::Stale);
    assert_eq!(queue.opened(), 0);
    assert_eq!(queue.closed(), 0);
    assert_eq!(queue.submitted(), 0);

    // 락이 풀려 있으므로 다음 갱신이 새 백필을 시작한다
    let (reason, outcome) = expect_repair(engine.on_bar(&watched(), bar_at(LAST))).await;
    assert_eq!(reason, RepairReason::Cold);
    assert!(outcome.is_filled());
    assert_eq!(queue.opened(), 1);
    assert_eq!(queue.closed(), 1);
}

#[tokio::test]
async fn test_store_errors_still_close_session() {
    let queue = MemoryQueue::scripted(vec![TaskOutcome::Completed(rest_history(300, LAST))]);
    queue.fail_next_submits(3);
    queue.fail_next_waits(2);
    let (engine, _source) = engine_with(queue.clone());

    let (_, outcome) = expect_repair(engine.on_bar(&watched(), bar_at(LAST))).await;
    assert_eq!(outcome, FillOutcome::Exhausted { attempts: 5 });
    assert_eq!(queue.opened(), 1);
    assert_eq!(queue.closed(), queue.opened());
    assert_eq!(queue.submitted(), 2);
    assert_eq!(FillStats::get(&engine.stats().submitted), 2);
    assert_eq!(engine.feed_state(&watched()), FeedState::Stale);

    // 실패 뒤에도 락이 풀려 있어 다음 갱신이 새 백필을 시작한다
    let (reason, outcome) = expect_repair(engine.on_bar(&watched(), bar_at(LAST))).await;
    assert_eq!(reason, RepairReason::Cold);
    assert_eq!(
        outcome,
        FillOutcome::Filled {
            bars: 300,
            attempts: 1
        }
    );
    assert_eq!(queue.opened(), 2);
    assert_eq!(queue.closed(), 2);
}

#[tokio::test]
async fn test_concurrent_updates_coalesce_into_one_fill() {
    let gate = Arc::new(Semaphore::new(0));
    let queue = MemoryQueue::gated(
        vec![TaskOutcome::Completed(rest_history(300, LAST))],
        gate.clone(),
    );
    let (engine, _source) = engine_with(queue.clone());

    let first = engine.on_bar(&watched(), bar_at(LAST));
    let UpdateDecision::RepairStarted { handle, .. } = first else {
        panic!("첫 갱신은 백필을 시작해야 함");
    };
    assert_eq!(engine.feed_state(&watched()), FeedState::Repairing);

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move {
            engine.on_bar(&watched(), bar_at(LAST))
        }));
    }
    for task in tasks {
        assert!(matches!(
            task.await.unwrap(),
            UpdateDecision::RepairCoalesced(RepairReason::Cold)
        ));
    }

    gate.add_permits(1);
    assert!(handle.await.unwrap().is_filled());
    assert_eq!(queue.submitted(), 1);
    assert_eq!(engine.feed_state(&watched()), FeedState::Warm);
}

#[tokio::test]
async fn test_readers_see_old_or_new_cache_only() {
    let gate = Arc::new(Semaphore::new(1));
    let queue = MemoryQueue::gated(
        vec![
            TaskOutcome::Completed(rest_history(300, LAST)),
            TaskOutcome::Completed(rest_history(500, LAST)),
        ],
        gate.clone(),
    );
    let engine = warm_engine(queue).await;
    let old = engine.snapshot(&watched()).unwrap();

    let decision = engine.on_bar(&watched(), bar_at(LAST + 3 * HOUR));
    let UpdateDecision::RepairStarted { handle, .. } = decision else {
        panic!("간격은 백필을 시작해야 함");
    };

    // 백필 중 읽기는 기존 캐시 그대로
    let during = engine.snapshot(&watched()).unwrap();
    assert!(Arc::ptr_eq(&old, &during));
    assert_eq!(during.len(), 300);

    gate.add_permits(1);
    assert!(handle.await.unwrap().is_filled());

    let new = engine.snapshot(&watched()).unwrap();
    assert_eq!(new.len(), 500);
    assert!(new.is_contiguous());
    assert_eq!(old.len(), 300);
    assert_eq!(new.timeframe(), Timeframe::H1);
}

// ============================================================================
// 알림 처리 테스트
// ============================================================================

#[tokio::test]
async fn test_start_registers_owner_and_warms_up() {
    let queue = MemoryQueue::scripted(vec![TaskOutcome::Completed(rest_history(300, LAST))]);
    let (engine, source) = engine_with(queue);

    let handles = engine.start().await.unwrap();
    assert_eq!(handles.len(), 1);
    assert_eq!(source.subscribers(&watched()), vec!["continuity-engine".to_string()]);

    for handle in handles {
        assert!(handle.await.unwrap().is_filled());
    }
    assert!(engine.is_warm(&watched()));
}

#[tokio::test]
async fn test_data_update_reads_payload_from_store() {
    let queue = MemoryQueue::scripted(vec![TaskOutcome::Completed(rest_history(300, LAST))]);
    let (engine, source) = engine_with(queue);
    for handle in engine.start().await.unwrap() {
        handle.await.unwrap();
    }

    source.set_data(&watched(), kline_event("BTCUSDT", LAST + HOUR, "106.5"));
    let decision = engine
        .handle_notification(StoreNotification::DataUpdated(watched()))
        .await
        .unwrap();
    assert!(matches!(decision, UpdateDecision::Applied(GapClass::Next)));
    assert_eq!(
        engine.snapshot(&watched()).unwrap().last().unwrap().close,
        dec!(106.5)
    );

    // 감시하지 않는 키와 reset은 무시
    let other = engine
        .handle_notification(StoreNotification::DataUpdated(key("BINANCE:ETHUSDT@KLINE_60")))
        .await
        .unwrap();
    assert!(matches!(other, UpdateDecision::Ignored));
    let reset = engine
        .handle_notification(StoreNotification::Reset)
        .await
        .unwrap();
    assert!(matches!(reset, UpdateDecision::Ignored));
}

#[tokio::test]
async fn test_non_kline_watch_key_is_rejected() {
    let config = ContinuityConfig {
        watch: vec!["BINANCE:BTCUSDT@TRADE".to_string()],
        ..Default::default()
    };
    let result = ContinuityEngine::new(
        Arc::new(MemorySource::default()),
        Arc::new(MemoryQueue::default()),
        config,
        Arc::new(FixedClock(NOW)),
    );
    assert!(result.is_err());
}
