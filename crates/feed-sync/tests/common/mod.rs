//! 통합 테스트용 메모리 구현.
//!
//! 데이터베이스와 거래소 없이 서비스를 구동하기 위한 trait 구현들입니다.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feed_core::SubscriptionKey;
use feed_exchange::{ConnectionId, ExchangeError, ExchangeResult, StreamConnection};
use feed_store::{
    BackfillQueue, BackfillSession, DataError, KlineTaskPayload, SubscriptionRecord,
    SubscriptionSource, TaskOutcome,
};
use feed_sync::Clock;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

pub const HOUR: i64 = 3_600_000;

pub fn key(s: &str) -> SubscriptionKey {
    SubscriptionKey::parse(s).unwrap()
}

// ============================================================================
// 구독 저장소
// ============================================================================

#[derive(Default)]
pub struct MemorySource {
    rows: Mutex<BTreeMap<SubscriptionKey, SubscriptionRecord>>,
}

impl MemorySource {
    pub fn with_keys(keys: &[&str]) -> Self {
        let source = Self::default();
        for k in keys {
            source.insert(&key(k), "test");
        }
        source
    }

    fn insert(&self, key: &SubscriptionKey, owner: &str) -> bool {
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows.get_mut(key) {
            if !row.subscribers.iter().any(|s| s == owner) {
                row.subscribers.push(owner.to_string());
            }
            return false;
        }
        let now = Utc::now();
        let data_type = key
            .to_string()
            .split_once('@')
            .map(|(_, d)| d.to_string())
            .unwrap_or_default();
        rows.insert(
            key.clone(),
            SubscriptionRecord {
                subscription_key: key.to_string(),
                data_type,
                data: None,
                event_time: None,
                subscribers: vec![owner.to_string()],
                created_at: now,
                updated_at: now,
            },
        );
        true
    }

    pub fn set_data(&self, key: &SubscriptionKey, data: Value) {
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows.get_mut(key) {
            row.data = Some(data);
        }
    }

    pub fn subscribers(&self, key: &SubscriptionKey) -> Vec<String> {
        self.rows
            .lock()
            .unwrap()
            .get(key)
            .map(|row| row.subscribers.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SubscriptionSource for MemorySource {
    async fn list_keys(&self) -> feed_store::Result<Vec<SubscriptionKey>> {
        Ok(self.rows.lock().unwrap().keys().cloned().collect())
    }

    async fn get(&self, key: &SubscriptionKey) -> feed_store::Result<Option<SubscriptionRecord>> {
        Ok(self.rows.lock().unwrap().get(key).cloned())
    }

    async fn add_subscriber(&self, key: &SubscriptionKey, owner: &str) -> feed_store::Result<bool> {
        Ok(self.insert(key, owner))
    }

    async fn remove_subscriber(&self, key: &SubscriptionKey, owner: &str) -> feed_store::Result<bool> {
        let mut rows = self.rows.lock().unwrap();
        let Some(row) = rows.get_mut(key) else {
            return Ok(false);
        };
        row.subscribers.retain(|s| s != owner);
        if row.subscribers.is_empty() {
            rows.remove(key);
            return Ok(true);
        }
        Ok(false)
    }
}

// ============================================================================
// 거래소 연결
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
    Reconnect,
}

pub struct MemoryConnection {
    id: ConnectionId,
    live: Mutex<HashSet<String>>,
    calls: Mutex<Vec<Call>>,
}

impl MemoryConnection {
    pub fn new(id: ConnectionId) -> Arc<Self> {
        Arc::new(Self {
            id,
            live: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn live(&self) -> HashSet<String> {
        self.live.lock().unwrap().clone()
    }
}

#[async_trait]
impl StreamConnection for MemoryConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    async fn subscribe(&self, streams: Vec<String>) -> ExchangeResult<usize> {
        self.calls.lock().unwrap().push(Call::Subscribe(streams.clone()));
        let mut live = self.live.lock().unwrap();
        Ok(streams.into_iter().filter(|s| live.insert(s.clone())).count())
    }

    async fn unsubscribe(&self, streams: Vec<String>) -> ExchangeResult<usize> {
        self.calls.lock().unwrap().push(Call::Unsubscribe(streams.clone()));
        let mut live = self.live.lock().unwrap();
        Ok(streams.iter().filter(|s| live.remove(*s)).count())
    }

    async fn reconnect(&self) -> ExchangeResult<()> {
        self.calls.lock().unwrap().push(Call::Reconnect);
        self.live.lock().unwrap().clear();
        Ok(())
    }

    async fn live_streams(&self) -> HashSet<String> {
        self.live()
    }
}

/// 재연결이 끝나지 않는 연결. 닿지 않는 거래소 주소를 흉내냅니다.
pub struct UnreachableConnection {
    id: ConnectionId,
    requests: AtomicUsize,
}

impl UnreachableConnection {
    pub fn new(id: ConnectionId) -> Arc<Self> {
        Arc::new(Self {
            id,
            requests: AtomicUsize::new(0),
        })
    }

    /// 재연결 외에 받은 요청 수
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StreamConnection for UnreachableConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    async fn subscribe(&self, _streams: Vec<String>) -> ExchangeResult<usize> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        Err(ExchangeError::Disconnected("unreachable".to_string()))
    }

    async fn unsubscribe(&self, _streams: Vec<String>) -> ExchangeResult<usize> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        Err(ExchangeError::Disconnected("unreachable".to_string()))
    }

    async fn reconnect(&self) -> ExchangeResult<()> {
        std::future::pending().await
    }

    async fn live_streams(&self) -> HashSet<String> {
        HashSet::new()
    }
}

// ============================================================================
// 백필 작업 큐
// ============================================================================

/// 미리 정한 결과를 순서대로 돌려주는 큐. 결과가 떨어지면 `TimedOut`.
///
/// `gate`가 있으면 `wait_for`는 허가가 생길 때까지 대기합니다. 복제본은 상태를 공유합니다.
/// `fail_next_*`로 다음 N번의 세션 열기/제출/대기를 오류로 만들 수 있습니다.
#[derive(Clone, Default)]
pub struct MemoryQueue {
    state: Arc<QueueState>,
}

#[derive(Default)]
struct QueueState {
    outcomes: Mutex<VecDeque<TaskOutcome>>,
    payloads: Mutex<Vec<KlineTaskPayload>>,
    gate: Option<Arc<Semaphore>>,
    sessions_opened: AtomicUsize,
    sessions_closed: AtomicUsize,
    open_failures: AtomicUsize,
    submit_failures: AtomicUsize,
    wait_failures: AtomicUsize,
}

/// 남은 실패 횟수가 있으면 하나 소비하고 `true`.
fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl MemoryQueue {
    pub fn scripted(outcomes: Vec<TaskOutcome>) -> Self {
        Self {
            state: Arc::new(QueueState {
                outcomes: Mutex::new(outcomes.into()),
                ..Default::default()
            }),
        }
    }

    pub fn gated(outcomes: Vec<TaskOutcome>, gate: Arc<Semaphore>) -> Self {
        Self {
            state: Arc::new(QueueState {
                outcomes: Mutex::new(outcomes.into()),
                gate: Some(gate),
                ..Default::default()
            }),
        }
    }

    pub fn push_outcome(&self, outcome: TaskOutcome) {
        self.state.outcomes.lock().unwrap().push_back(outcome);
    }

    pub fn fail_next_opens(&self, n: usize) {
        self.state.open_failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_submits(&self, n: usize) {
        self.state.submit_failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_waits(&self, n: usize) {
        self.state.wait_failures.store(n, Ordering::SeqCst);
    }

    pub fn submitted(&self) -> usize {
        self.state.payloads.lock().unwrap().len()
    }

    pub fn payloads(&self) -> Vec<KlineTaskPayload> {
        self.state.payloads.lock().unwrap().clone()
    }

    pub fn opened(&self) -> usize {
        self.state.sessions_opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.state.sessions_closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackfillQueue for MemoryQueue {
    async fn open_session(&self) -> feed_store::Result<Box<dyn BackfillSession>> {
        if take_failure(&self.state.open_failures) {
            return Err(DataError::ConnectionError("connection refused".to_string()));
        }
        self.state.sessions_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySession {
            state: Arc::clone(&self.state),
        }))
    }
}

struct MemorySession {
    state: Arc<QueueState>,
}

#[async_trait]
impl BackfillSession for MemorySession {
    async fn submit(&mut self, payload: &KlineTaskPayload) -> feed_store::Result<i64> {
        if take_failure(&self.state.submit_failures) {
            return Err(DataError::QueryError("insert rejected".to_string()));
        }
        let mut payloads = self.state.payloads.lock().unwrap();
        payloads.push(payload.clone());
        Ok(payloads.len() as i64)
    }

    async fn wait_for(&mut self, _task_id: i64, _timeout: Duration) -> feed_store::Result<TaskOutcome> {
        if take_failure(&self.state.wait_failures) {
            return Err(DataError::ConnectionError("connection reset".to_string()));
        }
        if let Some(gate) = &self.state.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        let outcome = self.state.outcomes.lock().unwrap().pop_front();
        Ok(outcome.unwrap_or(TaskOutcome::TimedOut))
    }

    async fn close(self: Box<Self>) -> feed_store::Result<()> {
        self.state.sessions_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// 시계와 캔들 픽스처
// ============================================================================

pub struct FixedClock(pub i64);

impl Clock for FixedClock {
    fn now_ms(&self) -> i64 {
        self.0
    }
}

/// `last_open`으로 끝나는 1시간봉 `count`개의 REST 응답.
pub fn rest_history(count: i64, last_open: i64) -> Value {
    let rows: Vec<Value> = (0..count)
        .map(|i| {
            let open = last_open - (count - 1 - i) * HOUR;
            json!([open, "100.0", "110.0", "90.0", "105.0", "12.5", open + HOUR - 1])
        })
        .collect();
    Value::Array(rows)
}

/// 스트림 캔들 이벤트 페이로드.
pub fn kline_event(symbol: &str, open: i64, close: &str) -> Value {
    json!({
        "e": "kline",
        "E": open + 1_000,
        "s": symbol,
        "k": {
            "t": open,
            "T": open + HOUR - 1,
            "s": symbol,
            "i": "1h",
            "o": "100.0",
            "h": "110.0",
            "l": "90.0",
            "c": close,
            "v": "1.0",
            "x": false
        }
    })
}

pub fn ms(t: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(t).unwrap()
}
