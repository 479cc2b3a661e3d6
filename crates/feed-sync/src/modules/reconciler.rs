//! 구독 조정기 (Subscription Reconciler).
//!
//! 구독 저장소의 추가/삭제/reset 알림을 받아 거래소 라이브 구독을 저장소 내용과 일치시킵니다.
//!
//! # 동작 방식
//!
//! 1. 알림 처리기는 대기 중인 배치(`PendingBatch`)에 키를 넣기만 하고 즉시 반환
//! 2. 플러시 태스크가 주기적으로 배치를 통째로 꺼내 연결별로 나눔
//! 3. 연결마다 구독 요청 한 번, 해제 요청 한 번
//! 4. reset 알림이나 재연결 시에는 저장소 전체를 읽어 처음부터 다시 구독

use feed_core::{ReconcilerConfig, SubscriptionKey};
use feed_exchange::{connection_for, to_exchange_stream, ConnectionId, ExchangeError, StreamConnection};
use feed_store::{StoreNotification, SubscriptionSource};
use std::collections::{BTreeMap, HashMap, HashSet};
use futures::future::join_all;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, Notify};
use tokio::time::{timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::stats::ReconcileStats;

/// 플러시 사이에 쌓이는 구독 변경.
///
/// 한 키가 반대쪽 집합에 이미 있으면 그쪽에서 빼기만 하여 이번 주기의 효과를 없앱니다.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PendingBatch {
    to_subscribe: HashSet<SubscriptionKey>,
    to_unsubscribe: HashSet<SubscriptionKey>,
}

impl PendingBatch {
    /// 구독 추가를 기록합니다.
    pub fn add(&mut self, key: SubscriptionKey) {
        if !self.to_unsubscribe.remove(&key) {
            self.to_subscribe.insert(key);
        }
    }

    /// 구독 삭제를 기록합니다.
    pub fn remove(&mut self, key: SubscriptionKey) {
        if !self.to_subscribe.remove(&key) {
            self.to_unsubscribe.insert(key);
        }
    }

    /// 비어 있는지
    pub fn is_empty(&self) -> bool {
        self.to_subscribe.is_empty() && self.to_unsubscribe.is_empty()
    }

    /// 구독할 키
    pub fn to_subscribe(&self) -> &HashSet<SubscriptionKey> {
        &self.to_subscribe
    }

    /// 해제할 키
    pub fn to_unsubscribe(&self) -> &HashSet<SubscriptionKey> {
        &self.to_unsubscribe
    }
}

/// 연결별 요청 묶음.
#[derive(Debug, Default)]
struct ConnectionPlan {
    subscribe: Vec<String>,
    unsubscribe: Vec<String>,
}

/// 구독 조정기.
pub struct Reconciler {
    source: Arc<dyn SubscriptionSource>,
    connections: HashMap<ConnectionId, Arc<dyn StreamConnection>>,
    pending: Mutex<PendingBatch>,
    /// 플러시와 전체 재동기화를 직렬화
    dispatch_lock: tokio::sync::Mutex<()>,
    config: ReconcilerConfig,
}

impl Reconciler {
    /// 새 조정기를 생성합니다.
    pub fn new(
        source: Arc<dyn SubscriptionSource>,
        connections: Vec<Arc<dyn StreamConnection>>,
        config: ReconcilerConfig,
    ) -> Self {
        let connections = connections
            .into_iter()
            .map(|conn| (conn.id(), conn))
            .collect();

        Self {
            source,
            connections,
            pending: Mutex::new(PendingBatch::default()),
            dispatch_lock: tokio::sync::Mutex::new(()),
            config,
        }
    }

    fn pending(&self) -> MutexGuard<'_, PendingBatch> {
        // 보호 대상이 단순 집합이므로 poison 상태여도 계속 사용한다
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 현재 대기 중인 배치의 복사본.
    pub fn pending_snapshot(&self) -> PendingBatch {
        self.pending().clone()
    }

    /// 알림 하나를 처리합니다. 전체 재동기화가 필요하면 `true`.
    ///
    /// 대기 배치에 기록만 하므로 블로킹되지 않습니다.
    pub fn handle_notification(&self, notification: StoreNotification) -> bool {
        match notification {
            StoreNotification::Added(key) => {
                debug!(key = %key, "구독 추가 대기");
                self.pending().add(key);
                false
            }
            StoreNotification::Removed(key) => {
                debug!(key = %key, "구독 해제 대기");
                self.pending().remove(key);
                false
            }
            StoreNotification::Reset => true,
            StoreNotification::DataUpdated(_) => false,
        }
    }

    fn plan<'a>(
        &self,
        subscribe: impl IntoIterator<Item = &'a SubscriptionKey>,
        unsubscribe: impl IntoIterator<Item = &'a SubscriptionKey>,
    ) -> BTreeMap<ConnectionId, ConnectionPlan> {
        let mut plans: BTreeMap<ConnectionId, ConnectionPlan> = BTreeMap::new();
        for key in subscribe {
            plans
                .entry(connection_for(key))
                .or_default()
                .subscribe
                .push(to_exchange_stream(key));
        }
        for key in unsubscribe {
            plans
                .entry(connection_for(key))
                .or_default()
                .unsubscribe
                .push(to_exchange_stream(key));
        }
        plans
    }

    /// 연결별 요청을 동시에 보내고 통계를 합칩니다.
    async fn dispatch(&self, plans: BTreeMap<ConnectionId, ConnectionPlan>) -> ReconcileStats {
        let requests = plans
            .into_iter()
            .map(|(id, plan)| self.dispatch_one(id, plan));

        let mut stats = ReconcileStats::default();
        for connection_stats in join_all(requests).await {
            stats.merge(connection_stats);
        }
        stats
    }

    async fn dispatch_one(&self, id: ConnectionId, mut plan: ConnectionPlan) -> ReconcileStats {
        let mut stats = ReconcileStats::default();
        let Some(conn) = self.connections.get(&id) else {
            warn!(connection = %id, "관리하지 않는 연결, 키 무시");
            stats.failed += plan.subscribe.len() + plan.unsubscribe.len();
            return stats;
        };
        plan.subscribe.sort();
        plan.unsubscribe.sort();

        if !plan.subscribe.is_empty() {
            let requested = plan.subscribe.len();
            match conn.subscribe(plan.subscribe).await {
                Ok(n) => stats.subscribed += n,
                Err(e) => {
                    log_request_error(id, "구독", requested, &e);
                    stats.failed += requested;
                }
            }
        }
        if !plan.unsubscribe.is_empty() {
            let requested = plan.unsubscribe.len();
            match conn.unsubscribe(plan.unsubscribe).await {
                Ok(n) => stats.unsubscribed += n,
                Err(e) => {
                    log_request_error(id, "구독 해제", requested, &e);
                    stats.failed += requested;
                }
            }
        }

        stats
    }

    /// 대기 배치를 꺼내 연결별로 한 번씩 구독/해제 요청을 보냅니다.
    pub async fn flush(&self) -> ReconcileStats {
        let _dispatch = self.dispatch_lock.lock().await;
        let batch = std::mem::take(&mut *self.pending());
        if batch.is_empty() {
            return ReconcileStats::default();
        }

        let plans = self.plan(&batch.to_subscribe, &batch.to_unsubscribe);
        let stats = self.dispatch(plans).await;
        if !stats.is_empty() {
            stats.log_summary("flush");
        }
        stats
    }

    /// 전체 재동기화.
    ///
    /// 모든 연결을 다시 맺고 저장소의 모든 키를 연결별 한 번의 요청으로 구독합니다.
    /// 대기 배치는 저장소 상태로 대체되므로 버립니다.
    pub async fn full_resync(&self) -> Result<ReconcileStats> {
        let _dispatch = self.dispatch_lock.lock().await;
        info!(connections = self.connections.len(), "전체 재동기화 시작");

        *self.pending() = PendingBatch::default();

        let ready = self.reconnect_all().await;

        let keys = self.source.list_keys().await?;
        let mut plans = self.plan(&keys, std::iter::empty());
        let mut skipped = 0;
        plans.retain(|id, plan| {
            if ready.contains(id) {
                return true;
            }
            // 연결이 다시 올라오면 Reconnected 이벤트로 재동기화가 다시 요청된다
            warn!(connection = %id, keys = plan.subscribe.len(), "재연결되지 않은 연결, 구독 보류");
            skipped += plan.subscribe.len();
            false
        });

        let mut stats = self.dispatch(plans).await;
        stats.failed += skipped;

        info!(keys = keys.len(), subscribed = stats.subscribed, failed = stats.failed, "전체 재동기화 완료");
        Ok(stats)
    }

    /// 모든 연결을 동시에 다시 맺습니다. 제한 시간 안에 재연결된 연결만 돌려줍니다.
    async fn reconnect_all(&self) -> HashSet<ConnectionId> {
        let limit = self.config.reconnect_timeout();
        let attempts = self.connections.iter().map(|(id, conn)| async move {
            match timeout(limit, conn.reconnect()).await {
                Ok(Ok(())) => Some(*id),
                Ok(Err(e)) => {
                    warn!(connection = %id, error = %e, "재연결 실패");
                    None
                }
                Err(_) => {
                    warn!(connection = %id, timeout_secs = limit.as_secs(), "재연결 타임아웃");
                    None
                }
            }
        });

        join_all(attempts).await.into_iter().flatten().collect()
    }

    async fn resync_logged(&self) {
        if let Err(e) = self.full_resync().await {
            error!(error = %e, "전체 재동기화 실패");
        }
    }

    /// 알림 처리 루프와 플러시 루프를 실행합니다.
    ///
    /// `resync`는 연결 재수립 등 외부에서 재동기화를 요청할 때 사용합니다.
    pub async fn run(
        self: Arc<Self>,
        mut notifications: mpsc::Receiver<StoreNotification>,
        resync: Arc<Notify>,
        cancel: CancellationToken,
    ) {
        if self.config.resync_on_start {
            self.resync_logged().await;
        }

        let flusher = {
            let this = Arc::clone(&self);
            let cancel = cancel.clone();
            tokio::spawn(async move { this.flush_loop(cancel).await })
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                notification = notifications.recv() => match notification {
                    Some(notification) => {
                        if self.handle_notification(notification) {
                            info!("reset 알림 수신");
                            self.resync_logged().await;
                        }
                    }
                    None => {
                        warn!("알림 채널 종료");
                        break;
                    }
                },
                _ = resync.notified() => {
                    info!("재동기화 요청 수신");
                    self.resync_logged().await;
                }
            }
        }

        cancel.cancel();
        let _ = flusher.await;
        info!("구독 조정기 종료");
    }

    async fn flush_loop(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.flush_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.flush().await;
                }
            }
        }
    }
}

fn log_request_error(id: ConnectionId, request: &str, count: usize, e: &ExchangeError) {
    if e.is_retryable() {
        warn!(connection = %id, count, error = %e, "{} 요청 실패, 재연결 후 재시도", request);
    } else {
        error!(connection = %id, count, error = %e, "{} 요청 실패", request);
    }
}
