//! 연속성 엔진 (Continuity Engine).
//!
//! # 키별 상태
//!
//! ```text
//! Cold ──▶ Repairing ──▶ Warm ──(간격 이상)──▶ Stale ──▶ Repairing ──▶ Warm
//!              │                                             │
//!              └──────────(실패/소진)──▶ Stale ◀──────────────┘
//! ```
//!
//! 정상 갱신(같은 기간, 다음 기간)은 도착 즉시 반영합니다. 간격 이상이 감지되면
//! 키별 락을 잡은 별도 태스크에서 백필을 실행하며, 이미 진행 중이면 그 백필에 합칩니다.
//! `Stale` 상태인 키는 정상 갱신이 반영된 뒤에도 백필을 다시 시작합니다.

use chrono::Utc;
use feed_core::{Bar, ContinuityConfig, SubscriptionKey};
use feed_exchange::parse_kline_payload;
use feed_store::{BackfillQueue, StoreNotification, SubscriptionSource};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use super::cache::{ApplyResult, BarSeries, CacheTable, FeedState};
use super::fill::{run_fill, FillOutcome};
use super::gap::GapClass;
use super::locks::FillLocks;
use crate::error::{Result, SyncError};
use crate::stats::FillStats;

/// 통계 로그 주기
const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// 현재 시각 공급자.
pub trait Clock: Send + Sync {
    /// epoch 밀리초
    fn now_ms(&self) -> i64;
}

/// 시스템 시계.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// 백필을 시작한 이유.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairReason {
    /// 캐시 없음 (워밍업)
    Cold,
    /// 간격 이상
    Gap(GapClass),
    /// 이전 백필이 실패한 키의 재시도
    Stale,
}

/// 바 하나를 처리한 결과.
#[derive(Debug)]
pub enum UpdateDecision {
    /// 캐시에 바로 반영함 (`Same` 또는 `Next`)
    Applied(GapClass),
    /// 새 백필 태스크를 시작함
    RepairStarted {
        reason: RepairReason,
        handle: JoinHandle<FillOutcome>,
    },
    /// 진행 중인 백필에 합쳐짐
    RepairCoalesced(RepairReason),
    /// 추적 대상이 아니거나 해석할 수 없는 갱신
    Ignored,
}

/// 엔진 태스크들이 공유하는 상태.
pub(super) struct Shared {
    pub(super) source: Arc<dyn SubscriptionSource>,
    pub(super) queue: Arc<dyn BackfillQueue>,
    pub(super) cache: CacheTable,
    pub(super) locks: FillLocks,
    pub(super) config: ContinuityConfig,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) stats: FillStats,
    pub(super) watched: Vec<SubscriptionKey>,
}

/// 연속성 엔진.
#[derive(Clone)]
pub struct ContinuityEngine {
    shared: Arc<Shared>,
}

impl ContinuityEngine {
    /// 새 엔진을 생성합니다. 감시 목록에는 `KLINE` 키만 올 수 있습니다.
    pub fn new(
        source: Arc<dyn SubscriptionSource>,
        queue: Arc<dyn BackfillQueue>,
        config: ContinuityConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut watched = Vec::with_capacity(config.watch.len());
        for raw in &config.watch {
            let key = SubscriptionKey::parse(raw)?;
            if key.timeframe().is_none() {
                return Err(SyncError::Config(format!("KLINE 키가 아닙니다: {}", key)));
            }
            if seen.insert(key.clone()) {
                watched.push(key);
            }
        }

        Ok(Self {
            shared: Arc::new(Shared {
                source,
                queue,
                cache: CacheTable::new(),
                locks: FillLocks::new(config.max_fill_locks),
                config,
                clock,
                stats: FillStats::default(),
                watched,
            }),
        })
    }

    /// 감시 중인 키
    pub fn watched(&self) -> &[SubscriptionKey] {
        &self.shared.watched
    }

    pub fn stats(&self) -> &FillStats {
        &self.shared.stats
    }

    /// 감시 키마다 구독자로 등록하고 워밍업 백필을 시작합니다.
    pub async fn start(&self) -> Result<Vec<JoinHandle<FillOutcome>>> {
        let owner = &self.shared.config.owner_id;
        let mut handles = Vec::new();

        for key in &self.shared.watched {
            let created = self.shared.source.add_subscriber(key, owner).await?;
            debug!(key = %key, owner = %owner, created, "구독자 등록");

            if let UpdateDecision::RepairStarted { handle, .. } = self.repair(key, RepairReason::Cold) {
                handles.push(handle);
            }
        }

        info!(keys = self.shared.watched.len(), "연속성 엔진 시작");
        Ok(handles)
    }

    /// 저장소 알림 하나를 처리합니다.
    ///
    /// 감시 키의 갱신이면 저장소에서 최신 페이로드를 읽어 `on_bar`로 넘깁니다.
    pub async fn handle_notification(&self, notification: StoreNotification) -> Result<UpdateDecision> {
        let key = match notification {
            StoreNotification::DataUpdated(key) => key,
            StoreNotification::Reset => {
                debug!("reset 알림은 연속성 엔진과 무관");
                return Ok(UpdateDecision::Ignored);
            }
            StoreNotification::Added(_) | StoreNotification::Removed(_) => {
                return Ok(UpdateDecision::Ignored)
            }
        };
        if !self.shared.watched.contains(&key) {
            return Ok(UpdateDecision::Ignored);
        }

        let Some(data) = self.shared.source.get(&key).await?.and_then(|record| record.data) else {
            debug!(key = %key, "페이로드 없음");
            return Ok(UpdateDecision::Ignored);
        };

        match parse_kline_payload(&data) {
            Ok(bar) => Ok(self.on_bar(&key, bar)),
            Err(e) => {
                warn!(key = %key, error = %e, "캔들 페이로드 파싱 실패");
                Ok(UpdateDecision::Ignored)
            }
        }
    }

    /// 새 바 하나를 분류하고 반영하거나 백필을 시작합니다.
    pub fn on_bar(&self, key: &SubscriptionKey, bar: Bar) -> UpdateDecision {
        if key.timeframe().is_none() {
            return UpdateDecision::Ignored;
        }

        match self.shared.cache.apply(key, bar, self.shared.config.retained_bars) {
            ApplyResult::Applied(class) => {
                // 실패한 백필은 정상 갱신이 와도 다시 시도한다
                if self.shared.cache.state(key) == FeedState::Stale {
                    if let started @ UpdateDecision::RepairStarted { .. } =
                        self.repair(key, RepairReason::Stale)
                    {
                        return started;
                    }
                }
                UpdateDecision::Applied(class)
            }
            ApplyResult::NoCache => self.repair(key, RepairReason::Cold),
            ApplyResult::Gap {
                class,
                last_open_ms,
                new_open_ms,
            } => {
                if class == GapClass::AbnormalGap {
                    warn!(key = %key, last_open_ms, new_open_ms, "비정상 간격 감지");
                } else {
                    info!(key = %key, last_open_ms, new_open_ms, "데이터 누락 감지");
                }
                if self.shared.cache.state(key) != FeedState::Repairing {
                    self.shared.cache.set_state(key, FeedState::Stale);
                }
                self.repair(key, RepairReason::Gap(class))
            }
        }
    }

    fn repair(&self, key: &SubscriptionKey, reason: RepairReason) -> UpdateDecision {
        let Some(timeframe) = key.timeframe() else {
            return UpdateDecision::Ignored;
        };
        let Some(guard) = self.shared.locks.try_acquire(key) else {
            debug!(key = %key, ?reason, "진행 중인 백필에 합침");
            return UpdateDecision::RepairCoalesced(reason);
        };

        self.shared.cache.set_state(key, FeedState::Repairing);

        let shared = Arc::clone(&self.shared);
        let key = key.clone();
        let span = feed_core::feed_span!("backfill", key);
        let handle = tokio::spawn(
            async move {
                let _guard = guard;
                let outcome = run_fill(&shared, &key, timeframe).await;
                if !outcome.is_filled() {
                    shared.cache.set_state(&key, FeedState::Stale);
                }
                outcome
            }
            .instrument(span),
        );

        UpdateDecision::RepairStarted { reason, handle }
    }

    /// 현재 캐시 스냅샷.
    pub fn snapshot(&self, key: &SubscriptionKey) -> Option<Arc<BarSeries>> {
        self.shared.cache.snapshot(key)
    }

    pub fn feed_state(&self, key: &SubscriptionKey) -> FeedState {
        self.shared.cache.state(key)
    }

    /// 전략 계산에 쓸 수 있을 만큼 데이터가 충분한지.
    pub fn is_warm(&self, key: &SubscriptionKey) -> bool {
        self.feed_state(key) == FeedState::Warm
            && self
                .snapshot(key)
                .map(|series| series.len() >= self.shared.config.min_bars)
                .unwrap_or(false)
    }

    /// 알림 처리 루프.
    pub async fn run(&self, mut notifications: mpsc::Receiver<StoreNotification>, cancel: CancellationToken) {
        let mut stats_ticker = tokio::time::interval(STATS_INTERVAL);
        stats_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        stats_ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                notification = notifications.recv() => match notification {
                    Some(notification) => {
                        if let Err(e) = self.handle_notification(notification).await {
                            error!(error = %e, "갱신 처리 실패");
                        }
                    }
                    None => {
                        warn!("알림 채널 종료");
                        break;
                    }
                },
                _ = stats_ticker.tick() => self.shared.stats.log_summary(),
            }
        }

        self.shared.stats.log_summary();
        info!("연속성 엔진 종료");
    }
}
