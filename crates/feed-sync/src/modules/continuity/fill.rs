//! 백필 채우기 루프와 후보 이력 검증.

use feed_core::{is_contiguous, Bar, SubscriptionKey, Timeframe};
use feed_exchange::parse_rest_klines;
use feed_store::{BackfillSession, KlineTaskPayload, TaskOutcome};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::cache::BarSeries;
use super::engine::Shared;
use crate::stats::FillStats;

/// 채우기 루프 결과.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FillOutcome {
    /// 검증된 이력으로 캐시를 교체함
    Filled { bars: usize, attempts: u32 },
    /// 최대 시도 횟수 소진
    Exhausted { attempts: u32 },
    /// 작업 세션을 열지 못함
    SessionUnavailable(String),
}

impl FillOutcome {
    pub fn is_filled(&self) -> bool {
        matches!(self, Self::Filled { .. })
    }
}

/// 후보 이력 거부 사유.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("마감된 바 없음")]
    Empty,

    #[error("바 수 부족: {count} < {required}")]
    TooFew { count: usize, required: usize },

    #[error("중간에 빠진 바가 있음")]
    NotContiguous,

    #[error("마지막 바가 최신 마감 기간이 아님: {last} != {expected}")]
    Stale { last: i64, expected: i64 },
}

/// 후보 이력을 검증합니다.
///
/// 아직 진행 중인 기간의 바는 먼저 제거하고, 남은 바가 `min_bars`개 이상이며 빈틈이 없고
/// 마지막 바가 `now_ms` 기준 직전 마감 기간이어야 통과합니다.
pub fn validate_candidate(
    mut bars: Vec<Bar>,
    timeframe: Timeframe,
    now_ms: i64,
    min_bars: usize,
) -> Result<Vec<Bar>, Rejection> {
    let current_open = timeframe.period_start(now_ms);
    bars.retain(|bar| bar.open_time_ms() < current_open);

    let Some(last) = bars.last().map(Bar::open_time_ms) else {
        return Err(Rejection::Empty);
    };
    if bars.len() < min_bars {
        return Err(Rejection::TooFew {
            count: bars.len(),
            required: min_bars,
        });
    }
    if !is_contiguous(&bars, timeframe) {
        return Err(Rejection::NotContiguous);
    }
    let expected = timeframe.previous_period_open(now_ms);
    if last != expected {
        return Err(Rejection::Stale { last, expected });
    }

    Ok(bars)
}

/// 전용 세션 하나로 채우기 루프를 실행합니다. 세션은 결과와 관계없이 닫습니다.
pub(super) async fn run_fill(shared: &Shared, key: &SubscriptionKey, timeframe: Timeframe) -> FillOutcome {
    let mut session = match shared.queue.open_session().await {
        Ok(session) => session,
        Err(e) => {
            error!(error = %e, "백필 세션 열기 실패");
            return FillOutcome::SessionUnavailable(e.to_string());
        }
    };

    let outcome = attempt_loop(shared, session.as_mut(), key, timeframe).await;

    if let Err(e) = session.close().await {
        warn!(error = %e, "백필 세션 닫기 실패");
    }
    outcome
}

async fn attempt_loop(
    shared: &Shared,
    session: &mut dyn BackfillSession,
    key: &SubscriptionKey,
    timeframe: Timeframe,
) -> FillOutcome {
    let config = &shared.config;
    let stats = &shared.stats;
    let payload = KlineTaskPayload {
        symbol: key.symbol().to_string(),
        interval: timeframe.to_binance_interval().to_string(),
        limit: config.fetch_limit,
    };

    for attempt in 1..=config.max_fill_attempts {
        let task_id = match session.submit(&payload).await {
            Ok(id) => id,
            Err(e) if e.is_transient() => {
                warn!(attempt, error = %e, "백필 작업 제출 실패, 재시도");
                continue;
            }
            Err(e) => {
                error!(attempt, error = %e, "백필 작업 제출 실패");
                continue;
            }
        };
        FillStats::bump(&stats.submitted);

        let result = match session.wait_for(task_id, config.task_timeout()).await {
            Ok(TaskOutcome::Completed(result)) => result,
            Ok(TaskOutcome::Failed(result)) => {
                FillStats::bump(&stats.failed_tasks);
                warn!(attempt, task_id, result = ?result, "백필 작업 실패");
                continue;
            }
            Ok(TaskOutcome::TimedOut) => {
                FillStats::bump(&stats.timeouts);
                continue;
            }
            Err(e) if e.is_transient() => {
                warn!(attempt, task_id, error = %e, "백필 작업 대기 실패, 재시도");
                continue;
            }
            Err(e) => {
                error!(attempt, task_id, error = %e, "백필 작업 대기 실패");
                continue;
            }
        };

        let candidate = match parse_rest_klines(&result) {
            Ok(bars) => bars,
            Err(e) => {
                FillStats::bump(&stats.rejected);
                warn!(attempt, task_id, error = %e, "백필 결과 파싱 실패");
                continue;
            }
        };

        let now_ms = shared.clock.now_ms();
        match validate_candidate(candidate, timeframe, now_ms, config.min_bars) {
            Ok(bars) => {
                let series = BarSeries::from_window(timeframe, bars, config.retained_bars);
                let count = shared.cache.replace(key, series);
                FillStats::bump(&stats.filled);
                info!(attempt, task_id, bars = count, "캐시 교체 완료");
                return FillOutcome::Filled {
                    bars: count,
                    attempts: attempt,
                };
            }
            Err(rejection) => {
                FillStats::bump(&stats.rejected);
                debug!(attempt, task_id, reason = %rejection, "후보 이력 거부");
            }
        }
    }

    FillStats::bump(&stats.exhausted);
    error!(attempts = config.max_fill_attempts, "백필 재시도 소진, 다음 갱신 때 다시 시도");
    FillOutcome::Exhausted {
        attempts: config.max_fill_attempts,
    }
}
