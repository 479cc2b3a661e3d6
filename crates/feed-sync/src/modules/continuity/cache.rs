//! 키별 바 캐시.
//!
//! 읽는 쪽은 `Arc<BarSeries>` 스냅샷을 받습니다. 정상 갱신은 copy-on-write로,
//! 백필 결과는 `Arc` 교체로 반영하므로 읽는 쪽은 항상 완전한 이전 값 또는 새 값만 봅니다.

use feed_core::{is_contiguous, Bar, SubscriptionKey, Timeframe};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::gap::{classify_gap, GapClass};

/// 한 키의 연속 바 시퀀스 (오래된 것부터).
#[derive(Debug, Clone, PartialEq)]
pub struct BarSeries {
    timeframe: Timeframe,
    bars: Vec<Bar>,
}

impl BarSeries {
    /// 새 시퀀스를 생성합니다.
    pub fn new(timeframe: Timeframe, bars: Vec<Bar>) -> Self {
        Self { timeframe, bars }
    }

    /// 마지막 `retained`개만 남긴 시퀀스를 생성합니다.
    pub fn from_window(timeframe: Timeframe, mut bars: Vec<Bar>, retained: usize) -> Self {
        if bars.len() > retained {
            bars.drain(..bars.len() - retained);
        }
        Self { timeframe, bars }
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    pub fn bars(&self) -> &[Bar] {
        &self.bars
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn last(&self) -> Option<&Bar> {
        self.bars.last()
    }

    /// 빈틈 없이 이어지는지
    pub fn is_contiguous(&self) -> bool {
        is_contiguous(&self.bars, self.timeframe)
    }

    fn replace_last(&mut self, bar: Bar) {
        if let Some(last) = self.bars.last_mut() {
            *last = bar;
        } else {
            self.bars.push(bar);
        }
    }

    fn push_bounded(&mut self, bar: Bar, retained: usize) {
        self.bars.push(bar);
        if self.bars.len() > retained {
            let excess = self.bars.len() - retained;
            self.bars.drain(..excess);
        }
    }
}

/// 키별 피드 상태.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FeedState {
    /// 캐시 없음
    #[default]
    Cold,
    /// 연속이며 최신
    Warm,
    /// 간격 이상이 감지됨
    Stale,
    /// 백필 진행 중
    Repairing,
}

impl fmt::Display for FeedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Cold => "cold",
            Self::Warm => "warm",
            Self::Stale => "stale",
            Self::Repairing => "repairing",
        };
        f.write_str(s)
    }
}

/// 새 바를 캐시에 적용한 결과.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyResult {
    /// 같은 기간 갱신 또는 추가
    Applied(GapClass),
    /// 간격 이상. 캐시는 바뀌지 않음
    Gap {
        class: GapClass,
        last_open_ms: i64,
        new_open_ms: i64,
    },
    /// 캐시 없음
    NoCache,
}

#[derive(Debug, Default)]
struct CacheEntry {
    series: Option<Arc<BarSeries>>,
    state: FeedState,
}

/// 프로세스 로컬 캐시 테이블.
#[derive(Debug, Default)]
pub struct CacheTable {
    entries: RwLock<HashMap<SubscriptionKey, CacheEntry>>,
}

impl CacheTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<SubscriptionKey, CacheEntry>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<SubscriptionKey, CacheEntry>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }

    /// 현재 시퀀스 스냅샷.
    pub fn snapshot(&self, key: &SubscriptionKey) -> Option<Arc<BarSeries>> {
        self.read().get(key).and_then(|entry| entry.series.clone())
    }

    pub fn state(&self, key: &SubscriptionKey) -> FeedState {
        self.read()
            .get(key)
            .map(|entry| entry.state)
            .unwrap_or_default()
    }

    pub fn set_state(&self, key: &SubscriptionKey, state: FeedState) {
        self.write().entry(key.clone()).or_default().state = state;
    }

    /// 시퀀스 전체를 한 번에 교체하고 `Warm`으로 전환합니다. 교체된 바 수를 반환합니다.
    pub fn replace(&self, key: &SubscriptionKey, series: BarSeries) -> usize {
        let len = series.len();
        let mut entries = self.write();
        let entry = entries.entry(key.clone()).or_default();
        entry.series = Some(Arc::new(series));
        entry.state = FeedState::Warm;
        len
    }

    /// 새 바를 분류해 `Same`/`Next`면 반영합니다.
    pub fn apply(&self, key: &SubscriptionKey, bar: Bar, retained: usize) -> ApplyResult {
        let mut entries = self.write();
        let Some(series) = entries.get_mut(key).and_then(|entry| entry.series.as_mut()) else {
            return ApplyResult::NoCache;
        };
        let Some(last_open_ms) = series.last().map(Bar::open_time_ms) else {
            return ApplyResult::NoCache;
        };

        let new_open_ms = bar.open_time_ms();
        let step = series.timeframe().step_after(last_open_ms);
        let class = classify_gap(new_open_ms - last_open_ms, step);

        match class {
            GapClass::Same => Arc::make_mut(series).replace_last(bar),
            GapClass::Next => Arc::make_mut(series).push_bounded(bar, retained),
            GapClass::DataGap | GapClass::AbnormalGap => {
                return ApplyResult::Gap {
                    class,
                    last_open_ms,
                    new_open_ms,
                }
            }
        }
        ApplyResult::Applied(class)
    }
}
