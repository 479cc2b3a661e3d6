//! 캔들스틱 데이터를 위한 타임프레임 정의.
//!
//! 하나의 표(`TIMEFRAME_TABLE`)가 정규 토큰과 거래소 토큰 사이의 변환을
//! 양방향으로 담당합니다. 정규 토큰은 대소문자가 아니라 형태로 구분됩니다:
//! 분 단위는 숫자만(`1`, `60`, `240`), 그 이상은 단위 문자를 붙입니다
//! (`1D`, `1W`, `1MO`). 따라서 월봉과 분봉이 혼동될 여지가 없습니다.

use chrono::{DateTime, Datelike, Months, TimeZone, Utc};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::FeedError;

const MINUTE_MS: i64 = 60 * 1000;
const HOUR_MS: i64 = 60 * MINUTE_MS;
const DAY_MS: i64 = 24 * HOUR_MS;

/// 유닉스 epoch(목요일) 이후 첫 월요일까지의 오프셋. 주봉은 월요일 00:00 UTC에 시작합니다.
const WEEK_OFFSET_MS: i64 = 4 * DAY_MS;

/// 캔들스틱 타임프레임.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Timeframe {
    /// 1분봉
    M1,
    /// 3분봉
    M3,
    /// 5분봉
    M5,
    /// 15분봉
    M15,
    /// 30분봉
    M30,
    /// 1시간봉
    H1,
    /// 2시간봉
    H2,
    /// 4시간봉
    H4,
    /// 6시간봉
    H6,
    /// 8시간봉
    H8,
    /// 12시간봉
    H12,
    /// 일봉
    D1,
    /// 3일봉
    D3,
    /// 주봉
    W1,
    /// 월봉
    MN1,
}

/// (타임프레임, 정규 토큰, 바이낸스 토큰)
const TIMEFRAME_TABLE: [(Timeframe, &str, &str); 15] = [
    (Timeframe::M1, "1", "1m"),
    (Timeframe::M3, "3", "3m"),
    (Timeframe::M5, "5", "5m"),
    (Timeframe::M15, "15", "15m"),
    (Timeframe::M30, "30", "30m"),
    (Timeframe::H1, "60", "1h"),
    (Timeframe::H2, "120", "2h"),
    (Timeframe::H4, "240", "4h"),
    (Timeframe::H6, "360", "6h"),
    (Timeframe::H8, "480", "8h"),
    (Timeframe::H12, "720", "12h"),
    (Timeframe::D1, "1D", "1d"),
    (Timeframe::D3, "3D", "3d"),
    (Timeframe::W1, "1W", "1w"),
    (Timeframe::MN1, "1MO", "1M"),
];

impl Timeframe {
    /// 지원하는 모든 타임프레임.
    pub fn all() -> impl Iterator<Item = Timeframe> {
        TIMEFRAME_TABLE.iter().map(|(tf, _, _)| *tf)
    }

    fn entry(&self) -> &'static (Timeframe, &'static str, &'static str) {
        // 표는 모든 variant를 포함하므로 항상 찾을 수 있다
        TIMEFRAME_TABLE
            .iter()
            .find(|(tf, _, _)| tf == self)
            .unwrap_or(&TIMEFRAME_TABLE[0])
    }

    /// 정규 인터벌 토큰 (예: `60`, `1D`, `1MO`).
    pub fn canonical_token(&self) -> &'static str {
        self.entry().1
    }

    /// 정규 인터벌 토큰에서 파싱합니다. 대소문자를 구분하지 않습니다.
    pub fn from_canonical_token(s: &str) -> Option<Self> {
        let upper = s.to_ascii_uppercase();
        TIMEFRAME_TABLE
            .iter()
            .find(|(_, canonical, _)| *canonical == upper)
            .map(|(tf, _, _)| *tf)
    }

    /// 바이낸스 간격 문자열로 변환합니다.
    pub fn to_binance_interval(&self) -> &'static str {
        self.entry().2
    }

    /// 바이낸스 간격 문자열에서 파싱합니다. `1m`(분)과 `1M`(월)은 대소문자로 구분됩니다.
    pub fn from_binance_interval(s: &str) -> Option<Self> {
        TIMEFRAME_TABLE
            .iter()
            .find(|(_, _, native)| *native == s)
            .map(|(tf, _, _)| *tf)
    }

    /// 명목 인터벌 길이 (밀리초). 월봉은 30일 근사값입니다.
    pub fn as_millis(&self) -> i64 {
        match self {
            Timeframe::M1 => MINUTE_MS,
            Timeframe::M3 => 3 * MINUTE_MS,
            Timeframe::M5 => 5 * MINUTE_MS,
            Timeframe::M15 => 15 * MINUTE_MS,
            Timeframe::M30 => 30 * MINUTE_MS,
            Timeframe::H1 => HOUR_MS,
            Timeframe::H2 => 2 * HOUR_MS,
            Timeframe::H4 => 4 * HOUR_MS,
            Timeframe::H6 => 6 * HOUR_MS,
            Timeframe::H8 => 8 * HOUR_MS,
            Timeframe::H12 => 12 * HOUR_MS,
            Timeframe::D1 => DAY_MS,
            Timeframe::D3 => 3 * DAY_MS,
            Timeframe::W1 => 7 * DAY_MS,
            Timeframe::MN1 => 30 * DAY_MS,
        }
    }

    /// 이 타임프레임의 기간을 반환합니다.
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.as_millis() as u64)
    }

    /// `ts_ms`가 속한 기간의 시작 시각 (밀리초).
    ///
    /// 고정 길이 인터벌은 `floor(ts / I) * I`, 주봉은 월요일 기준,
    /// 월봉은 해당 월 1일 00:00 UTC입니다.
    pub fn period_start(&self, ts_ms: i64) -> i64 {
        match self {
            Timeframe::W1 => {
                let interval = self.as_millis();
                (ts_ms - WEEK_OFFSET_MS).div_euclid(interval) * interval + WEEK_OFFSET_MS
            }
            Timeframe::MN1 => month_start(ts_ms),
            _ => {
                let interval = self.as_millis();
                ts_ms.div_euclid(interval) * interval
            }
        }
    }

    /// `open_ms`에 시작한 바의 다음 바 시작 시각.
    pub fn next_open(&self, open_ms: i64) -> i64 {
        match self {
            Timeframe::MN1 => {
                let start = month_start(open_ms);
                DateTime::<Utc>::from_timestamp_millis(start)
                    .and_then(|dt| dt.checked_add_months(Months::new(1)))
                    .map(|dt| dt.timestamp_millis())
                    .unwrap_or(open_ms + self.as_millis())
            }
            _ => open_ms + self.as_millis(),
        }
    }

    /// 가장 최근에 마감된 기간의 시작 시각.
    ///
    /// 고정 길이 인터벌에서는 `floor(now / I) * I - I`입니다.
    pub fn previous_period_open(&self, now_ms: i64) -> i64 {
        let current = self.period_start(now_ms);
        match self {
            Timeframe::MN1 => month_start(current - 1),
            _ => current - self.as_millis(),
        }
    }

    /// `open_ms` 다음 바까지의 간격 (밀리초). 고정 길이 인터벌에서는 `I`와 같습니다.
    pub fn step_after(&self, open_ms: i64) -> i64 {
        self.next_open(open_ms) - open_ms
    }
}

fn month_start(ts_ms: i64) -> i64 {
    DateTime::<Utc>::from_timestamp_millis(ts_ms)
        .and_then(|dt| {
            Utc.with_ymd_and_hms(dt.year(), dt.month(), 1, 0, 0, 0)
                .single()
        })
        .map(|dt| dt.timestamp_millis())
        .unwrap_or(ts_ms)
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.canonical_token())
    }
}

impl FromStr for Timeframe {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_canonical_token(s).ok_or_else(|| FeedError::UnsupportedInterval(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeframe_millis() {
        assert_eq!(Timeframe::M1.as_millis(), 60_000);
        assert_eq!(Timeframe::H1.as_millis(), 3_600_000);
        assert_eq!(Timeframe::D1.duration().as_secs(), 86_400);
    }

    #[test]
    fn test_token_tables_are_reversible() {
        for tf in Timeframe::all() {
            assert_eq!(Timeframe::from_canonical_token(tf.canonical_token()), Some(tf));
            assert_eq!(Timeframe::from_binance_interval(tf.to_binance_interval()), Some(tf));
        }
    }

    #[test]
    fn test_month_and_minute_are_distinct() {
        assert_eq!(Timeframe::from_binance_interval("1m"), Some(Timeframe::M1));
        assert_eq!(Timeframe::from_binance_interval("1M"), Some(Timeframe::MN1));
        assert_eq!(Timeframe::from_canonical_token("1mo"), Some(Timeframe::MN1));
        // "1M"은 정규 토큰이 아니다
        assert_eq!(Timeframe::from_canonical_token("1M"), None);
        assert_eq!(Timeframe::from_canonical_token("1m"), None);
        assert!("1M".parse::<Timeframe>().is_err());
    }

    #[test]
    fn test_previous_period_open_fixed() {
        // 2024-01-01T01:30:00Z
        let now = 1_704_072_600_000;
        assert_eq!(Timeframe::H1.previous_period_open(now), 1_704_067_200_000);
        assert_eq!(Timeframe::M15.previous_period_open(now), 1_704_071_700_000);

        let interval = Timeframe::H4.as_millis();
        assert_eq!(
            Timeframe::H4.previous_period_open(now),
            (now / interval) * interval - interval
        );
    }

    #[test]
    fn test_week_starts_on_monday() {
        // 2024-01-03 (수) 12:00 UTC → 2024-01-01 (월) 00:00 UTC
        let wed = 1_704_283_200_000;
        assert_eq!(Timeframe::W1.period_start(wed), 1_704_067_200_000);
        assert_eq!(Timeframe::W1.previous_period_open(wed), 1_703_462_400_000);
    }

    #[test]
    fn test_month_boundaries() {
        // 2024-03-15T00:00:00Z
        let mid_march = 1_710_460_800_000;
        let march_1 = 1_709_251_200_000;
        let feb_1 = 1_706_745_600_000;
        assert_eq!(Timeframe::MN1.period_start(mid_march), march_1);
        assert_eq!(Timeframe::MN1.previous_period_open(mid_march), feb_1);
        assert_eq!(Timeframe::MN1.next_open(feb_1), march_1);
        // 2024년 2월은 29일
        assert_eq!(Timeframe::MN1.step_after(feb_1), 29 * DAY_MS);
    }
}
