//! OHLCV 바 정의.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::timeframe::Timeframe;

/// 하나의 기간을 요약한 OHLCV 바.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bar {
    /// 바 시작 시간
    pub open_time: DateTime<Utc>,
    /// 시가
    pub open: Decimal,
    /// 고가
    pub high: Decimal,
    /// 저가
    pub low: Decimal,
    /// 종가
    pub close: Decimal,
    /// 거래량 (기준 자산 단위)
    pub volume: Decimal,
    /// 바 종료 시간
    pub close_time: DateTime<Utc>,
    /// 기간 마감 여부
    #[serde(default)]
    pub closed: bool,
}

impl Bar {
    /// 시작 시간 (epoch 밀리초).
    pub fn open_time_ms(&self) -> i64 {
        self.open_time.timestamp_millis()
    }
}

/// 바 시퀀스가 `timeframe` 간격으로 빈틈없이 이어지는지 확인합니다.
///
/// 빈 시퀀스와 바 하나짜리 시퀀스는 연속으로 봅니다.
pub fn is_contiguous(bars: &[Bar], timeframe: Timeframe) -> bool {
    bars.windows(2)
        .all(|pair| timeframe.next_open(pair[0].open_time_ms()) == pair[1].open_time_ms())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn bar_at(ms: i64) -> Bar {
        let open_time = DateTime::from_timestamp_millis(ms).unwrap();
        Bar {
            open_time,
            open: dec!(100),
            high: dec!(110),
            low: dec!(90),
            close: dec!(105),
            volume: dec!(1.5),
            close_time: open_time,
            closed: true,
        }
    }

    #[test]
    fn test_contiguous() {
        let hour = Timeframe::H1.as_millis();
        let start = 1_704_067_200_000;
        let bars: Vec<Bar> = (0..5).map(|i| bar_at(start + i * hour)).collect();
        assert!(is_contiguous(&bars, Timeframe::H1));
        assert!(!is_contiguous(&bars, Timeframe::M30));

        let mut holed = bars.clone();
        holed.remove(2);
        assert!(!is_contiguous(&holed, Timeframe::H1));

        assert!(is_contiguous(&bars[..1], Timeframe::H1));
        assert!(is_contiguous(&[], Timeframe::H1));
    }

    #[test]
    fn test_duplicate_is_not_contiguous() {
        let start = 1_704_067_200_000;
        let bars = vec![bar_at(start), bar_at(start)];
        assert!(!is_contiguous(&bars, Timeframe::H1));
    }
}
