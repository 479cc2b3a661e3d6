//! 바 간격 분류.

use std::fmt;

/// 캐시 마지막 바와 새 바 사이 간격의 분류.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GapClass {
    /// 같은 기간. 마지막 바를 갱신
    Same,
    /// 바로 다음 기간. 끝에 추가
    Next,
    /// 1.5 간격을 초과하는 누락
    DataGap,
    /// 음수이거나 정상 간격이 아닌 나머지 모든 경우
    AbnormalGap,
}

impl GapClass {
    /// 백필이 필요한지.
    pub fn needs_repair(&self) -> bool {
        matches!(self, Self::DataGap | Self::AbnormalGap)
    }

    /// 로그용 이름
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Same => "same",
            Self::Next => "next",
            Self::DataGap => "data_gap",
            Self::AbnormalGap => "abnormal_gap",
        }
    }
}

impl fmt::Display for GapClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `gap`(밀리초)을 기대 간격 `step`으로 분류합니다.
///
/// `DataGap`은 `gap > 1.5 * step`을 엄격하게 만족해야 합니다. 정수 비교(`2 * gap > 3 * step`)로
/// 판정하며 오버플로를 피하려고 i128로 계산합니다.
pub fn classify_gap(gap: i64, step: i64) -> GapClass {
    if gap == 0 {
        GapClass::Same
    } else if gap == step {
        GapClass::Next
    } else if 2 * i128::from(gap) > 3 * i128::from(step) {
        GapClass::DataGap
    } else {
        GapClass::AbnormalGap
    }
}
