//! 파이프라인 전반에서 사용되는 공통 타입.

mod bar;
mod subscription;
mod timeframe;

pub use bar::*;
pub use subscription::*;
pub use timeframe::*;
