//! 연속성 엔진과 구성 요소.

pub mod cache;
pub mod engine;
pub mod fill;
pub mod gap;
pub mod locks;

pub use cache::{BarSeries, FeedState};
pub use engine::{Clock, ContinuityEngine, RepairReason, SystemClock, UpdateDecision};
pub use fill::{validate_candidate, FillOutcome, Rejection};
pub use gap::{classify_gap, GapClass};
pub use locks::FillLocks;
