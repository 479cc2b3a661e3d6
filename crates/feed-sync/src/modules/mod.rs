//! 동기화 서비스 모듈.

pub mod continuity;
pub mod reconciler;
pub mod router;
