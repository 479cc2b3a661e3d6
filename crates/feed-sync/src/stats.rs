//! 서비스 통계 구조체.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// 조정기 플러시/재동기화 통계
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileStats {
    /// 새로 구독한 스트림 수
    pub subscribed: usize,
    /// 해제한 스트림 수
    pub unsubscribed: usize,
    /// 전달에 실패한 키 수
    pub failed: usize,
}

impl ReconcileStats {
    /// 변화가 없었는지
    pub fn is_empty(&self) -> bool {
        self.subscribed == 0 && self.unsubscribed == 0 && self.failed == 0
    }

    /// 다른 통계를 더합니다.
    pub fn merge(&mut self, other: ReconcileStats) {
        self.subscribed += other.subscribed;
        self.unsubscribed += other.unsubscribed;
        self.failed += other.failed;
    }

    /// 통계 요약 로그 출력
    pub fn log_summary(&self, operation: &str) {
        tracing::info!(
            operation = operation,
            subscribed = self.subscribed,
            unsubscribed = self.unsubscribed,
            failed = self.failed,
            "구독 조정 완료"
        );
    }
}

/// 라우터 처리 통계
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RouterStats {
    /// 저장소에 기록한 프레임 수
    pub routed: u64,
    /// 구독 응답 프레임 수
    pub acks: u64,
    /// 알 수 없는 이벤트 타입으로 버린 프레임 수
    pub dropped_unknown: u64,
    /// 구독 행이 없어 버린 프레임 수
    pub dropped_orphan: u64,
    /// 파싱/키 변환/기록 에러 수
    pub errors: u64,
}

impl RouterStats {
    /// 처리한 전체 프레임 수
    pub fn total(&self) -> u64 {
        self.routed + self.acks + self.dropped_unknown + self.dropped_orphan + self.errors
    }

    /// 통계 요약 로그 출력
    pub fn log_summary(&self) {
        tracing::info!(
            total = self.total(),
            routed = self.routed,
            acks = self.acks,
            dropped_unknown = self.dropped_unknown,
            dropped_orphan = self.dropped_orphan,
            errors = self.errors,
            "라우터 통계"
        );
    }
}

/// 백필 채우기 통계. 여러 채우기 태스크가 함께 갱신합니다.
#[derive(Debug, Default)]
pub struct FillStats {
    /// 제출한 백필 작업 수
    pub submitted: AtomicU64,
    /// 검증을 통과해 캐시를 교체한 횟수
    pub filled: AtomicU64,
    /// 검증에 실패한 후보 수
    pub rejected: AtomicU64,
    /// 완료 대기 타임아웃 수
    pub timeouts: AtomicU64,
    /// 실행기가 실패로 끝낸 작업 수
    pub failed_tasks: AtomicU64,
    /// 최대 시도 횟수를 모두 쓴 채우기 루프 수
    pub exhausted: AtomicU64,
}

impl FillStats {
    /// 카운터를 1 증가시킵니다.
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// 현재 값
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// 통계 요약 로그 출력
    pub fn log_summary(&self) {
        tracing::info!(
            submitted = Self::get(&self.submitted),
            filled = Self::get(&self.filled),
            rejected = Self::get(&self.rejected),
            timeouts = Self::get(&self.timeouts),
            failed_tasks = Self::get(&self.failed_tasks),
            exhausted = Self::get(&self.exhausted),
            "백필 통계"
        );
    }
}
