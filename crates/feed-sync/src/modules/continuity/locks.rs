//! 키별 채우기 락.

use feed_core::SubscriptionKey;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

/// 채우기 루프의 단일 실행을 보장하는 키별 락 테이블.
///
/// 크기가 `max_entries`에 도달하면 아무도 잡고 있지 않은 락부터 제거합니다.
#[derive(Debug)]
pub struct FillLocks {
    max_entries: usize,
    table: Mutex<HashMap<SubscriptionKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl FillLocks {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries: max_entries.max(1),
            table: Mutex::new(HashMap::new()),
        }
    }

    /// 락을 즉시 얻으면 guard를, 이미 잡혀 있으면 `None`을 반환합니다.
    pub fn try_acquire(&self, key: &SubscriptionKey) -> Option<OwnedMutexGuard<()>> {
        let lock = {
            let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
            if !table.contains_key(key) && table.len() >= self.max_entries {
                let before = table.len();
                // 테이블 밖에서 참조가 없으면 잡혀 있지 않은 락
                table.retain(|_, lock| Arc::strong_count(lock) > 1);
                debug!(evicted = before - table.len(), "유휴 채우기 락 정리");
                if table.len() >= self.max_entries {
                    warn!(entries = table.len(), "채우기 락 테이블이 가득 참");
                }
            }
            Arc::clone(
                table
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
            )
        };

        lock.try_lock_owned().ok()
    }

    /// 키의 락이 잡혀 있는지.
    pub fn is_held(&self, key: &SubscriptionKey) -> bool {
        let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table
            .get(key)
            .map(|lock| lock.try_lock().is_err())
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.table.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
