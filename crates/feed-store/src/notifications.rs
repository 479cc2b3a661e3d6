//! 구독 저장소 변경 알림.
//!
//! 트리거가 발행하는 `pg_notify` 페이로드를 경계에서 한 번만 해석하여
//! 고정 스키마의 [`StoreNotification`]으로 바꿉니다.

use feed_core::SubscriptionKey;
use serde::Deserialize;
use sqlx::postgres::{PgListener, PgPool};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{DataError, Result};

/// 구독 추가 채널
pub const CHANNEL_ADDED: &str = "subscription_added";
/// 구독 삭제 채널
pub const CHANNEL_REMOVED: &str = "subscription_removed";
/// 전체 재동기화 요청 채널
pub const CHANNEL_RESET: &str = "subscription_reset";
/// 최신 페이로드 갱신 채널
pub const CHANNEL_DATA_UPDATED: &str = "subscription_data_updated";

/// 구독 저장소 변경 알림.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreNotification {
    /// 새 구독 행이 생성됨
    Added(SubscriptionKey),
    /// 구독 행이 삭제됨
    Removed(SubscriptionKey),
    /// 저장소와 실제 구독 상태가 어긋남. 전체 재동기화 필요
    Reset,
    /// 최신 페이로드가 갱신됨
    DataUpdated(SubscriptionKey),
}

#[derive(Debug, Deserialize)]
struct ChangePayload {
    subscription_key: String,
}

/// 채널과 페이로드를 알림으로 해석합니다.
pub fn decode_notification(channel: &str, payload: &str) -> Result<StoreNotification> {
    if channel == CHANNEL_RESET {
        return Ok(StoreNotification::Reset);
    }

    let parsed: ChangePayload = serde_json::from_str(payload)
        .map_err(|e| DataError::notification(channel, e.to_string()))?;
    let key = SubscriptionKey::parse(&parsed.subscription_key)
        .map_err(|e| DataError::notification(channel, e.to_string()))?;

    match channel {
        CHANNEL_ADDED => Ok(StoreNotification::Added(key)),
        CHANNEL_REMOVED => Ok(StoreNotification::Removed(key)),
        CHANNEL_DATA_UPDATED => Ok(StoreNotification::DataUpdated(key)),
        other => Err(DataError::notification(other, "알 수 없는 채널")),
    }
}

/// `PgListener` 기반 알림 스트림.
pub struct NotificationStream {
    listener: PgListener,
}

impl NotificationStream {
    /// 주어진 채널들을 LISTEN 합니다.
    pub async fn listen(pool: &PgPool, channels: &[&str]) -> Result<Self> {
        let mut listener = PgListener::connect_with(pool).await?;
        listener.listen_all(channels.iter().copied()).await?;
        info!(?channels, "알림 수신 시작");
        Ok(Self { listener })
    }

    /// 구독 추가/삭제/reset 채널 (조정기용).
    pub async fn membership(pool: &PgPool) -> Result<Self> {
        Self::listen(pool, &[CHANNEL_ADDED, CHANNEL_REMOVED, CHANNEL_RESET]).await
    }

    /// 페이로드 갱신 채널 (연속성 엔진용).
    pub async fn data_updates(pool: &PgPool) -> Result<Self> {
        Self::listen(pool, &[CHANNEL_DATA_UPDATED]).await
    }

    /// 다음 알림을 기다립니다.
    ///
    /// 해석할 수 없는 알림은 경고 후 건너뜁니다. 수신 연결이 끊겼다가 다시 맺어지면
    /// 그 사이 알림이 유실되었을 수 있으므로 `Reset`을 돌려줍니다.
    pub async fn recv(&mut self) -> Result<StoreNotification> {
        loop {
            let Some(notification) = self.listener.try_recv().await? else {
                warn!("알림 수신 연결 재수립, reset으로 처리");
                return Ok(StoreNotification::Reset);
            };

            match decode_notification(notification.channel(), notification.payload()) {
                Ok(decoded) => {
                    debug!(channel = notification.channel(), "알림 수신");
                    return Ok(decoded);
                }
                Err(e) => warn!(error = %e, "알림 무시"),
            }
        }
    }

    /// 알림을 채널로 전달합니다. 수신자가 닫히거나 수신 오류가 나면 종료합니다.
    pub async fn forward(mut self, tx: mpsc::Sender<StoreNotification>) -> Result<()> {
        loop {
            let notification = self.recv().await?;
            if tx.send(notification).await.is_err() {
                debug!("알림 수신자 종료");
                return Ok(());
            }
        }
    }
}
