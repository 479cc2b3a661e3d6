//! 스트림 라우터 (Stream Router).
//!
//! 거래소 연결에서 들어온 푸시 프레임마다 정규 구독 키를 하나 만들고
//! 그 키의 최신 값을 저장소에 덮어씁니다.

use feed_core::SubscriptionKey;
use feed_exchange::{from_exchange_stream, parse_push_frame, ExchangeError, PushFrame, RawFrame, StreamEvent};
use feed_store::FrameSink;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::stats::RouterStats;

/// 통계 로그 주기
const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// 프레임 하나의 처리 결과.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// 키의 최신 값을 기록함
    Written(SubscriptionKey),
    /// 구독 행이 없어 버림
    Orphaned(SubscriptionKey),
    /// 구독 응답
    Ack,
    /// 분류/변환/기록 실패로 버림
    Dropped,
}

/// 스트림 라우터.
pub struct Router {
    sink: Arc<dyn FrameSink>,
    stats: RouterStats,
}

impl Router {
    /// 새 라우터를 생성합니다.
    pub fn new(sink: Arc<dyn FrameSink>) -> Self {
        Self {
            sink,
            stats: RouterStats::default(),
        }
    }

    /// 누적 통계.
    pub fn stats(&self) -> RouterStats {
        self.stats
    }

    /// 프레임 하나를 라우팅합니다. 어떤 실패도 호출자에게 전파하지 않습니다.
    pub async fn route(&mut self, frame: &RawFrame) -> RouteOutcome {
        let event = match parse_push_frame(&frame.text) {
            Ok(PushFrame::Event(event)) => event,
            Ok(PushFrame::Ack { id, error }) => {
                if error {
                    warn!(connection = %frame.connection, id, "구독 요청 오류 응답");
                } else {
                    trace!(connection = %frame.connection, id, "구독 응답");
                }
                self.stats.acks += 1;
                return RouteOutcome::Ack;
            }
            Err(ExchangeError::UnknownEvent(event_type)) => {
                warn!(connection = %frame.connection, event_type = %event_type, "알 수 없는 이벤트 타입, 프레임 무시");
                self.stats.dropped_unknown += 1;
                return RouteOutcome::Dropped;
            }
            Err(e) => {
                warn!(connection = %frame.connection, error = %e, "프레임 파싱 실패");
                self.stats.errors += 1;
                return RouteOutcome::Dropped;
            }
        };

        // 파생상품 접미사는 프레임이 도착한 연결에서 복원
        let key = match from_exchange_stream(&event.stream_name(), frame.connection) {
            Ok(key) => key,
            Err(e) => {
                warn!(connection = %frame.connection, stream = %event.stream_name(), error = %e, "스트림 이름 변환 실패");
                self.stats.errors += 1;
                return RouteOutcome::Dropped;
            }
        };

        let event_time = event.event_time.or(Some(frame.received_at));
        match self.sink.write_latest(&key, &event.payload, event_time).await {
            Ok(true) => {
                trace!(key = %key, "최신 값 기록");
                self.stats.routed += 1;
                RouteOutcome::Written(key)
            }
            Ok(false) => {
                debug!(key = %key, "구독 행 없음, 프레임 무시");
                self.stats.dropped_orphan += 1;
                RouteOutcome::Orphaned(key)
            }
            Err(e) => {
                warn!(key = %key, error = %e, "최신 값 기록 실패");
                self.stats.errors += 1;
                RouteOutcome::Dropped
            }
        }
    }

    /// 연결 이벤트를 처리하는 루프.
    ///
    /// 끊김 이후 재연결되면 `resync`로 조정기에 전체 재동기화를 요청합니다.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<StreamEvent>,
        resync: Arc<Notify>,
        cancel: CancellationToken,
    ) -> RouterStats {
        let mut stats_ticker = tokio::time::interval(STATS_INTERVAL);
        stats_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        stats_ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(StreamEvent::Frame(frame)) => {
                        self.route(&frame).await;
                    }
                    Some(StreamEvent::Disconnected(connection)) => {
                        warn!(connection = %connection, "거래소 연결 끊김");
                    }
                    Some(StreamEvent::Reconnected(connection)) => {
                        info!(connection = %connection, "거래소 재연결, 전체 재동기화 요청");
                        resync.notify_one();
                    }
                    None => {
                        warn!("스트림 이벤트 채널 종료");
                        break;
                    }
                },
                _ = stats_ticker.tick() => self.stats.log_summary(),
            }
        }

        self.stats.log_summary();
        info!("스트림 라우터 종료");
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use feed_exchange::ConnectionId;
    use serde_json::Value;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// 미리 만든 행에만 기록하는 메모리 싱크
    #[derive(Default)]
    struct MemorySink {
        rows: Mutex<HashMap<SubscriptionKey, (Value, Option<DateTime<Utc>>)>>,
    }

    impl MemorySink {
        fn with_rows(keys: &[&str]) -> Self {
            let sink = Self::default();
            {
                let mut rows = sink.rows.lock().unwrap();
                for key in keys {
                    rows.insert(SubscriptionKey::parse(key).unwrap(), (Value::Null, None));
                }
            }
            sink
        }
    }

    #[async_trait]
    impl FrameSink for MemorySink {
        async fn write_latest(
            &self,
            key: &SubscriptionKey,
            data: &Value,
            event_time: Option<DateTime<Utc>>,
        ) -> feed_store::Result<bool> {
            let mut rows = self.rows.lock().unwrap();
            match rows.get_mut(key) {
                Some(row) => {
                    *row = (data.clone(), event_time);
                    Ok(true)
                }
                None => Ok(false),
            }
        }
    }

    fn frame(connection: ConnectionId, text: &str) -> RawFrame {
        RawFrame {
            connection,
            text: text.to_string(),
            received_at: DateTime::from_timestamp_millis(1_704_067_200_000).unwrap(),
        }
    }

    const KLINE_FRAME: &str = r#"{"e":"kline","E":1704067260000,"s":"BTCUSDT","k":{"t":1704067200000,"T":1704070799999,"s":"BTCUSDT","i":"1h","o":"42000.1","h":"42100.0","l":"41900.5","c":"42050.0","v":"12.5","x":false}}"#;

    #[tokio::test]
    async fn test_route_restores_suffix_from_connection() {
        let sink = Arc::new(MemorySink::with_rows(&["BINANCE:BTCUSDT.P@KLINE_60"]));
        let mut router = Router::new(sink.clone());

        let outcome = router
            .route(&frame(ConnectionId::BINANCE_PERPETUAL, KLINE_FRAME))
            .await;
        let key = SubscriptionKey::parse("BINANCE:BTCUSDT.P@KLINE_60").unwrap();
        assert_eq!(outcome, RouteOutcome::Written(key.clone()));

        let rows = sink.rows.lock().unwrap();
        let (data, event_time) = rows.get(&key).unwrap();
        assert_eq!(data["k"]["i"], "1h");
        assert_eq!(event_time.unwrap().timestamp_millis(), 1_704_067_260_000);
    }

    #[tokio::test]
    async fn test_route_orphan_is_not_created() {
        let sink = Arc::new(MemorySink::default());
        let mut router = Router::new(sink.clone());

        let outcome = router.route(&frame(ConnectionId::BINANCE_SPOT, KLINE_FRAME)).await;
        assert!(matches!(outcome, RouteOutcome::Orphaned(_)));
        assert!(sink.rows.lock().unwrap().is_empty());
        assert_eq!(router.stats().dropped_orphan, 1);
    }

    #[tokio::test]
    async fn test_route_unknown_and_malformed_frames() {
        let sink = Arc::new(MemorySink::default());
        let mut router = Router::new(sink);

        let unknown = r#"{"e":"depthUpdate","E":1,"s":"BTCUSDT"}"#;
        assert_eq!(
            router.route(&frame(ConnectionId::BINANCE_SPOT, unknown)).await,
            RouteOutcome::Dropped
        );
        assert_eq!(
            router.route(&frame(ConnectionId::BINANCE_SPOT, "not json")).await,
            RouteOutcome::Dropped
        );
        assert_eq!(
            router
                .route(&frame(ConnectionId::BINANCE_SPOT, r#"{"result":null,"id":7}"#))
                .await,
            RouteOutcome::Ack
        );

        let stats = router.stats();
        assert_eq!(stats.dropped_unknown, 1);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.acks, 1);
        assert_eq!(stats.total(), 3);
    }

    #[tokio::test]
    async fn test_event_time_falls_back_to_receive_time() {
        let sink = Arc::new(MemorySink::with_rows(&["BINANCE:ETHUSDT@TRADE"]));
        let mut router = Router::new(sink.clone());

        let trade = r#"{"e":"trade","s":"ETHUSDT","t":1,"p":"2300.5","q":"0.1","T":1704067200000}"#;
        let outcome = router.route(&frame(ConnectionId::BINANCE_SPOT, trade)).await;
        assert!(matches!(outcome, RouteOutcome::Written(_)));

        let key = SubscriptionKey::parse("BINANCE:ETHUSDT@TRADE").unwrap();
        let rows = sink.rows.lock().unwrap();
        assert_eq!(
            rows.get(&key).unwrap().1.unwrap().timestamp_millis(),
            1_704_067_200_000
        );
    }
}
