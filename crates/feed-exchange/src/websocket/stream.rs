//! Binance용 WebSocket 스트림 구현.
//!
//! 소켓은 백그라운드 연결 태스크가 소유하고, 호출자는 명령 채널로 구독/해제/재연결을
//! 요청합니다. 수신 프레임과 연결 상태 변화는 `StreamEvent`로 내보냅니다.
//!
//! - 라이브 스트림 집합을 추적하여 이미 구독 중인 스트림은 다시 보내지 않습니다.
//! - 요청은 `max_streams_per_request` 단위로 나눠 전송합니다.
//! - 예기치 않은 끊김 후 재연결하면 라이브 집합은 비어 있고 `Reconnected`를 내보냅니다.
//!   호출자가 요청한 재연결은 이벤트를 내보내지 않습니다.

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

use crate::connector::binance::BinanceStreamConfig;
use crate::traits::{ConnectionId, ExchangeResult, RawFrame, StreamConnection, StreamEvent};
use crate::ExchangeError;

/// 명령 채널 버퍼 크기.
const COMMAND_BUFFER: usize = 64;

/// 단일 연결 시도 타임아웃.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

// ============================================================================
// WebSocket 메시지 타입
// ============================================================================

/// 구독 요청 방향.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    Subscribe,
    Unsubscribe,
}

impl Method {
    fn as_str(&self) -> &'static str {
        match self {
            Method::Subscribe => "SUBSCRIBE",
            Method::Unsubscribe => "UNSUBSCRIBE",
        }
    }
}

/// Binance WebSocket 구독 메시지.
#[derive(Debug, Serialize)]
struct SubscribeMessage<'a> {
    method: &'static str,
    params: &'a [String],
    id: u64,
}

/// 라이브 집합을 기준으로 실제로 보낼 스트림을 골라 요청 단위로 나눕니다.
///
/// 구독은 라이브가 아닌 스트림만, 해제는 라이브인 스트림만 남기며 중복은 제거합니다.
fn plan_batches(
    live: &HashSet<String>,
    streams: Vec<String>,
    method: Method,
    max_per_request: usize,
) -> Vec<Vec<String>> {
    let mut seen = HashSet::new();
    let pending: Vec<String> = streams
        .into_iter()
        .filter(|s| match method {
            Method::Subscribe => !live.contains(s),
            Method::Unsubscribe => live.contains(s),
        })
        .filter(|s| seen.insert(s.clone()))
        .collect();

    pending
        .chunks(max_per_request.max(1))
        .map(|chunk| chunk.to_vec())
        .collect()
}

// ============================================================================
// 연결 태스크
// ============================================================================

enum Command {
    Subscribe {
        streams: Vec<String>,
        reply: oneshot::Sender<ExchangeResult<usize>>,
    },
    Unsubscribe {
        streams: Vec<String>,
        reply: oneshot::Sender<ExchangeResult<usize>>,
    },
    Reconnect {
        reply: oneshot::Sender<ExchangeResult<()>>,
    },
    Shutdown,
}

/// 한 소켓 세션이 끝난 이유.
enum SessionEnd {
    Shutdown,
    Dropped(String),
    Reconnect(oneshot::Sender<ExchangeResult<()>>),
}

struct ConnectionTask {
    id: ConnectionId,
    url: String,
    config: BinanceStreamConfig,
    commands: mpsc::Receiver<Command>,
    events: mpsc::Sender<StreamEvent>,
    live: Arc<RwLock<HashSet<String>>>,
    message_id: u64,
}

impl ConnectionTask {
    async fn run(mut self) {
        let mut pending_reconnects: Vec<oneshot::Sender<ExchangeResult<()>>> = Vec::new();
        let mut delay = None;
        let mut announce = false;

        loop {
            let Some(ws) = self.connect_with_retry(delay, &mut pending_reconnects).await else {
                break;
            };
            self.live.write().await.clear();
            info!(connection = %self.id, url = %self.url, "WebSocket 연결됨");

            for reply in pending_reconnects.drain(..) {
                // 요청자가 기다리다 포기했으면 재동기화를 다시 받도록 알린다
                if reply.send(Ok(())).is_err() {
                    announce = true;
                }
            }
            if announce {
                announce = false;
                if self.events.send(StreamEvent::Reconnected(self.id)).await.is_err() {
                    break;
                }
            }

            match self.session(ws).await {
                SessionEnd::Shutdown => break,
                SessionEnd::Reconnect(reply) => {
                    info!(connection = %self.id, "요청에 따라 재연결");
                    pending_reconnects.push(reply);
                    delay = None;
                }
                SessionEnd::Dropped(reason) => {
                    warn!(connection = %self.id, reason = %reason, "WebSocket 연결 끊김");
                    self.live.write().await.clear();
                    if self.events.send(StreamEvent::Disconnected(self.id)).await.is_err() {
                        break;
                    }
                    announce = true;
                    delay = Some(self.config.reconnect_delay);
                }
            }
        }

        self.live.write().await.clear();
        for reply in pending_reconnects {
            let _ = reply.send(Err(ExchangeError::ChannelClosed(self.id.to_string())));
        }
        info!(connection = %self.id, "연결 태스크 종료");
    }

    /// 연결될 때까지 재시도합니다. 종료 요청을 받으면 `None`.
    async fn connect_with_retry(
        &mut self,
        mut delay: Option<Duration>,
        pending: &mut Vec<oneshot::Sender<ExchangeResult<()>>>,
    ) -> Option<WsStream> {
        let mut attempt: u32 = 0;
        loop {
            if let Some(delay) = delay {
                if !self.wait_offline(delay, pending).await {
                    return None;
                }
            }
            attempt += 1;

            match tokio::time::timeout(CONNECT_TIMEOUT, connect_async(self.url.as_str())).await {
                Ok(Ok((ws, _))) => return Some(ws),
                Ok(Err(e)) => {
                    warn!(connection = %self.id, attempt, error = %e, "WebSocket 연결 실패");
                }
                Err(_) => {
                    warn!(connection = %self.id, attempt, "WebSocket 연결 타임아웃");
                }
            }
            delay = Some(self.config.reconnect_delay);
        }
    }

    /// 연결이 없는 동안 대기하며 명령을 처리합니다. 종료 요청을 받으면 `false`.
    async fn wait_offline(
        &mut self,
        delay: Duration,
        pending: &mut Vec<oneshot::Sender<ExchangeResult<()>>>,
    ) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                cmd = self.commands.recv() => match cmd {
                    None | Some(Command::Shutdown) => return false,
                    Some(Command::Subscribe { reply, .. })
                    | Some(Command::Unsubscribe { reply, .. }) => {
                        let _ = reply.send(Err(ExchangeError::Disconnected(format!(
                            "{} 재연결 대기 중",
                            self.id
                        ))));
                    }
                    Some(Command::Reconnect { reply }) => pending.push(reply),
                },
            }
        }
    }

    async fn session(&mut self, ws: WsStream) -> SessionEnd {
        let (mut write, mut read): (WsSink, WsSource) = ws.split();
        let mut ping = tokio::time::interval(self.config.ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // 첫 tick은 즉시 완료된다
        ping.tick().await;

        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    None | Some(Command::Shutdown) => {
                        let _ = write.send(Message::Close(None)).await;
                        return SessionEnd::Shutdown;
                    }
                    Some(Command::Subscribe { streams, reply }) => {
                        let result = self.send_batches(&mut write, Method::Subscribe, streams).await;
                        let failure = result.as_ref().err().map(|e| e.to_string());
                        let _ = reply.send(result);
                        if let Some(reason) = failure {
                            return SessionEnd::Dropped(reason);
                        }
                    }
                    Some(Command::Unsubscribe { streams, reply }) => {
                        let result = self.send_batches(&mut write, Method::Unsubscribe, streams).await;
                        let failure = result.as_ref().err().map(|e| e.to_string());
                        let _ = reply.send(result);
                        if let Some(reason) = failure {
                            return SessionEnd::Dropped(reason);
                        }
                    }
                    Some(Command::Reconnect { reply }) => {
                        let _ = write.send(Message::Close(None)).await;
                        return SessionEnd::Reconnect(reply);
                    }
                },
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        let frame = RawFrame {
                            connection: self.id,
                            text,
                            received_at: Utc::now(),
                        };
                        if self.events.send(StreamEvent::Frame(frame)).await.is_err() {
                            error!(connection = %self.id, "이벤트 수신자가 종료됨");
                            let _ = write.send(Message::Close(None)).await;
                            return SessionEnd::Shutdown;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        debug!(connection = %self.id, "Received ping");
                        if let Err(e) = write.send(Message::Pong(data)).await {
                            return SessionEnd::Dropped(e.to_string());
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        return SessionEnd::Dropped(format!("서버가 연결 종료: {:?}", frame));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return SessionEnd::Dropped(e.to_string()),
                    None => return SessionEnd::Dropped("스트림 종료".to_string()),
                },
                _ = ping.tick() => {
                    if let Err(e) = write.send(Message::Ping(Vec::new())).await {
                        return SessionEnd::Dropped(e.to_string());
                    }
                }
            }
        }
    }

    async fn send_batches(
        &mut self,
        write: &mut WsSink,
        method: Method,
        streams: Vec<String>,
    ) -> ExchangeResult<usize> {
        let batches = {
            let live = self.live.read().await;
            plan_batches(&live, streams, method, self.config.max_streams_per_request)
        };

        let mut sent = 0;
        for batch in batches {
            let msg = SubscribeMessage {
                method: method.as_str(),
                params: &batch,
                id: self.next_message_id(),
            };
            let json = serde_json::to_string(&msg)?;
            write.send(Message::Text(json.into())).await?;

            let mut live = self.live.write().await;
            for stream in &batch {
                match method {
                    Method::Subscribe => live.insert(stream.clone()),
                    Method::Unsubscribe => live.remove(stream),
                };
            }
            sent += batch.len();
            debug!(connection = %self.id, method = method.as_str(), count = batch.len(), "요청 전송");
        }

        Ok(sent)
    }

    fn next_message_id(&mut self) -> u64 {
        self.message_id += 1;
        self.message_id
    }
}

// ============================================================================
// Binance 스트림 클라이언트
// ============================================================================

/// Binance WebSocket 스트림 클라이언트 (현물 또는 USD-M 선물 중 하나).
pub struct BinanceStreamClient {
    id: ConnectionId,
    commands: mpsc::Sender<Command>,
    live: Arc<RwLock<HashSet<String>>>,
}

impl BinanceStreamClient {
    /// 연결 태스크를 시작합니다. 연결은 백그라운드에서 맺어집니다.
    pub fn spawn(
        id: ConnectionId,
        config: &BinanceStreamConfig,
        events: mpsc::Sender<StreamEvent>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let live = Arc::new(RwLock::new(HashSet::new()));

        let task = ConnectionTask {
            id,
            url: config.ws_url(id).to_string(),
            config: config.clone(),
            commands: command_rx,
            events,
            live: Arc::clone(&live),
            message_id: 0,
        };
        tokio::spawn(task.run());

        Self {
            id,
            commands: command_tx,
            live,
        }
    }

    /// 관리 대상 연결 전체(현물, 선물)에 대한 클라이언트를 시작합니다.
    pub fn spawn_all(
        config: &BinanceStreamConfig,
        events: mpsc::Sender<StreamEvent>,
    ) -> Vec<Self> {
        config
            .connections()
            .into_iter()
            .map(|id| Self::spawn(id, config, events.clone()))
            .collect()
    }

    /// 연결 태스크를 종료합니다.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<ExchangeResult<T>>) -> Command,
    ) -> ExchangeResult<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| ExchangeError::ChannelClosed(self.id.to_string()))?;
        rx.await
            .map_err(|_| ExchangeError::ChannelClosed(self.id.to_string()))?
    }
}

#[async_trait]
impl StreamConnection for BinanceStreamClient {
    fn id(&self) -> ConnectionId {
        self.id
    }

    async fn subscribe(&self, streams: Vec<String>) -> ExchangeResult<usize> {
        if streams.is_empty() {
            return Ok(0);
        }
        self.request(|reply| Command::Subscribe { streams, reply })
            .await
    }

    async fn unsubscribe(&self, streams: Vec<String>) -> ExchangeResult<usize> {
        if streams.is_empty() {
            return Ok(0);
        }
        self.request(|reply| Command::Unsubscribe { streams, reply })
            .await
    }

    async fn reconnect(&self) -> ExchangeResult<()> {
        self.request(|reply| Command::Reconnect { reply }).await
    }

    async fn live_streams(&self) -> HashSet<String> {
        self.live.read().await.clone()
    }
}
