//! 설정 관리.
//!
//! 이 모듈은 파이프라인 서비스들의 설정을 정의하고 로드합니다.
//! 모든 필드는 기본값을 가지므로 설정 파일은 바꾸고 싶은 값만 담으면 됩니다.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::FeedResult;

/// 애플리케이션 설정.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    /// 데이터베이스 설정
    pub database: DatabaseConfig,
    /// 거래소 스트림 설정
    pub exchange: ExchangeConfig,
    /// 구독 조정기 설정
    pub reconciler: ReconcilerConfig,
    /// 연속성 엔진 설정
    pub continuity: ContinuityConfig,
    /// 로깅 설정
    pub logging: LoggingConfig,
}

/// 데이터베이스 설정.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// 연결 URL (`DATABASE_URL`이 있으면 우선)
    pub url: String,
    /// 공유 풀 최대 연결 수
    pub max_connections: u32,
    /// 풀에서 연결을 얻기까지의 타임아웃 (초)
    pub acquire_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/feed".to_string(),
            max_connections: 10,
            acquire_timeout_secs: 30,
        }
    }
}

impl DatabaseConfig {
    /// 풀 연결 획득 타임아웃.
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

/// 거래소 WebSocket 스트림 설정.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ExchangeConfig {
    /// 현물 스트림 URL
    pub spot_ws_url: String,
    /// USD-M 무기한 선물 스트림 URL
    pub futures_ws_url: String,
    /// 연결이 끊겼을 때 재연결까지 대기 시간 (초)
    pub reconnect_delay_secs: u64,
    /// SUBSCRIBE 메시지 하나에 담을 최대 스트림 수
    pub max_streams_per_request: usize,
    /// 클라이언트 Ping 간격 (초)
    pub ping_interval_secs: u64,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            spot_ws_url: "wss://stream.binance.com:9443/ws".to_string(),
            futures_ws_url: "wss://fstream.binance.com/ws".to_string(),
            reconnect_delay_secs: 5,
            max_streams_per_request: 200,
            ping_interval_secs: 30,
        }
    }
}

impl ExchangeConfig {
    /// 재연결 대기 시간.
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    /// Ping 간격.
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }
}

/// 구독 조정기(Reconciler) 설정.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// 배치 플러시 주기 (밀리초)
    pub flush_interval_ms: u64,
    /// 시작 시 전체 재동기화 실행 여부
    pub resync_on_start: bool,
    /// 전체 재동기화 중 연결 하나의 재연결 대기 한도 (초)
    pub reconnect_timeout_secs: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 250,
            resync_on_start: true,
            reconnect_timeout_secs: 15,
        }
    }
}

impl ReconcilerConfig {
    /// 플러시 주기.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// 재연결 대기 한도.
    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_secs(self.reconnect_timeout_secs)
    }
}

/// 연속성 엔진(Continuity Engine) 설정.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ContinuityConfig {
    /// 구독 행에 등록할 소유자 ID
    pub owner_id: String,
    /// 감시할 정규 구독 키 목록
    pub watch: Vec<String>,
    /// 캐시가 warm으로 인정되는 최소 바 수
    pub min_bars: usize,
    /// 캐시에 유지할 최대 바 수
    pub retained_bars: usize,
    /// 백필 작업 한 번에 요청할 바 수
    pub fetch_limit: u32,
    /// 채우기 루프의 최대 시도 횟수
    pub max_fill_attempts: u32,
    /// 백필 작업 완료 대기 타임아웃 (초)
    pub task_timeout_secs: u64,
    /// 백필 작업 상태 폴링 간격 (밀리초)
    pub task_poll_interval_ms: u64,
    /// 키별 채우기 락 테이블의 최대 크기
    pub max_fill_locks: usize,
}

impl Default for ContinuityConfig {
    fn default() -> Self {
        Self {
            owner_id: "continuity-engine".to_string(),
            watch: Vec::new(),
            min_bars: 280,
            retained_bars: 1000,
            fetch_limit: 1000,
            max_fill_attempts: 5,
            task_timeout_secs: 30,
            task_poll_interval_ms: 500,
            max_fill_locks: 4096,
        }
    }
}

impl ContinuityConfig {
    /// 백필 작업 완료 대기 타임아웃.
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    /// 백필 작업 상태 폴링 간격.
    pub fn task_poll_interval(&self) -> Duration {
        Duration::from_millis(self.task_poll_interval_ms)
    }
}

/// 로깅 설정.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 로그 레벨
    pub level: String,
    /// 로그 형식 (pretty, json, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl AppConfig {
    /// 파일과 환경 변수에서 설정을 로드합니다.
    ///
    /// 우선순위: 환경 변수(`FEED__SECTION__KEY`) > 파일 > 기본값.
    /// 파일이 존재하지 않으면 기본값과 환경 변수만 사용합니다.
    pub fn load<P: AsRef<Path>>(path: P) -> FeedResult<Self> {
        Self::load_layered([path])
    }

    /// 여러 파일을 순서대로 겹쳐 로드합니다. 뒤의 파일이 앞의 값을 덮어씁니다.
    ///
    /// 존재하지 않는 파일은 건너뜁니다. 환경 변수가 항상 마지막에 적용됩니다.
    pub fn load_layered<I, P>(paths: I) -> FeedResult<Self>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut builder = config::Config::builder();
        for path in paths {
            builder = builder.add_source(config::File::from(path.as_ref()).required(false));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix("FEED")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("continuity.watch")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// 기본 경로에서 설정을 로드합니다.
    pub fn load_default() -> FeedResult<Self> {
        Self::load("config/default.toml")
    }
}
