//! feed-sync CLI.

use anyhow::Context;
use clap::{Parser, Subcommand};
use feed_core::{init_logging, LogConfig, SubscriptionKey};
use feed_exchange::{BinanceStreamClient, BinanceStreamConfig, StreamConnection};
use feed_store::{Database, NotificationStream, PgBackfillQueue, SubscriptionStore};
use feed_sync::{load_config, ContinuityEngine, Reconciler, Router, SystemClock};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 거래소 이벤트 채널 크기
const EVENT_BUFFER: usize = 4096;
/// 저장소 알림 채널 크기
const NOTIFICATION_BUFFER: usize = 1024;

#[derive(Parser)]
#[command(name = "feed-sync")]
#[command(about = "Market data subscription sync and continuity services", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// 설정 파일 경로 (기본 설정 위에 덮어씀)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// 로그 레벨 (trace, debug, info, warn, error). 설정 파일 값보다 우선
    #[arg(long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// 스키마 마이그레이션 실행
    Migrate,

    /// 구독 조정기와 스트림 라우터 실행
    Stream,

    /// 연속성 엔진 실행
    Continuity,

    /// 구독 reset 알림 발행 (전체 재동기화 요청)
    Reset {
        /// 로그에 남길 사유
        #[arg(long, default_value = "operator")]
        reason: String,
    },

    /// 구독자 추가
    Subscribe {
        /// 구독자 ID
        #[arg(long)]
        owner: String,
        /// 정규 구독 키 (예: BINANCE:BTCUSDT.P@KLINE_60)
        #[arg(required = true)]
        keys: Vec<String>,
    },

    /// 구독자 제거
    Unsubscribe {
        /// 구독자 ID
        #[arg(long)]
        owner: String,
        /// 정규 구독 키
        #[arg(required = true)]
        keys: Vec<String>,
    },

    /// 구독 저장소 내용 출력
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref()).context("설정 로드 실패")?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }

    init_logging(LogConfig::from_settings(&config.logging))
        .map_err(|e| anyhow::anyhow!("로깅 초기화 실패: {}", e))?;

    tracing::info!("feed-sync 시작");

    let db = Database::connect(&config.database).await?;
    db.health_check().await.context("데이터베이스 상태 확인 실패")?;

    match cli.command {
        Commands::Migrate => {
            db.migrate().await?;
        }
        Commands::Stream => {
            run_stream(&db, &config).await?;
        }
        Commands::Continuity => {
            run_continuity(&db, &config).await?;
        }
        Commands::Reset { reason } => {
            let store = SubscriptionStore::new(db.pool().clone());
            store.request_reset(&reason).await?;
            tracing::info!(reason = %reason, "reset 알림 발행");
        }
        Commands::Subscribe { owner, keys } => {
            let keys = parse_keys(&keys)?;
            let store = SubscriptionStore::new(db.pool().clone());
            for key in &keys {
                let created = store.add_subscriber(key, &owner).await?;
                println!("{}\t{}", key, if created { "created" } else { "joined" });
            }
        }
        Commands::Unsubscribe { owner, keys } => {
            let keys = parse_keys(&keys)?;
            let store = SubscriptionStore::new(db.pool().clone());
            for key in &keys {
                let deleted = store.remove_subscriber(key, &owner).await?;
                println!("{}\t{}", key, if deleted { "deleted" } else { "left" });
            }
        }
        Commands::List => {
            let store = SubscriptionStore::new(db.pool().clone());
            for record in store.list().await? {
                let event_time = record
                    .event_time
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{}\t{}\t{}",
                    record.subscription_key,
                    event_time,
                    record.subscribers.join(",")
                );
            }
        }
    }

    db.pool().close().await;
    tracing::info!("feed-sync 종료");

    Ok(())
}

/// 키를 모두 검증한 뒤에만 저장소를 건드립니다.
fn parse_keys(raw: &[String]) -> anyhow::Result<Vec<SubscriptionKey>> {
    raw.iter()
        .map(|key| SubscriptionKey::parse(key).with_context(|| format!("잘못된 구독 키: {}", key)))
        .collect()
}

/// Ctrl-C 또는 알림 전달 태스크 종료까지 기다립니다.
async fn wait_for_shutdown(forwarder: &mut JoinHandle<feed_store::Result<()>>) {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("종료 신호 수신");
        }
        result = forwarder => match result {
            Ok(Ok(())) => tracing::warn!("알림 전달 종료"),
            Ok(Err(e)) => tracing::error!(error = %e, "알림 수신 실패"),
            Err(e) => tracing::error!(error = %e, "알림 전달 태스크 비정상 종료"),
        },
    }
}

async fn run_stream(db: &Database, config: &feed_core::AppConfig) -> anyhow::Result<()> {
    let store = Arc::new(SubscriptionStore::new(db.pool().clone()));
    let cancel = CancellationToken::new();

    let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
    let stream_config = BinanceStreamConfig::from_settings(&config.exchange);
    let clients: Vec<Arc<BinanceStreamClient>> = BinanceStreamClient::spawn_all(&stream_config, event_tx)
        .into_iter()
        .map(Arc::new)
        .collect();
    let connections: Vec<Arc<dyn StreamConnection>> = clients
        .iter()
        .map(|client| Arc::clone(client) as Arc<dyn StreamConnection>)
        .collect();

    let (notify_tx, notify_rx) = mpsc::channel(NOTIFICATION_BUFFER);
    let listener = NotificationStream::membership(db.pool()).await?;
    let mut forwarder = tokio::spawn(listener.forward(notify_tx));

    let resync = Arc::new(Notify::new());
    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        connections,
        config.reconciler.clone(),
    ));
    let router = Router::new(store);

    let reconciler_task = tokio::spawn(reconciler.run(notify_rx, Arc::clone(&resync), cancel.clone()));
    let router_task = tokio::spawn(router.run(event_rx, resync, cancel.clone()));

    wait_for_shutdown(&mut forwarder).await;

    cancel.cancel();
    forwarder.abort();
    let _ = reconciler_task.await;
    let _ = router_task.await;
    for client in &clients {
        client.shutdown().await;
    }

    Ok(())
}

async fn run_continuity(db: &Database, config: &feed_core::AppConfig) -> anyhow::Result<()> {
    let store = Arc::new(SubscriptionStore::new(db.pool().clone()));
    let queue = Arc::new(PgBackfillQueue::new(
        db.clone(),
        config.continuity.task_poll_interval(),
    ));
    let engine = ContinuityEngine::new(
        store,
        queue,
        config.continuity.clone(),
        Arc::new(SystemClock),
    )?;
    if engine.watched().is_empty() {
        tracing::warn!("continuity.watch가 비어 있음");
    }

    let cancel = CancellationToken::new();
    let (notify_tx, notify_rx) = mpsc::channel(NOTIFICATION_BUFFER);
    let listener = NotificationStream::data_updates(db.pool()).await?;
    let mut forwarder = tokio::spawn(listener.forward(notify_tx));

    engine.start().await?;

    let engine_task = {
        let engine = engine.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { engine.run(notify_rx, cancel).await })
    };

    wait_for_shutdown(&mut forwarder).await;

    cancel.cancel();
    forwarder.abort();
    let _ = engine_task.await;

    Ok(())
}
