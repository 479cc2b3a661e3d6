//! 백필 작업 큐.
//!
//! 연속성 엔진은 `tasks` 테이블에 `pending` 행을 넣고, 외부 실행기가 `completed` 또는
//! `failed`로 바꿀 때까지 폴링만 합니다. 엔진은 행을 수정하지 않습니다.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::postgres::PgConnection;
use sqlx::types::Json;
use sqlx::{Connection, FromRow};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

use crate::database::Database;
use crate::error::{DataError, Result};
use crate::traits::{BackfillQueue, BackfillSession};

/// 과거 캔들 조회 작업 타입.
pub const TASK_TYPE_GET_KLINES: &str = "get_klines";

/// 작업 상태.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// 대기 중
    Pending,
    /// 실행 중
    Processing,
    /// 완료 (결과 있음)
    Completed,
    /// 실패
    Failed,
}

impl TaskStatus {
    /// 문자열로 변환
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// 더 이상 바뀌지 않는 상태인지.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = DataError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(DataError::InvalidData(format!("알 수 없는 작업 상태: {}", other))),
        }
    }
}

/// `get_klines` 작업 페이로드.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KlineTaskPayload {
    /// 거래소 심볼 (예: `BTCUSDT`)
    pub symbol: String,
    /// 거래소 인터벌 표기 (예: `1h`, `1M`)
    pub interval: String,
    /// 조회할 최대 바 수
    pub limit: u32,
}

/// 작업 대기 결과.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// 완료. 실행기가 기록한 결과
    Completed(Value),
    /// 실패. 실행기가 남긴 결과가 있으면 함께 전달
    Failed(Option<Value>),
    /// 제한 시간 내에 끝나지 않음
    TimedOut,
}

/// 작업 테이블 레코드.
#[derive(Debug, Clone, FromRow)]
pub struct BackfillTask {
    pub id: i64,
    #[sqlx(rename = "type")]
    pub task_type: String,
    pub payload: Value,
    pub status: String,
    pub result: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BackfillTask {
    /// 상태를 해석합니다.
    pub fn status(&self) -> Result<TaskStatus> {
        self.status.parse()
    }
}

// ============================================================================
// PostgreSQL 구현
// ============================================================================

/// PostgreSQL 작업 큐. 세션마다 풀과 별개인 전용 연결을 엽니다.
#[derive(Clone)]
pub struct PgBackfillQueue {
    db: Database,
    poll_interval: Duration,
}

impl PgBackfillQueue {
    /// 새 작업 큐를 생성합니다.
    pub fn new(db: Database, poll_interval: Duration) -> Self {
        Self { db, poll_interval }
    }
}

#[async_trait]
impl BackfillQueue for PgBackfillQueue {
    async fn open_session(&self) -> Result<Box<dyn BackfillSession>> {
        let conn = self.db.dedicated_connection().await?;
        Ok(Box::new(PgBackfillSession {
            conn,
            poll_interval: self.poll_interval,
        }))
    }
}

/// 전용 연결 하나를 쓰는 작업 세션.
pub struct PgBackfillSession {
    conn: PgConnection,
    poll_interval: Duration,
}

impl PgBackfillSession {
    async fn fetch(conn: &mut PgConnection, task_id: i64) -> Result<BackfillTask> {
        let task = sqlx::query_as(
            r#"
            SELECT id, type, payload, status, result, created_at, updated_at
            FROM tasks
            WHERE id = $1
            "#,
        )
        .bind(task_id)
        .fetch_optional(&mut *conn)
        .await?;

        task.ok_or_else(|| DataError::NotFound(format!("task {}", task_id)))
    }
}

#[async_trait]
impl BackfillSession for PgBackfillSession {
    async fn submit(&mut self, payload: &KlineTaskPayload) -> Result<i64> {
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO tasks (type, payload, status)
            VALUES ($1, $2, 'pending')
            RETURNING id
            "#,
        )
        .bind(TASK_TYPE_GET_KLINES)
        .bind(Json(payload))
        .fetch_one(&mut self.conn)
        .await?;

        debug!(task_id = id, symbol = %payload.symbol, interval = %payload.interval, "백필 작업 제출");
        Ok(id)
    }

    async fn wait_for(&mut self, task_id: i64, timeout: Duration) -> Result<TaskOutcome> {
        let poll_interval = self.poll_interval;
        let conn = &mut self.conn;

        let poll = async move {
            loop {
                let task = Self::fetch(conn, task_id).await?;
                let status = task.status()?;
                if status.is_terminal() {
                    return Ok(match status {
                        TaskStatus::Completed => {
                            TaskOutcome::Completed(task.result.unwrap_or(Value::Null))
                        }
                        _ => TaskOutcome::Failed(task.result),
                    });
                }
                tokio::time::sleep(poll_interval).await;
            }
        };

        match tokio::time::timeout(timeout, poll).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(task_id, timeout_secs = timeout.as_secs(), "백필 작업 대기 타임아웃");
                Ok(TaskOutcome::TimedOut)
            }
        }
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.conn.close().await?;
        Ok(())
    }
}
