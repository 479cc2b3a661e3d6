//! PostgreSQL 연결 관리.

use feed_core::DatabaseConfig;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::Connection;
use tracing::{debug, info};

use crate::error::{DataError, Result};

/// 데이터베이스 연결 풀 래퍼.
///
/// 일반 쿼리는 공유 풀을, 장시간 대기하는 작업은 [`Database::dedicated_connection`]을 사용합니다.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
    url: String,
}

impl Database {
    /// 새로운 데이터베이스 연결 풀을 생성합니다.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        info!(max_connections = config.max_connections, "Connecting to database...");

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout())
            .connect(&config.url)
            .await
            .map_err(|e| DataError::ConnectionError(e.to_string()))?;

        info!("Database connection established");

        Ok(Self {
            pool,
            url: config.url.clone(),
        })
    }

    /// 내부 연결 풀을 반환합니다.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// 풀과 별개인 전용 연결을 엽니다. 닫는 것은 호출자 책임입니다.
    pub async fn dedicated_connection(&self) -> Result<PgConnection> {
        debug!("Opening dedicated connection");
        PgConnection::connect(&self.url)
            .await
            .map_err(|e| DataError::ConnectionError(e.to_string()))
    }

    /// 데이터베이스 마이그레이션을 실행합니다.
    pub async fn migrate(&self) -> Result<()> {
        info!("Running database migrations...");

        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| DataError::MigrationError(e.to_string()))?;

        info!("Migrations completed successfully");
        Ok(())
    }

    /// 데이터베이스 상태를 확인합니다.
    pub async fn health_check(&self) -> Result<bool> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| DataError::QueryError(e.to_string()))?;
        Ok(true)
    }
}
