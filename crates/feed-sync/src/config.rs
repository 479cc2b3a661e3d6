//! 설정 로드 모듈.
//!
//! 우선순위: 환경 변수 > `--config` 파일 > `config/default.toml` > 기본값.
//! `.env` 파일이 있으면 가장 먼저 읽고, `DATABASE_URL`은 `database.url`을 덮어씁니다.

use feed_core::{AppConfig, SubscriptionKey};
use std::path::{Path, PathBuf};

use crate::error::{Result, SyncError};

/// 기본 설정 파일 경로
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// 서비스 설정을 로드합니다.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    dotenvy::dotenv().ok();

    let mut files = vec![PathBuf::from(DEFAULT_CONFIG_PATH)];
    if let Some(path) = path {
        if !path.exists() {
            return Err(SyncError::Config(format!(
                "설정 파일을 찾을 수 없습니다: {}",
                path.display()
            )));
        }
        files.push(path.to_path_buf());
    }

    let mut config = AppConfig::load_layered(&files)?;
    if let Ok(url) = std::env::var("DATABASE_URL") {
        config.database.url = url;
    }

    validate(&config)?;
    Ok(config)
}

fn validate(config: &AppConfig) -> Result<()> {
    let continuity = &config.continuity;
    if continuity.owner_id.trim().is_empty() {
        return Err(SyncError::Config("continuity.owner_id가 비어 있습니다".to_string()));
    }
    if continuity.retained_bars < continuity.min_bars {
        return Err(SyncError::Config(format!(
            "continuity.retained_bars({})는 min_bars({}) 이상이어야 합니다",
            continuity.retained_bars, continuity.min_bars
        )));
    }
    if (continuity.fetch_limit as usize) < continuity.min_bars {
        return Err(SyncError::Config(format!(
            "continuity.fetch_limit({})는 min_bars({}) 이상이어야 합니다",
            continuity.fetch_limit, continuity.min_bars
        )));
    }
    if continuity.max_fill_attempts == 0 {
        return Err(SyncError::Config(
            "continuity.max_fill_attempts는 1 이상이어야 합니다".to_string(),
        ));
    }
    if config.reconciler.reconnect_timeout_secs == 0 {
        return Err(SyncError::Config(
            "reconciler.reconnect_timeout_secs는 1 이상이어야 합니다".to_string(),
        ));
    }
    for raw in &continuity.watch {
        let key = SubscriptionKey::parse(raw)?;
        if key.timeframe().is_none() {
            return Err(SyncError::Config(format!(
                "continuity.watch에는 KLINE 키만 올 수 있습니다: {}",
                key
            )));
        }
    }
    Ok(())
}
