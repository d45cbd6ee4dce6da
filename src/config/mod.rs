// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 远程存储 API 配置
    #[serde(default)]
    pub drive: DriveConfig,
    /// 下载配置
    #[serde(default)]
    pub download: DownloadConfig,
    /// 上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 认证配置
    #[serde(default)]
    pub auth: AuthConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 最多保留的日志文件数（按天滚动）
    #[serde(default = "default_log_max_files")]
    pub max_files: usize,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_files() -> usize {
    7
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            level: default_log_level(),
            max_files: default_log_max_files(),
        }
    }
}

/// 远程存储 API 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriveConfig {
    /// 元数据接口基础地址
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// 上传接口基础地址
    #[serde(default = "default_upload_base")]
    pub upload_base: String,
    /// OAuth 令牌接口
    #[serde(default = "default_token_url")]
    pub token_url: String,
    /// 视频信息接口
    #[serde(default = "default_video_info_url")]
    pub video_info_url: String,
    /// 浏览器 User-Agent（视频信息接口需要）
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// 连接超时（秒），传输本身不设超时
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// 最大重定向次数
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,
}

fn default_api_base() -> String {
    "https://www.googleapis.com/drive/v3".to_string()
}

fn default_upload_base() -> String {
    "https://www.googleapis.com/upload/drive/v3".to_string()
}

fn default_token_url() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

fn default_video_info_url() -> String {
    "https://docs.google.com/get_video_info".to_string()
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/87.0.4280.88 Safari/537.36".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_max_redirects() -> usize {
    10
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            upload_base: default_upload_base(),
            token_url: default_token_url(),
            video_info_url: default_video_info_url(),
            user_agent: default_user_agent(),
            connect_timeout_secs: default_connect_timeout_secs(),
            max_redirects: default_max_redirects(),
        }
    }
}

/// 下载配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// 默认下载目录
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("downloads")
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
        }
    }
}

/// 上传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 批量上传的最大并发文件数
    #[serde(default = "default_upload_concurrency")]
    pub concurrency: usize,
    /// 失败文件的最大重试轮数
    #[serde(default = "default_upload_max_retries")]
    pub max_retries: u32,
    /// 两轮重试之间的等待时间（毫秒）
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_upload_concurrency() -> usize {
    5
}

fn default_upload_max_retries() -> u32 {
    5
}

fn default_retry_backoff_ms() -> u64 {
    1000
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            concurrency: default_upload_concurrency(),
            max_retries: default_upload_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

/// 认证配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// 账号凭证文件
    #[serde(default = "default_credentials_file")]
    pub credentials_file: PathBuf,
    /// 刷新后的令牌是否写回凭证存储
    #[serde(default = "default_persist_refreshed_tokens")]
    pub persist_refreshed_tokens: bool,
    /// 提前刷新的时间窗口（秒）
    #[serde(default = "default_refresh_skew_secs")]
    pub refresh_skew_secs: i64,
}

fn default_credentials_file() -> PathBuf {
    PathBuf::from("config/credentials.json")
}

fn default_persist_refreshed_tokens() -> bool {
    true
}

fn default_refresh_skew_secs() -> i64 {
    60
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            credentials_file: default_credentials_file(),
            persist_refreshed_tokens: default_persist_refreshed_tokens(),
            refresh_skew_secs: default_refresh_skew_secs(),
        }
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        if config.upload.concurrency == 0 {
            anyhow::bail!("upload.concurrency 必须大于 0");
        }

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);
        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                let default_config = Self::default();

                if let Err(e) = default_config.save_to_file(path).await {
                    tracing::error!("保存默认配置失败: {}", e);
                }

                default_config
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.upload.concurrency, 5);
        assert_eq!(config.upload.max_retries, 5);
        assert_eq!(config.upload.retry_backoff_ms, 1000);
        assert_eq!(config.drive.max_redirects, 10);
        assert!(config.auth.persist_refreshed_tokens);
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_str().unwrap();

        let mut config = AppConfig::default();
        config.upload.concurrency = 3;
        config.save_to_file(path).await.unwrap();

        let loaded = AppConfig::load_from_file(path).await.unwrap();
        assert_eq!(loaded.upload.concurrency, 3);
        assert_eq!(loaded.drive.api_base, config.drive.api_base);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [upload]
            concurrency = 2

            [log]
            level = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(config.upload.concurrency, 2);
        assert_eq!(config.upload.max_retries, 5);
        assert_eq!(config.log.level, "debug");
        assert!(config.log.enabled);
        assert_eq!(config.auth.refresh_skew_secs, 60);
    }

    #[tokio::test]
    async fn test_zero_concurrency_rejected() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_str().unwrap();
        tokio::fs::write(path, "[upload]\nconcurrency = 0\n")
            .await
            .unwrap();
        assert!(AppConfig::load_from_file(path).await.is_err());
    }
}
