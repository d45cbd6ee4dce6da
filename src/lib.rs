// Drive Transfer Library
// 远程存储传输引擎核心库

// 认证模块（账号、凭证存储、令牌会话）
pub mod auth;

// 公共模块（可观察的异步任务）
pub mod common;

// 配置管理模块
pub mod config;

// 下载引擎模块
pub mod downloader;

// 远程存储 API 模块
pub mod drive;

// 错误类型
pub mod error;

// 日志系统
pub mod logging;

// 视频流解析模块
pub mod media;

// 对外服务入口
pub mod service;

// 上传引擎模块
pub mod uploader;

// 导出常用类型
pub use auth::{
    Account, AccountHint, AccountType, CredentialStore, JsonCredentialStore,
    MemoryCredentialStore, TokenSession,
};
pub use common::{ProgressTask, TaskSnapshot, TaskState};
pub use config::AppConfig;
pub use downloader::{DownloadEngine, DownloadOutput, DownloadTarget};
pub use drive::{extract_remote_id, DriveClient, DriveFile, HttpTransport, ReqwestTransport};
pub use error::{DriveError, DriveResult};
pub use media::{MediaResolver, StreamVariant, VideoInfo};
pub use service::{DriveService, VariantDownload};
pub use uploader::{BatchOptions, BatchResult, UploadOptions, UploadSource};
