//! 传输服务
//!
//! 对外暴露的统一入口：每个操作接收一个账号提示（自动选择 / 账号ID / 账号对象），
//! 在第一次需要网络请求时才解析账号，并且每个操作最多解析一次。
//! 同一账号的所有操作共享一个令牌会话，刷新令牌因此被串行化。

use crate::auth::{Account, AccountHint, AccountQuery, AccountType, CredentialStore, TokenSession};
use crate::common::ProgressTask;
use crate::config::AppConfig;
use crate::downloader::{DownloadEngine, DownloadOutput, DownloadTarget};
use crate::drive::transport::ByteStream;
use crate::drive::types::{DriveFile, FileList, ListParams, Permission, DEFAULT_EXPORT_MIME};
use crate::drive::{extract_remote_id, DriveClient, HttpTransport};
use crate::error::{DriveError, DriveResult};
use crate::media::{MediaResolver, VideoInfo};
use crate::uploader::{
    guess_mime, BatchOptions, BatchResult, BatchUploader, UploadEngine, UploadOptions,
    UploadSource,
};
use reqwest::header::HeaderMap;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

/// 视频下载请求
#[derive(Debug, Clone, Default)]
pub struct VariantDownload {
    /// 文件链接或ID
    pub remote_ref: String,
    /// 保存目录（默认系统临时目录）
    pub location: Option<PathBuf>,
    /// 已经获取过的视频信息（为空时重新获取）
    pub resolved: Option<VideoInfo>,
}

struct ServiceInner {
    config: AppConfig,
    store: Arc<dyn CredentialStore>,
    transport: Arc<dyn HttpTransport>,
    /// 账号ID → 令牌会话
    sessions: Mutex<HashMap<String, Arc<TokenSession>>>,
    downloader: DownloadEngine,
    uploader: UploadEngine,
    media: MediaResolver,
}

/// 传输服务
#[derive(Clone)]
pub struct DriveService {
    inner: Arc<ServiceInner>,
}

impl std::fmt::Debug for DriveService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriveService")
            .field("api_base", &self.inner.config.drive.api_base)
            .finish()
    }
}

/// 单个操作内的账号解析（惰性，最多一次）
struct LazyClient {
    inner: Arc<ServiceInner>,
    hint: AccountHint,
    usage: AccountType,
    client: OnceCell<DriveClient>,
}

impl LazyClient {
    async fn get(&self) -> DriveResult<&DriveClient> {
        self.client
            .get_or_try_init(|| async move {
                let account = self.inner.resolve_account(&self.hint, self.usage).await?;
                let session = self.inner.session_for(account).await;
                Ok(DriveClient::new(session, &self.inner.config.drive))
            })
            .await
    }
}

impl ServiceInner {
    async fn resolve_account(&self, hint: &AccountHint, usage: AccountType) -> DriveResult<Account> {
        let mut account = match hint {
            AccountHint::Account(account) => return Ok(account.as_ref().clone()),
            AccountHint::Id(id) => self
                .store
                .find_account(&AccountQuery::ById(id.clone()))
                .await?
                .ok_or_else(|| DriveError::auth(format!("账号不存在: {}", id)))?,
            AccountHint::Auto => self
                .store
                .find_account(&AccountQuery::ByType(usage))
                .await?
                .ok_or_else(|| DriveError::auth(format!("没有可用的{}账号", usage)))?,
        };

        // 账号记录只带客户端ID时，从存储补全客户端配置
        if account.client.client_secret.is_empty() {
            match self.store.find_client_config(&account.client.id).await? {
                Some(client) => account.client = client,
                None => {
                    return Err(DriveError::auth(format!(
                        "账号 {} 的客户端配置不存在: {}",
                        account.id, account.client.id
                    )))
                }
            }
        }

        debug!("解析账号: {} ({}) -> {}", usage, account.email, account.id);
        Ok(account)
    }

    async fn session_for(&self, account: Account) -> Arc<TokenSession> {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(&account.id) {
            return session.clone();
        }

        let mut session = TokenSession::for_account(
            &account,
            self.transport.clone(),
            &self.config.drive,
            &self.config.auth,
        );
        if self.config.auth.persist_refreshed_tokens {
            session = session.with_store(self.store.clone());
        }
        let session = Arc::new(session);
        sessions.insert(account.id.clone(), session.clone());
        info!("创建令牌会话: {} ({})", account.id, account.account_type);
        session
    }
}

impl DriveService {
    pub fn new(
        config: AppConfig,
        store: Arc<dyn CredentialStore>,
        transport: Arc<dyn HttpTransport>,
    ) -> Self {
        let downloader = DownloadEngine::new(transport.clone(), &config.drive);
        let media = MediaResolver::new(transport.clone(), &config.drive);
        Self {
            inner: Arc::new(ServiceInner {
                config,
                store,
                transport,
                sessions: Mutex::new(HashMap::new()),
                downloader,
                uploader: UploadEngine::new(),
                media,
            }),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    fn lazy_client(&self, hint: AccountHint, usage: AccountType) -> LazyClient {
        LazyClient {
            inner: self.inner.clone(),
            hint,
            usage,
            client: OnceCell::new(),
        }
    }

    async fn client(&self, hint: AccountHint, usage: AccountType) -> DriveResult<DriveClient> {
        let lazy = self.lazy_client(hint, usage);
        let client = lazy.get().await?.clone();
        Ok(client)
    }

    /// 下载文件
    pub fn download(
        &self,
        remote_ref: &str,
        target: DownloadTarget,
        hint: AccountHint,
    ) -> ProgressTask<DownloadOutput> {
        let file_id = extract_remote_id(remote_ref);
        let lazy = self.lazy_client(hint, AccountType::Download);
        let engine = self.inner.downloader.clone();
        ProgressTask::spawn(move |reporter| async move {
            let client = lazy.get().await?;
            engine.download(client, &file_id, &target, &reporter).await
        })
    }

    /// 上传单个文件
    pub fn upload(
        &self,
        source: UploadSource,
        options: UploadOptions,
        hint: AccountHint,
    ) -> ProgressTask<DriveFile> {
        let lazy = self.lazy_client(hint, AccountType::Upload);
        let engine = self.inner.uploader.clone();
        ProgressTask::spawn(move |reporter| async move {
            let client = lazy.get().await?;
            engine.upload(client, &source, &options, &reporter).await
        })
    }

    /// 批量上传，并发数和重试次数取自配置
    pub fn upload_many(
        &self,
        paths: Vec<PathBuf>,
        parent_folder_id: Option<String>,
        hint: AccountHint,
    ) -> ProgressTask<BatchResult> {
        let options = BatchOptions {
            parent_folder_id,
            ..BatchOptions::from(&self.inner.config.upload)
        };
        self.upload_many_with(paths, options, hint)
    }

    /// 批量上传（自定义参数）
    pub fn upload_many_with(
        &self,
        paths: Vec<PathBuf>,
        options: BatchOptions,
        hint: AccountHint,
    ) -> ProgressTask<BatchResult> {
        let lazy = self.lazy_client(hint, AccountType::Upload);
        let uploader = BatchUploader::new(self.inner.uploader.clone(), options);
        ProgressTask::spawn(move |reporter| async move {
            if paths.is_empty() {
                return Ok(BatchResult::default());
            }
            let client = lazy.get().await?;
            uploader.upload_many(client, paths, &reporter).await
        })
    }

    /// 获取文件元数据
    pub async fn get_file_info(&self, remote_ref: &str, hint: AccountHint) -> DriveResult<DriveFile> {
        let file_id = extract_remote_id(remote_ref);
        self.client(hint, AccountType::Download)
            .await?
            .get_file(&file_id)
            .await
    }

    /// 获取访问令牌（必要时刷新）
    pub async fn get_access_token(&self, hint: AccountHint, usage: AccountType) -> DriveResult<String> {
        let client = self.client(hint, usage).await?;
        client.session().access_token().await
    }

    /// 获取视频的可用格式（不需要账号）
    pub async fn get_stream_variants(&self, remote_ref: &str) -> DriveResult<VideoInfo> {
        self.inner.media.get_stream_variants(remote_ref).await
    }

    /// 下载最高清晰度的视频
    ///
    /// 元数据只用于生成文件名，获取失败时改用时间戳命名
    pub fn download_variant(
        &self,
        request: VariantDownload,
        hint: AccountHint,
    ) -> ProgressTask<PathBuf> {
        let lazy = self.lazy_client(hint, AccountType::Download);
        let inner = self.inner.clone();
        ProgressTask::spawn(move |reporter| async move {
            let info = match request.resolved {
                Some(info) => info,
                None => inner.media.get_stream_variants(&request.remote_ref).await?,
            };
            if info.variants.is_empty() {
                return Err(DriveError::NoStreamVariant);
            }

            let file = match lazy.get().await {
                Ok(client) => match client.get_file(&info.file_id).await {
                    Ok(file) => Some(file),
                    Err(e) => {
                        warn!("获取视频元数据失败，使用时间戳命名: {}", e);
                        None
                    }
                },
                Err(e) => {
                    warn!("无法解析账号，使用时间戳命名: {}", e);
                    None
                }
            };

            inner
                .media
                .download_variant(
                    &inner.downloader,
                    &info,
                    file.as_ref(),
                    request.location.as_deref(),
                    &reporter,
                )
                .await
        })
    }

    /// 打开文件内容流（用于转发）
    pub async fn open_content_stream(
        &self,
        remote_ref: &str,
        hint: AccountHint,
    ) -> DriveResult<(HeaderMap, ByteStream)> {
        let file_id = extract_remote_id(remote_ref);
        self.client(hint, AccountType::Download)
            .await?
            .open_content_stream(&file_id)
            .await
    }

    /// 导出在线文档（默认导出为 PDF）
    pub async fn export(
        &self,
        remote_ref: &str,
        mime_type: Option<&str>,
        hint: AccountHint,
    ) -> DriveResult<Vec<u8>> {
        let file_id = extract_remote_id(remote_ref);
        self.client(hint, AccountType::Download)
            .await?
            .export(&file_id, mime_type.unwrap_or(DEFAULT_EXPORT_MIME))
            .await
    }

    /// 复制文件到上传账号
    pub async fn copy(&self, remote_ref: &str, hint: AccountHint) -> DriveResult<DriveFile> {
        let file_id = extract_remote_id(remote_ref);
        self.client(hint, AccountType::Upload).await?.copy(&file_id).await
    }

    pub async fn delete(&self, remote_ref: &str, hint: AccountHint) -> DriveResult<()> {
        let file_id = extract_remote_id(remote_ref);
        self.client(hint, AccountType::Upload).await?.delete(&file_id).await
    }

    pub async fn create_folder(
        &self,
        name: &str,
        parent_id: Option<&str>,
        hint: AccountHint,
    ) -> DriveResult<String> {
        self.client(hint, AccountType::Upload)
            .await?
            .create_folder(name, parent_id)
            .await
    }

    /// 共享文件，默认任何人可读
    pub async fn share(
        &self,
        remote_ref: &str,
        permission: Option<Permission>,
        hint: AccountHint,
    ) -> DriveResult<String> {
        let file_id = extract_remote_id(remote_ref);
        self.client(hint, AccountType::Upload)
            .await?
            .share(&file_id, &permission.unwrap_or_default())
            .await
    }

    pub async fn list(&self, params: &ListParams, hint: AccountHint) -> DriveResult<FileList> {
        self.client(hint, AccountType::Download).await?.list(params).await
    }

    /// 创建可续传上传会话，失败时返回 None
    pub async fn resumable_upload_uri(
        &self,
        name: &str,
        mime_type: Option<&str>,
        size: Option<u64>,
        hint: AccountHint,
    ) -> DriveResult<Option<String>> {
        let mime_type = mime_type
            .map(str::to_string)
            .unwrap_or_else(|| guess_mime(name));
        Ok(self
            .client(hint, AccountType::Upload)
            .await?
            .resumable_upload_uri(name, &mime_type, size)
            .await)
    }
}
