// 批量上传
//
// - 信号量限制同时上传的文件数，按提交顺序排队
// - 单个文件失败不影响其他文件，失败的文件进入下一轮重试
// - 最多 max_retries + 1 轮，两轮之间固定等待
// - 进度 = 所有轮次累计成功数 / 文件总数
// - 批量任务不会因为单个文件失败而失败，失败文件记录在结果中

use crate::common::{ProgressReporter, ProgressTask};
use crate::config::UploadConfig;
use crate::drive::DriveClient;
use crate::error::{DriveError, DriveResult};
use crate::uploader::engine::{UploadEngine, UploadOptions, UploadSource};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

/// 上传成功的文件
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadedFile {
    pub name: String,
    pub remote_id: String,
    pub path: PathBuf,
}

/// 重试耗尽后仍失败的文件
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedUpload {
    pub name: String,
    pub path: PathBuf,
    /// 最后一次失败的错误信息
    pub error: String,
}

/// 批量上传结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchResult {
    /// 按提交顺序排列
    pub succeeded: Vec<UploadedFile>,
    pub failed: Vec<FailedUpload>,
}

impl BatchResult {
    pub fn failed_names(&self) -> Vec<&str> {
        self.failed.iter().map(|f| f.name.as_str()).collect()
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// 批量上传参数
#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// 最大并发文件数（0 视为 1）
    pub concurrency: usize,
    /// 最大重试轮数
    pub max_retries: u32,
    /// 两轮之间的等待时间
    pub retry_backoff: Duration,
    /// 目标文件夹
    pub parent_folder_id: Option<String>,
}

impl From<&UploadConfig> for BatchOptions {
    fn from(config: &UploadConfig) -> Self {
        Self {
            concurrency: config.concurrency,
            max_retries: config.max_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            parent_folder_id: None,
        }
    }
}

/// 待上传文件（带提交序号）
struct PendingUpload {
    index: usize,
    path: PathBuf,
}

enum Outcome {
    Uploaded(usize, UploadedFile),
    Failed(PendingUpload, DriveError),
}

/// 批量上传器
#[derive(Debug, Clone)]
pub struct BatchUploader {
    engine: UploadEngine,
    options: BatchOptions,
}

impl BatchUploader {
    pub fn new(engine: UploadEngine, options: BatchOptions) -> Self {
        Self { engine, options }
    }

    fn concurrency(&self) -> usize {
        self.options.concurrency.max(1)
    }

    /// 批量上传本地文件
    ///
    /// 只在被取消时返回错误
    pub async fn upload_many(
        &self,
        client: &DriveClient,
        paths: Vec<PathBuf>,
        reporter: &ProgressReporter,
    ) -> DriveResult<BatchResult> {
        let total = paths.len();
        if total == 0 {
            return Ok(BatchResult::default());
        }

        info!(
            "开始批量上传: {} 个文件, 并发数={}, 最大重试轮数={}",
            total,
            self.concurrency(),
            self.options.max_retries
        );

        let done = Arc::new(AtomicUsize::new(0));
        let mut pending: Vec<PendingUpload> = paths
            .into_iter()
            .enumerate()
            .map(|(index, path)| PendingUpload { index, path })
            .collect();
        let mut succeeded: Vec<(usize, UploadedFile)> = Vec::with_capacity(total);
        let mut failed: Vec<(usize, FailedUpload)> = Vec::new();

        for pass in 0..=self.options.max_retries {
            if pass > 0 {
                warn!(
                    "第 {} 轮重试: {} 个文件, 等待 {:?}",
                    pass,
                    pending.len(),
                    self.options.retry_backoff
                );
                tokio::select! {
                    _ = reporter.cancellation_token().cancelled() => return Err(DriveError::Cancelled),
                    _ = tokio::time::sleep(self.options.retry_backoff) => {}
                }
            }

            let last_pass = pass == self.options.max_retries;
            let outcomes = self
                .run_pass(client, std::mem::take(&mut pending), total, &done, reporter)
                .await;

            for outcome in outcomes {
                match outcome {
                    Outcome::Uploaded(index, file) => succeeded.push((index, file)),
                    Outcome::Failed(_, DriveError::Cancelled) if reporter.is_cancelled() => {
                        return Err(DriveError::Cancelled);
                    }
                    Outcome::Failed(item, e) if !last_pass && e.is_retryable() => {
                        warn!("上传失败，稍后重试: {:?}, 错误: {}", item.path, e);
                        pending.push(item);
                    }
                    Outcome::Failed(item, e) => {
                        error!("上传失败，不再重试: {:?}, 错误: {}", item.path, e);
                        failed.push((
                            item.index,
                            FailedUpload {
                                name: file_name(&item.path),
                                path: item.path,
                                error: e.to_string(),
                            },
                        ));
                    }
                }
            }

            if pending.is_empty() {
                break;
            }
            pending.sort_by_key(|item| item.index);
        }

        succeeded.sort_by_key(|(index, _)| *index);
        failed.sort_by_key(|(index, _)| *index);
        let result = BatchResult {
            succeeded: succeeded.into_iter().map(|(_, f)| f).collect(),
            failed: failed.into_iter().map(|(_, f)| f).collect(),
        };

        info!(
            "批量上传结束: 成功 {} 个, 失败 {} 个",
            result.succeeded.len(),
            result.failed.len()
        );
        Ok(result)
    }

    /// 执行一轮上传
    async fn run_pass(
        &self,
        client: &DriveClient,
        items: Vec<PendingUpload>,
        total: usize,
        done: &Arc<AtomicUsize>,
        reporter: &ProgressReporter,
    ) -> Vec<Outcome> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency()));
        let mut running = FuturesUnordered::new();
        let mut outcomes = Vec::with_capacity(items.len());

        for item in items {
            // 按提交顺序获取许可，拿到许可后才开始上传
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                outcomes.push(Outcome::Failed(item, DriveError::Cancelled));
                continue;
            };

            let engine = self.engine.clone();
            let client = client.clone();
            let batch = reporter.clone();
            let done = done.clone();
            let source = UploadSource::Path(item.path.clone());
            let options = UploadOptions::in_folder(self.options.parent_folder_id.clone());

            let task = ProgressTask::spawn_child(reporter.cancellation_token(), move |file_reporter| {
                async move {
                    let _permit = permit;
                    let result = engine
                        .upload(&client, &source, &options, &file_reporter)
                        .await;
                    if result.is_ok() {
                        let count = done.fetch_add(1, Ordering::SeqCst) + 1;
                        batch.report_bytes(count as u64, total as u64);
                    }
                    result
                }
            });

            running.push(async move {
                match task.await {
                    Ok(file) => Outcome::Uploaded(
                        item.index,
                        UploadedFile {
                            name: if file.name.is_empty() {
                                file_name(&item.path)
                            } else {
                                file.name
                            },
                            remote_id: file.id,
                            path: item.path,
                        },
                    ),
                    Err(e) => Outcome::Failed(item, e),
                }
            });
        }

        while let Some(outcome) = running.next().await {
            outcomes.push(outcome);
        }
        outcomes
    }
}

fn file_name(path: &std::path::Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
