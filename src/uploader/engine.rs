// 上传引擎
//
// 单个文件上传：
// - 文件名缺省取本地文件名，MIME 类型缺省按文件名推断
// - 内容以流的方式读取并发送，不整体载入内存
// - 进度 = 传输层已读取的字节数 / 文件大小
// - 失败直接返回远程错误，不在这里重试（重试由批量上传负责）

use crate::common::ProgressReporter;
use crate::drive::transport::BodyStream;
use crate::drive::types::{DriveFile, FileMetadata};
use crate::drive::DriveClient;
use crate::error::{DriveError, DriveResult};
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

/// 内存数据切块大小（用于进度粒度）
const BUFFER_CHUNK_SIZE: usize = 256 * 1024;

/// 上传来源
#[derive(Debug, Clone)]
pub enum UploadSource {
    /// 本地文件
    Path(PathBuf),
    /// 内存数据
    Buffer { bytes: Bytes, name: String },
}

impl UploadSource {
    /// 默认的远程文件名
    pub fn default_name(&self) -> String {
        match self {
            UploadSource::Path(path) => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
            UploadSource::Buffer { name, .. } => name.clone(),
        }
    }
}

impl From<PathBuf> for UploadSource {
    fn from(path: PathBuf) -> Self {
        UploadSource::Path(path)
    }
}

/// 上传选项
#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    /// 远程文件名（默认使用本地文件名）
    pub name: Option<String>,
    /// MIME 类型（默认按文件名推断）
    pub mime_type: Option<String>,
    /// 目标文件夹
    pub parent_folder_id: Option<String>,
}

impl UploadOptions {
    pub fn in_folder(folder_id: Option<String>) -> Self {
        Self {
            parent_folder_id: folder_id,
            ..Default::default()
        }
    }
}

/// 按文件名推断 MIME 类型
pub fn guess_mime(name: &str) -> String {
    mime_guess::from_path(name)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

/// 上传引擎
#[derive(Debug, Clone, Default)]
pub struct UploadEngine;

impl UploadEngine {
    pub fn new() -> Self {
        Self
    }

    /// 上传单个文件或内存数据
    pub async fn upload(
        &self,
        client: &DriveClient,
        source: &UploadSource,
        options: &UploadOptions,
        reporter: &ProgressReporter,
    ) -> DriveResult<DriveFile> {
        let name = options
            .name
            .clone()
            .unwrap_or_else(|| source.default_name());
        let mime_type = options
            .mime_type
            .clone()
            .unwrap_or_else(|| guess_mime(&name));
        let metadata = FileMetadata {
            name: name.clone(),
            mime_type: Some(mime_type.clone()),
            parents: options.parent_folder_id.iter().cloned().collect(),
        };

        let (media, size) = open_media(source).await?;
        info!("开始上传: {}, 大小={}, 类型={}", name, size, mime_type);

        let media = counting(media, size, reporter.clone());
        let file = client.create_file(&metadata, media, size).await?;

        info!("上传完成: {} -> {}", name, file.id);
        Ok(file)
    }
}

/// 打开上传内容，返回数据流和大小
async fn open_media(source: &UploadSource) -> DriveResult<(BodyStream, u64)> {
    match source {
        UploadSource::Path(path) => {
            let file = tokio::fs::File::open(path).await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    DriveError::InvalidInput(format!("本地文件不存在: {:?}", path))
                } else {
                    DriveError::Io(e)
                }
            })?;
            let size = file.metadata().await?.len();
            debug!("打开本地文件: {:?}, 大小={}", path, size);
            Ok((Box::pin(ReaderStream::new(file)), size))
        }
        UploadSource::Buffer { bytes, .. } => {
            let size = bytes.len() as u64;
            let chunks: Vec<std::io::Result<Bytes>> = (0..bytes.len())
                .step_by(BUFFER_CHUNK_SIZE)
                .map(|start| {
                    let end = (start + BUFFER_CHUNK_SIZE).min(bytes.len());
                    Ok(bytes.slice(start..end))
                })
                .collect();
            Ok((Box::pin(stream::iter(chunks)), size))
        }
    }
}

/// 统计传输层读取的字节数并上报进度
fn counting(media: BodyStream, total: u64, reporter: ProgressReporter) -> BodyStream {
    let sent = Arc::new(AtomicU64::new(0));
    Box::pin(media.inspect(move |chunk| {
        if let Ok(chunk) = chunk {
            let done = sent.fetch_add(chunk.len() as u64, Ordering::Relaxed) + chunk.len() as u64;
            reporter.report_bytes(done, total);
        }
    }))
}
