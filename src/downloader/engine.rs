//! 下载引擎
//!
//! - 单文件下载：先取元数据，按本地文件大小决定跳过、续传或全新下载
//! - 续传使用 Range 请求并追加写入；服务端忽略 Range（返回 200）时从头重写
//! - 重定向由引擎手动跟随，跨域跳转时不携带认证头
//! - 数据流逐块写入目标，每块更新一次进度

use crate::auth::TokenSession;
use crate::common::ProgressReporter;
use crate::config::DriveConfig;
use crate::drive::transport::{ByteStream, HttpRequest, HttpResponse, HttpTransport};
use crate::drive::DriveClient;
use crate::error::{DriveError, DriveResult};
use futures::StreamExt;
use reqwest::header::HeaderMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

/// 下载目标
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadTarget {
    /// 保存到目录，文件名为 `<id>.<扩展名>`
    Directory(PathBuf),
    /// 保存到指定文件
    File(PathBuf),
    /// 保存到内存
    Memory,
}

/// 下载结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutput {
    File(PathBuf),
    Memory(Vec<u8>),
}

impl DownloadOutput {
    pub fn path(&self) -> Option<&Path> {
        match self {
            DownloadOutput::File(path) => Some(path),
            DownloadOutput::Memory(_) => None,
        }
    }
}

/// 下载引擎
#[derive(Clone)]
pub struct DownloadEngine {
    transport: Arc<dyn HttpTransport>,
    max_redirects: usize,
}

impl DownloadEngine {
    pub fn new(transport: Arc<dyn HttpTransport>, config: &DriveConfig) -> Self {
        Self {
            transport,
            max_redirects: config.max_redirects,
        }
    }

    /// 下载远程文件
    pub async fn download(
        &self,
        client: &DriveClient,
        file_id: &str,
        target: &DownloadTarget,
        reporter: &ProgressReporter,
    ) -> DriveResult<DownloadOutput> {
        let meta = client.get_file(file_id).await.map_err(|e| match e {
            e @ (DriveError::Auth(_) | DriveError::Cancelled) => e,
            other => DriveError::NotFound(format!("{} ({})", file_id, other)),
        })?;
        let expected = meta.size;

        let path = match target {
            DownloadTarget::Directory(dir) => Some(dir.join(meta.local_file_name())),
            DownloadTarget::File(path) => Some(path.clone()),
            DownloadTarget::Memory => None,
        };

        // 1. 检查本地已有文件
        let mut offset = 0u64;
        if let Some(path) = &path {
            ensure_parent_dir(path).await?;
            if let Ok(existing) = tokio::fs::metadata(path).await {
                let size = existing.len();
                match expected {
                    Some(total) if total > 0 && size == total => {
                        info!("文件已存在，跳过下载: {:?}", path);
                        reporter.report(1.0);
                        return Ok(DownloadOutput::File(path.clone()));
                    }
                    Some(total) if size > 0 && size < total => {
                        warn!("断点续传: {:?}, 从 {} / {} 字节继续", path, size, total);
                        offset = size;
                    }
                    _ => {}
                }
            }
        }

        // 2. 请求文件内容
        let mut request = client.content_request(file_id);
        if let (true, Some(total)) = (offset > 0, expected) {
            request = request.header("Range", &format!("bytes={}-{}", offset, total))?;
        }
        let response = self.follow(request, Some(client.session())).await?;

        if offset > 0 && response.status != 206 {
            warn!(
                "服务端未按范围返回（状态码 {}），重新下载: {}",
                response.status, file_id
            );
            offset = 0;
        }
        let total = expected.or_else(|| response.content_length().map(|len| len + offset));

        // 3. 写入目标
        match path {
            Some(path) => {
                let mut file = if offset > 0 {
                    OpenOptions::new().append(true).open(&path).await?
                } else {
                    File::create(&path).await?
                };
                let written = pump(response.body, &mut file, offset, total, reporter).await?;
                drop(file);

                let size = tokio::fs::metadata(&path).await?.len();
                if size == 0 {
                    return Err(DriveError::EmptyFile(path.display().to_string()));
                }
                info!("下载完成: {:?}, 大小={} (本次 {} 字节)", path, size, written - offset);
                Ok(DownloadOutput::File(path))
            }
            None => {
                let mut buf = Vec::with_capacity(total.unwrap_or(0).min(64 * 1024 * 1024) as usize);
                pump(response.body, &mut buf, 0, total, reporter).await?;
                if buf.is_empty() {
                    return Err(DriveError::EmptyFile(file_id.to_string()));
                }
                info!("下载到内存完成: {}, 大小={}", file_id, buf.len());
                Ok(DownloadOutput::Memory(buf))
            }
        }
    }

    /// 下载任意地址到文件（不使用账号认证）
    ///
    /// 总大小取自最终响应的 Content-Length
    pub async fn download_url(
        &self,
        url: &str,
        path: &Path,
        headers: HeaderMap,
        reporter: &ProgressReporter,
    ) -> DriveResult<PathBuf> {
        info!("[下载] {}", url);
        ensure_parent_dir(path).await?;

        let response = self.follow(HttpRequest::get(url).headers(headers), None).await?;
        let total = response.content_length();

        let mut file = File::create(path).await?;
        pump(response.body, &mut file, 0, total, reporter).await?;
        drop(file);

        let size = tokio::fs::metadata(path).await?.len();
        if size == 0 {
            return Err(DriveError::EmptyFile(path.display().to_string()));
        }
        info!("[下载] 完成: {:?}, 大小={}", path, size);
        Ok(path.to_path_buf())
    }

    /// 发送请求并跟随重定向
    ///
    /// 与首个请求同源的地址通过会话发送（带认证），其他地址直接发送
    async fn follow(
        &self,
        request: HttpRequest,
        session: Option<&TokenSession>,
    ) -> DriveResult<HttpResponse> {
        let origin = origin_of(&request.url);
        let mut request = request;
        let mut hops = 0usize;

        loop {
            let replay = request.try_clone();
            let current_url = request.url.clone();

            let authorized = session.filter(|_| origin.is_some() && origin_of(&current_url) == origin);
            let response = match authorized {
                Some(session) => session.authorized_request(request).await?,
                None => self.transport.send(request).await?.error_for_status().await?,
            };

            if !response.is_redirect() {
                return Ok(response);
            }
            let Some(location) = response.location() else {
                return Err(DriveError::Http {
                    status: response.status,
                    message: "重定向响应缺少 Location".to_string(),
                });
            };

            hops += 1;
            if hops > self.max_redirects {
                return Err(DriveError::TooManyRedirects(self.max_redirects));
            }

            let next_url = resolve_location(&current_url, location)?;
            warn!("重定向 ({}/{}): {}", hops, self.max_redirects, next_url);

            let mut next = replay
                .ok_or_else(|| DriveError::InvalidInput("请求体无法重放，不能跟随重定向".into()))?;
            next.url = next_url;
            next.query.clear();
            request = next;
        }
    }
}

/// 把响应体逐块写入目标，返回写入后的累计字节数
async fn pump<W>(
    mut body: ByteStream,
    writer: &mut W,
    already: u64,
    total: Option<u64>,
    reporter: &ProgressReporter,
) -> DriveResult<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut done = already;
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        writer.write_all(&chunk).await?;
        done += chunk.len() as u64;
        if let Some(total) = total {
            reporter.report_bytes(done, total);
        }
    }
    writer.flush().await?;
    debug!("数据流结束: 累计 {} 字节", done);
    Ok(done)
}

async fn ensure_parent_dir(path: &Path) -> DriveResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    Ok(())
}

fn origin_of(raw: &str) -> Option<String> {
    url::Url::parse(raw)
        .ok()
        .map(|u| u.origin().ascii_serialization())
}

/// 解析重定向地址（支持相对路径）
fn resolve_location(base: &str, location: &str) -> DriveResult<String> {
    let base = url::Url::parse(base)
        .map_err(|e| DriveError::InvalidInput(format!("非法地址 {}: {}", base, e)))?;
    base.join(location)
        .map(|u| u.to_string())
        .map_err(|e| DriveError::InvalidInput(format!("非法重定向地址 {}: {}", location, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{ProgressTask, TaskState};
    use crate::drive::client::tests::client_with;
    use crate::drive::transport::testing::{Scripted, ScriptedTransport};
    use std::sync::Mutex;
    use std::time::Duration;

    const ID: &str = "abcdefghij0123";

    fn meta(size: u64) -> Scripted {
        Scripted::json(serde_json::json!({
            "id": ID,
            "name": "clip.mp4",
            "size": size.to_string(),
            "fileExtension": "mp4"
        }))
    }

    fn engine(transport: Arc<ScriptedTransport>) -> DownloadEngine {
        DownloadEngine::new(
            transport,
            &DriveConfig {
                max_redirects: 3,
                ..Default::default()
            },
        )
    }

    fn spawn_download(
        transport: Arc<ScriptedTransport>,
        target: DownloadTarget,
    ) -> ProgressTask<DownloadOutput> {
        let engine = engine(transport.clone());
        let client = client_with(transport);
        ProgressTask::spawn(move |reporter| async move {
            engine.download(&client, ID, &target, &reporter).await
        })
    }

    #[tokio::test]
    async fn test_existing_complete_file_skips_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(format!("{}.mp4", ID));
        tokio::fs::write(&path, b"12345").await.unwrap();

        let transport = ScriptedTransport::new();
        transport.route("?fields", vec![meta(5)]);

        let task = spawn_download(transport.clone(), DownloadTarget::Directory(dir.path().into()));
        let output = task.await.unwrap();
        assert_eq!(output, DownloadOutput::File(path));
        assert!(transport.requests_to("alt=media").is_empty());
    }

    #[tokio::test]
    async fn test_partial_file_resumes_with_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.bin");
        tokio::fs::write(&path, b"0123").await.unwrap();

        let transport = ScriptedTransport::new();
        transport.route("?fields", vec![meta(10)]);
        transport.route(
            "alt=media",
            vec![Scripted::status(206).with_chunks(vec![b"456".to_vec(), b"789".to_vec()])],
        );

        let task = spawn_download(transport.clone(), DownloadTarget::File(path.clone()));
        let rx = task.subscribe();
        task.await.unwrap();

        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"0123456789");
        let content = transport.requests_to("alt=media");
        assert_eq!(content.len(), 1);
        assert_eq!(content[0].header("range").as_deref(), Some("bytes=4-10"));
        assert_eq!(rx.borrow().progress, 1.0);
    }

    #[tokio::test]
    async fn test_cancel_stops_writing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.bin");

        let transport = ScriptedTransport::new();
        transport.route("?fields", vec![meta(40)]);
        transport.route(
            "alt=media",
            vec![Scripted::status(200)
                .with_chunks(vec![b"abcd".to_vec(); 10])
                .with_chunk_delay(40)],
        );

        let task = spawn_download(transport, DownloadTarget::File(path.clone()));
        let rx = task.subscribe();
        tokio::time::sleep(Duration::from_millis(100)).await;
        task.cancel();

        assert!(matches!(task.await, Err(DriveError::Cancelled)));
        assert_eq!(rx.borrow().state, TaskState::Cancelled);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let size = tokio::fs::metadata(&path).await.unwrap().len();
        assert!(size < 40);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(tokio::fs::metadata(&path).await.unwrap().len(), size);
    }

    #[tokio::test]
    async fn test_range_ignored_restarts_from_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.bin");
        tokio::fs::write(&path, b"xxxx").await.unwrap();

        let transport = ScriptedTransport::new();
        transport.route("?fields", vec![meta(10)]);
        transport.route(
            "alt=media",
            vec![Scripted::status(200).with_body(b"0123456789".to_vec())],
        );

        spawn_download(transport, DownloadTarget::File(path.clone()))
            .await
            .unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"0123456789");
    }

    #[tokio::test]
    async fn test_empty_transfer_fails() {
        let dir = tempfile::tempdir().unwrap();
        let transport = ScriptedTransport::new();
        transport.route("?fields", vec![meta(0)]);
        transport.route("alt=media", vec![Scripted::status(200)]);

        let result = spawn_download(transport, DownloadTarget::Directory(dir.path().into())).await;
        assert!(matches!(result, Err(DriveError::EmptyFile(_))));
    }

    #[tokio::test]
    async fn test_memory_target() {
        let transport = ScriptedTransport::new();
        transport.route("?fields", vec![meta(6)]);
        transport.route(
            "alt=media",
            vec![Scripted::status(200).with_chunks(vec![b"abc".to_vec(), b"def".to_vec()])],
        );
        let output = spawn_download(transport, DownloadTarget::Memory).await.unwrap();
        assert_eq!(output, DownloadOutput::Memory(b"abcdef".to_vec()));
    }

    #[tokio::test]
    async fn test_missing_metadata_is_not_found() {
        let transport = ScriptedTransport::new();
        transport.route("?fields", vec![Scripted::status(404)]);
        let result = spawn_download(transport, DownloadTarget::Memory).await;
        assert!(matches!(result, Err(DriveError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_structured_error_body_preferred() {
        let transport = ScriptedTransport::new();
        transport.route("?fields", vec![meta(10)]);
        transport.route(
            "alt=media",
            vec![Scripted::status(403).with_body(
                br#"{"error":{"code":403,"message":"The download quota for this file has been exceeded."}}"#
                    .to_vec(),
            )],
        );
        let result = spawn_download(transport, DownloadTarget::Memory).await;
        match result {
            Err(DriveError::RemoteApi { message, .. }) => {
                assert_eq!(message, "The download quota for this file has been exceeded.")
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_redirect_followed_without_auth_and_progress_continues() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.bin");
        tokio::fs::write(&path, b"0123").await.unwrap();

        let transport = ScriptedTransport::new();
        transport.route("?fields", vec![meta(10)]);
        transport.route(
            "alt=media",
            vec![Scripted::status(302).with_header("location", "https://cdn.test/blob/1")],
        );
        transport.route(
            "cdn.test/blob/1",
            vec![Scripted::status(206).with_chunks(vec![b"45".to_vec(), b"6789".to_vec()])],
        );

        let seen = Arc::new(Mutex::new(Vec::new()));
        let task = spawn_download(transport.clone(), DownloadTarget::File(path.clone()));
        let seen_clone = seen.clone();
        task.on_progress(move |p| seen_clone.lock().unwrap().push(p));
        task.await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"0123456789");
        let cdn = transport.requests_to("cdn.test");
        assert_eq!(cdn.len(), 1);
        assert_eq!(cdn[0].header("authorization"), None);
        assert_eq!(cdn[0].header("range").as_deref(), Some("bytes=4-10"));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.last().copied(), Some(1.0));
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert!(seen.iter().filter(|p| **p > 0.0).all(|p| *p >= 0.4));
    }

    #[tokio::test]
    async fn test_too_many_redirects() {
        let transport = ScriptedTransport::new();
        transport.route(
            "loop.test",
            vec![Scripted::status(302).with_header("location", "/again")],
        );
        let engine = engine(transport);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let task = ProgressTask::spawn(move |reporter| async move {
            engine
                .download_url("https://loop.test/start", &path, HeaderMap::new(), &reporter)
                .await
        });
        assert!(matches!(task.await, Err(DriveError::TooManyRedirects(3))));
    }

    #[tokio::test]
    async fn test_download_url_sends_headers_and_uses_content_length() {
        let transport = ScriptedTransport::new();
        transport.route(
            "video.test/stream",
            vec![Scripted::status(200)
                .with_header("content-length", "4")
                .with_chunks(vec![b"ab".to_vec(), b"cd".to_vec()])],
        );
        let engine = engine(transport.clone());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("v.mp4");
        let mut headers = HeaderMap::new();
        headers.insert("cookie", "DRIVE_STREAM=abc".parse().unwrap());

        let target = path.clone();
        let task = ProgressTask::spawn(move |reporter| async move {
            engine.download_url("https://video.test/stream", &target, headers, &reporter).await
        });
        let rx = task.subscribe();
        assert_eq!(task.await.unwrap(), path);
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"abcd");
        assert_eq!(rx.borrow().progress, 1.0);

        let sent = transport.requests_to("video.test");
        assert_eq!(sent[0].header("cookie").as_deref(), Some("DRIVE_STREAM=abc"));
    }

    #[tokio::test]
    async fn test_download_url_http_error() {
        let transport = ScriptedTransport::new();
        transport.route("video.test", vec![Scripted::status(500).with_body(b"boom".to_vec())]);
        let engine = engine(transport);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v.mp4");
        let task = ProgressTask::spawn(move |reporter| async move {
            engine.download_url("https://video.test/x", &path, HeaderMap::new(), &reporter).await
        });
        assert!(matches!(task.await, Err(DriveError::Http { status: 500, .. })));
    }
}
