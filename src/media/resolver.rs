//! 视频流解析
//!
//! 从视频信息接口获取可播放的清晰度列表：
//! - 接口返回表单编码的响应体和 set-cookie 响应头，没有 Cookie 时视为不可用
//! - `fmt_stream_map` 格式为 `itag|url,itag|url,...`
//! - itag 映射为分辨率，未知的 itag 被过滤

use crate::common::ProgressReporter;
use crate::config::DriveConfig;
use crate::downloader::DownloadEngine;
use crate::drive::file_id::extract_remote_id;
use crate::drive::transport::{HttpRequest, HttpTransport};
use crate::drive::types::DriveFile;
use crate::error::{DriveError, DriveResult};
use reqwest::header::{HeaderMap, HeaderValue, COOKIE};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info};

/// 视频流格式
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamVariant {
    /// 格式标识（itag）
    pub format_tag: String,
    /// 分辨率（像素高度）
    pub resolution: u32,
    /// 显示名称，例如 `720p`
    pub label: String,
    pub mime_type: String,
    pub source_url: String,
}

/// 视频信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VideoInfo {
    pub file_id: String,
    pub title: Option<String>,
    /// 按分辨率从高到低排列
    pub variants: Vec<StreamVariant>,
    /// 会话 Cookie（`name=value`）
    pub cookies: Vec<String>,
}

impl VideoInfo {
    /// 拼接为 Cookie 请求头
    pub fn cookie_header(&self) -> String {
        self.cookies.join("; ")
    }

    /// 分辨率最高的格式
    pub fn best_variant(&self) -> Option<&StreamVariant> {
        self.variants.iter().max_by_key(|v| v.resolution)
    }
}

/// itag → 分辨率，未知返回 0
pub fn resolution_for_tag(tag: &str) -> u32 {
    match tag {
        "18" => 360,
        "59" => 480,
        "22" => 720,
        "37" => 1080,
        _ => 0,
    }
}

/// 解析 `fmt_stream_map`
fn parse_stream_map(raw: &str) -> Vec<StreamVariant> {
    let mut variants: Vec<StreamVariant> = raw
        .split(',')
        .filter_map(|entry| {
            let (tag, url) = entry.split_once('|')?;
            let tag = tag.trim();
            let resolution = resolution_for_tag(tag);
            if resolution == 0 {
                return None;
            }
            Some(StreamVariant {
                format_tag: tag.to_string(),
                resolution,
                label: format!("{}p", resolution),
                mime_type: "video/mp4".to_string(),
                source_url: url.to_string(),
            })
        })
        .collect();
    variants.sort_by(|a, b| b.resolution.cmp(&a.resolution));
    variants
}

/// 只保留 `name=value` 部分
fn cookie_pair(set_cookie: &str) -> Option<String> {
    let pair = set_cookie.split(';').next()?.trim();
    if pair.is_empty() {
        None
    } else {
        Some(pair.to_string())
    }
}

/// 视频流解析器
#[derive(Clone)]
pub struct MediaResolver {
    transport: Arc<dyn HttpTransport>,
    video_info_url: String,
}

impl MediaResolver {
    pub fn new(transport: Arc<dyn HttpTransport>, config: &DriveConfig) -> Self {
        Self {
            transport,
            video_info_url: config.video_info_url.clone(),
        }
    }

    /// 获取视频的可用格式
    pub async fn get_stream_variants(&self, reference: &str) -> DriveResult<VideoInfo> {
        let file_id = extract_remote_id(reference);
        let request = HttpRequest::get(&self.video_info_url).query("docid", file_id.clone());

        let response = self.transport.send(request).await.map_err(|e| {
            error!("获取视频信息失败: {}, 错误: {}", file_id, e);
            e
        })?;
        let response = response.error_for_status().await?;

        let cookies: Vec<String> = response
            .set_cookies()
            .iter()
            .filter_map(|c| cookie_pair(c))
            .collect();
        if cookies.is_empty() {
            return Err(DriveError::MissingCookie);
        }

        let body = response.text().await?;
        let fields: HashMap<String, String> = url::form_urlencoded::parse(body.as_bytes())
            .into_owned()
            .collect();

        if fields.get("status").map(String::as_str) != Some("ok") {
            let reason = fields
                .get("reason")
                .cloned()
                .unwrap_or_else(|| body.trim().to_string());
            return Err(DriveError::UpstreamStatus(reason));
        }

        let variants = fields
            .get("fmt_stream_map")
            .map(|raw| parse_stream_map(raw))
            .unwrap_or_default();
        debug!(
            "视频信息: {}, 可用格式 {:?}",
            file_id,
            variants.iter().map(|v| v.label.as_str()).collect::<Vec<_>>()
        );

        Ok(VideoInfo {
            file_id,
            title: fields.get("title").cloned(),
            variants,
            cookies,
        })
    }

    /// 下载最高清晰度的视频流
    ///
    /// 文件名为 `<文件ID或时间戳>-<分辨率>-<itag>.<扩展名>`，默认保存到系统临时目录
    pub async fn download_variant(
        &self,
        engine: &DownloadEngine,
        info: &VideoInfo,
        file: Option<&DriveFile>,
        location: Option<&Path>,
        reporter: &ProgressReporter,
    ) -> DriveResult<PathBuf> {
        if info.cookies.is_empty() {
            return Err(DriveError::MissingCookie);
        }
        let variant = info.best_variant().ok_or(DriveError::NoStreamVariant)?;

        let file_name = variant_file_name(variant, file);
        let path = match location {
            Some(dir) => dir.join(&file_name),
            None => std::env::temp_dir().join(&file_name),
        };
        info!("下载视频: {} ({}), 保存到 {:?}", info.file_id, variant.label, path);

        let mut headers = HeaderMap::new();
        let cookie = HeaderValue::from_str(&info.cookie_header())
            .map_err(|e| DriveError::InvalidInput(format!("非法 Cookie: {}", e)))?;
        headers.insert(COOKIE, cookie);

        engine
            .download_url(&variant.source_url, &path, headers, reporter)
            .await
    }
}

fn variant_file_name(variant: &StreamVariant, file: Option<&DriveFile>) -> String {
    let stem = match file {
        Some(file) => file.id.clone(),
        None => chrono::Utc::now().timestamp_millis().to_string(),
    };
    let ext = file
        .and_then(|f| f.file_extension.as_deref())
        .filter(|e| !e.is_empty())
        .unwrap_or("mp4");
    format!("{}-{}-{}.{}", stem, variant.resolution, variant.format_tag, ext)
}
