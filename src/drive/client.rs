//! 远程存储 API 客户端
//!
//! 所有请求都经过 `TokenSession` 发送，文件ID由调用方先行解析

use crate::auth::TokenSession;
use crate::config::DriveConfig;
use crate::drive::transport::{BodyStream, ByteStream, HttpRequest, RequestBody};
use crate::drive::types::{
    DriveFile, FileList, FileMetadata, ListParams, Permission, PermissionCreated,
    FOLDER_MIME_TYPE,
};
use crate::error::{DriveError, DriveResult};
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use reqwest::header::HeaderMap;
use reqwest::Method;
use std::sync::Arc;
use tracing::{debug, error, info};

/// 上传完成后返回的字段
const CREATED_FILE_FIELDS: &str = "id,name,mimeType,size,parents";

/// API 客户端
#[derive(Debug, Clone)]
pub struct DriveClient {
    session: Arc<TokenSession>,
    api_base: String,
    upload_base: String,
}

impl DriveClient {
    pub fn new(session: Arc<TokenSession>, config: &DriveConfig) -> Self {
        Self {
            session,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            upload_base: config.upload_base.trim_end_matches('/').to_string(),
        }
    }

    pub fn session(&self) -> &Arc<TokenSession> {
        &self.session
    }

    fn file_url(&self, file_id: &str) -> String {
        format!("{}/files/{}", self.api_base, encode_segment(file_id))
    }

    /// 获取文件元数据（全部字段）
    pub async fn get_file(&self, file_id: &str) -> DriveResult<DriveFile> {
        let request = HttpRequest::get(self.file_url(file_id))
            .query("fields", "*")
            .query("supportsAllDrives", "true");
        let file: DriveFile = self.session.authorized_request(request).await?.json().await?;
        debug!("获取文件信息: id={}, 名称={}, 大小={:?}", file.id, file.name, file.size);
        Ok(file)
    }

    /// 文件内容请求（可附加字节范围），由调用方发送并处理重定向
    pub fn content_request(&self, file_id: &str) -> HttpRequest {
        HttpRequest::get(self.file_url(file_id))
            .query("alt", "media")
            .query("supportsAllDrives", "true")
    }

    /// 打开文件内容数据流（透传给上层使用）
    pub async fn open_content_stream(&self, file_id: &str) -> DriveResult<(HeaderMap, ByteStream)> {
        let response = self
            .session
            .authorized_request(self.content_request(file_id))
            .await?;
        Ok((response.headers, response.body))
    }

    /// 导出在线文档
    pub async fn export(&self, file_id: &str, mime_type: &str) -> DriveResult<Vec<u8>> {
        let request = HttpRequest::get(format!("{}/export", self.file_url(file_id)))
            .query("mimeType", mime_type);
        let data = self.session.authorized_request(request).await?.bytes().await?;
        info!("导出文件完成: id={}, 格式={}, 大小={}", file_id, mime_type, data.len());
        Ok(data)
    }

    /// 复制文件
    pub async fn copy(&self, file_id: &str) -> DriveResult<DriveFile> {
        let request = HttpRequest::post(format!("{}/copy", self.file_url(file_id)))
            .query("supportsAllDrives", "true")
            .json_body(&serde_json::json!({}))?;
        let file: DriveFile = self.session.authorized_request(request).await?.json().await?;
        info!("复制文件完成: {} -> {}", file_id, file.id);
        Ok(file)
    }

    /// 删除文件
    pub async fn delete(&self, file_id: &str) -> DriveResult<()> {
        let request = HttpRequest::new(Method::DELETE, self.file_url(file_id))
            .query("supportsAllDrives", "true");
        self.session.authorized_request(request).await?;
        info!("删除文件完成: {}", file_id);
        Ok(())
    }

    /// 创建文件夹，返回文件夹ID
    pub async fn create_folder(&self, name: &str, parent_id: Option<&str>) -> DriveResult<String> {
        let metadata = FileMetadata {
            name: name.to_string(),
            mime_type: Some(FOLDER_MIME_TYPE.to_string()),
            parents: parent_id.map(|p| vec![p.to_string()]).unwrap_or_default(),
        };
        let request = HttpRequest::post(format!("{}/files", self.api_base))
            .query("fields", "id")
            .query("supportsAllDrives", "true")
            .json_body(&metadata)?;
        let folder: DriveFile = self.session.authorized_request(request).await?.json().await?;
        info!("创建文件夹完成: 名称={}, id={}", name, folder.id);
        Ok(folder.id)
    }

    /// 添加权限，返回权限ID
    pub async fn share(&self, file_id: &str, permission: &Permission) -> DriveResult<String> {
        let request = HttpRequest::post(format!("{}/permissions", self.file_url(file_id)))
            .query("fields", "id")
            .query("supportsAllDrives", "true")
            .json_body(permission)?;
        let created: PermissionCreated =
            self.session.authorized_request(request).await?.json().await?;
        info!(
            "分享文件完成: id={}, 类型={}, 角色={}",
            file_id, permission.kind, permission.role
        );
        Ok(created.id)
    }

    /// 列出文件
    pub async fn list(&self, params: &ListParams) -> DriveResult<FileList> {
        let mut request = HttpRequest::get(format!("{}/files", self.api_base))
            .query("supportsAllDrives", "true")
            .query("includeItemsFromAllDrives", "true");
        if let Some(drive_id) = &params.drive_id {
            request = request.query("driveId", drive_id.clone()).query("corpora", "drive");
        }
        if let Some(q) = &params.query {
            request = request.query("q", q.clone());
        }
        if let Some(size) = params.page_size {
            request = request.query("pageSize", size.to_string());
        }
        if let Some(token) = &params.page_token {
            request = request.query("pageToken", token.clone());
        }
        let fields = params
            .fields
            .clone()
            .unwrap_or_else(|| "nextPageToken,files(id,name,mimeType,size,fileExtension,parents)".to_string());
        request = request.query("fields", fields);

        let list: FileList = self.session.authorized_request(request).await?.json().await?;
        debug!("列出文件: {} 个, 还有下一页={}", list.files.len(), list.next_page_token.is_some());
        Ok(list)
    }

    /// 以 multipart/related 方式创建文件
    ///
    /// 请求体为：元数据 JSON 部分 + 文件内容部分，内容以流的方式发送
    pub async fn create_file(
        &self,
        metadata: &FileMetadata,
        media: BodyStream,
        media_len: u64,
    ) -> DriveResult<DriveFile> {
        let boundary = format!("drive_transfer_{}", uuid::Uuid::new_v4().simple());
        let media_type = metadata
            .mime_type
            .clone()
            .unwrap_or_else(|| "application/octet-stream".to_string());

        let head = format!(
            "--{b}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{meta}\r\n--{b}\r\nContent-Type: {mime}\r\n\r\n",
            b = boundary,
            meta = serde_json::to_string(metadata)?,
            mime = media_type,
        );
        let tail = format!("\r\n--{}--\r\n", boundary);
        let total = head.len() as u64 + media_len + tail.len() as u64;

        let body: BodyStream = Box::pin(
            stream::once(futures::future::ready(Ok(Bytes::from(head))))
                .chain(media)
                .chain(stream::once(futures::future::ready(Ok(Bytes::from(tail))))),
        );

        let request = HttpRequest::post(format!("{}/files", self.upload_base))
            .query("uploadType", "multipart")
            .query("fields", CREATED_FILE_FIELDS)
            .query("supportsAllDrives", "true")
            .header(
                "Content-Type",
                &format!("multipart/related; boundary={}", boundary),
            )?
            .body(RequestBody::Stream {
                stream: body,
                len: Some(total),
            });

        let file: DriveFile = self.session.authorized_request(request).await?.json().await?;
        Ok(file)
    }

    /// 创建可续传上传会话，返回会话地址
    ///
    /// 失败时记录日志并返回 None
    pub async fn resumable_upload_uri(
        &self,
        name: &str,
        mime_type: &str,
        size: Option<u64>,
    ) -> Option<String> {
        match self.try_resumable_upload_uri(name, mime_type, size).await {
            Ok(uri) => uri,
            Err(e) => {
                error!("创建可续传上传会话失败: 文件={}, 错误={}", name, e);
                None
            }
        }
    }

    async fn try_resumable_upload_uri(
        &self,
        name: &str,
        mime_type: &str,
        size: Option<u64>,
    ) -> DriveResult<Option<String>> {
        let metadata = FileMetadata {
            name: name.to_string(),
            mime_type: Some(mime_type.to_string()),
            parents: Vec::new(),
        };
        let mut request = HttpRequest::post(format!("{}/files", self.upload_base))
            .query("uploadType", "resumable")
            .header("X-Upload-Content-Type", mime_type)?;
        if let Some(size) = size {
            request = request.header("X-Upload-Content-Length", &size.to_string())?;
        }
        let request = request.json_body(&metadata)?;

        let response = self.session.authorized_request(request).await?;
        let uri = response.location().map(|s| s.to_string());
        if uri.is_none() {
            return Err(DriveError::Http {
                status: response.status,
                message: "响应中没有 Location".to_string(),
            });
        }
        Ok(uri)
    }
}

fn encode_segment(segment: &str) -> String {
    url::form_urlencoded::byte_serialize(segment.as_bytes()).collect()
}
