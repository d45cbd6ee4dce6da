// 远程存储 API 数据类型定义

use serde::{Deserialize, Deserializer, Serialize};

/// 文件夹的 MIME 类型
pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

/// 默认导出格式
pub const DEFAULT_EXPORT_MIME: &str = "application/pdf";

/// 远程文件元数据
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub mime_type: String,
    /// 文件大小（接口以字符串返回；在线文档没有大小）
    #[serde(default, deserialize_with = "deserialize_size")]
    pub size: Option<u64>,
    #[serde(default)]
    pub file_extension: Option<String>,
    #[serde(default)]
    pub parents: Vec<String>,
    #[serde(default)]
    pub md5_checksum: Option<String>,
}

impl DriveFile {
    pub fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME_TYPE
    }

    /// 下载到目录时使用的本地文件名：`<id>.<扩展名>`
    pub fn local_file_name(&self) -> String {
        match self.file_extension.as_deref() {
            Some(ext) if !ext.is_empty() => format!("{}.{}", self.id, ext),
            _ => self.id.clone(),
        }
    }
}

fn deserialize_size<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Size {
        Text(String),
        Number(u64),
    }

    match Option::<Size>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Size::Number(n)) => Ok(Some(n)),
        Some(Size::Text(s)) => s
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

/// 文件列表
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileList {
    #[serde(default)]
    pub files: Vec<DriveFile>,
    #[serde(default)]
    pub next_page_token: Option<String>,
    #[serde(default)]
    pub incomplete_search: bool,
}

/// 列表查询参数
#[derive(Debug, Clone, Default)]
pub struct ListParams {
    /// 共享盘ID（设置后在该共享盘内查询）
    pub drive_id: Option<String>,
    /// 查询表达式，例如 `'<folder>' in parents`
    pub query: Option<String>,
    pub page_size: Option<u32>,
    pub page_token: Option<String>,
    /// 返回字段，默认返回 files 的 id/name/mimeType/size
    pub fields: Option<String>,
}

/// 权限
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Permission {
    #[serde(rename = "type")]
    pub kind: String,
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

impl Default for Permission {
    /// 任何人可查看
    fn default() -> Self {
        Self {
            kind: "anyone".to_string(),
            role: "reader".to_string(),
            email_address: None,
            domain: None,
        }
    }
}

/// 创建权限后的返回
#[derive(Debug, Clone, Deserialize)]
pub struct PermissionCreated {
    pub id: String,
}

/// 创建文件时提交的元数据
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub parents: Vec<String>,
}

/// 结构化错误响应 `{"error": {"code": .., "message": ..}}`
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorDetail {
    #[serde(default)]
    pub code: Option<u16>,
    pub message: String,
}

impl ApiErrorBody {
    /// 尝试从响应体解析错误信息
    pub fn parse(raw: &[u8]) -> Option<String> {
        serde_json::from_slice::<ApiErrorBody>(raw)
            .ok()
            .map(|body| body.error.message)
    }
}

/// OAuth 令牌接口响应
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drive_file_size_as_string() {
        let file: DriveFile = serde_json::from_str(
            r#"{"id":"abc","name":"a.mp4","mimeType":"video/mp4","size":"1024","fileExtension":"mp4"}"#,
        )
        .unwrap();
        assert_eq!(file.size, Some(1024));
        assert_eq!(file.local_file_name(), "abc.mp4");
        assert!(!file.is_folder());

        let doc: DriveFile = serde_json::from_str(
            r#"{"id":"doc1","mimeType":"application/vnd.google-apps.folder"}"#,
        )
        .unwrap();
        assert_eq!(doc.size, None);
        assert_eq!(doc.local_file_name(), "doc1");
        assert!(doc.is_folder());
    }

    #[test]
    fn test_api_error_parse() {
        let raw = br#"{"error":{"code":403,"message":"The user's Drive storage quota has been exceeded."}}"#;
        assert_eq!(
            ApiErrorBody::parse(raw).as_deref(),
            Some("The user's Drive storage quota has been exceeded.")
        );
        assert_eq!(ApiErrorBody::parse(b"<html>oops</html>"), None);
    }

    #[test]
    fn test_permission_default_and_wire_shape() {
        let value = serde_json::to_value(Permission::default()).unwrap();
        assert_eq!(value, serde_json::json!({"type": "anyone", "role": "reader"}));
    }

    #[test]
    fn test_file_metadata_skips_empty_parents() {
        let meta = FileMetadata {
            name: "a.txt".into(),
            mime_type: Some("text/plain".into()),
            parents: vec![],
        };
        let value = serde_json::to_value(meta).unwrap();
        assert_eq!(value, serde_json::json!({"name": "a.txt", "mimeType": "text/plain"}));
    }
}
