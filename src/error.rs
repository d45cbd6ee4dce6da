//! 错误类型
//!
//! 单文件操作要么返回结果，要么以其中一种错误失败；
//! 批量上传从不以错误结束，失败文件记录在结果中

use thiserror::Error;

/// 传输引擎统一错误
#[derive(Debug, Error)]
pub enum DriveError {
    /// 凭证缺失、无效或刷新失败
    #[error("认证失败: {0}")]
    Auth(String),

    /// 远程文件不存在或元数据获取失败
    #[error("文件不存在: {0}")]
    NotFound(String),

    /// 远程 API 返回的结构化错误（优先于原始传输错误）
    #[error("远程API错误 ({status}): {message}")]
    RemoteApi { status: u16, message: String },

    /// 非结构化的 HTTP 错误响应
    #[error("HTTP错误 {status}: {message}")]
    Http { status: u16, message: String },

    /// 传输结束后文件为空
    #[error("文件大小为空: {0}")]
    EmptyFile(String),

    /// 视频信息接口未返回 Cookie
    #[error("获取视频信息时缺少 Cookie")]
    MissingCookie,

    /// 视频信息接口返回的 status 不是 ok
    #[error("视频信息接口状态异常: {0}")]
    UpstreamStatus(String),

    /// 没有可播放的视频流
    #[error("没有可用的视频流")]
    NoStreamVariant,

    /// 重定向次数超过上限
    #[error("重定向次数过多: {0}")]
    TooManyRedirects(usize),

    /// 网络层错误（连接、读取数据流等）
    #[error("网络错误: {0}")]
    Transport(String),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON解析失败: {0}")]
    Json(#[from] serde_json::Error),

    /// 参数不合法
    #[error("参数错误: {0}")]
    InvalidInput(String),

    /// 任务已取消
    #[error("任务已取消")]
    Cancelled,
}

pub type DriveResult<T> = Result<T, DriveError>;

impl DriveError {
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// 是否为认证类错误（不应静默重试）
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    /// HTTP 状态码（如果有）
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::RemoteApi { status, .. } | Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// 是否可以在批量层面重试
    ///
    /// 认证失败和取消不重试，其余错误都进入下一轮
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Auth(_) | Self::Cancelled)
    }
}

impl From<reqwest::Error> for DriveError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_extraction() {
        let e = DriveError::RemoteApi {
            status: 403,
            message: "User Rate Limit Exceeded".to_string(),
        };
        assert_eq!(e.status(), Some(403));
        assert!(e.is_retryable());
        assert!(e.to_string().contains("User Rate Limit Exceeded"));

        assert_eq!(DriveError::MissingCookie.status(), None);
    }

    #[test]
    fn test_auth_not_retryable() {
        let e = DriveError::auth("no refresh token");
        assert!(e.is_auth());
        assert!(!e.is_retryable());
        assert!(!DriveError::Cancelled.is_retryable());
    }

    #[test]
    fn test_client_errors_retryable() {
        assert!(DriveError::Http {
            status: 404,
            message: String::new()
        }
        .is_retryable());
        assert!(DriveError::InvalidInput("missing".into()).is_retryable());
        assert!(DriveError::EmptyFile("a".into()).is_retryable());
    }
}
