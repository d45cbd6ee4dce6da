//! HTTP 传输层
//!
//! 引擎通过 `HttpTransport` 发出所有网络请求，便于注入不同实现：
//! - `ReqwestTransport`：生产环境使用，不自动跟随重定向（由下载引擎处理）
//! - 测试中使用脚本化的假实现

use crate::config::DriveConfig;
use crate::drive::types::ApiErrorBody;
use crate::error::{DriveError, DriveResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, LOCATION, SET_COOKIE};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use std::pin::Pin;
use std::time::Duration;
use tracing::debug;

/// 请求体数据流（reqwest 要求 Send + Sync）
pub type BodyStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send + Sync>>;

/// 响应体数据流
pub type ByteStream = BoxStream<'static, DriveResult<Bytes>>;

/// 请求体
pub enum RequestBody {
    Empty,
    Bytes(Bytes),
    /// application/x-www-form-urlencoded
    Form(Vec<(String, String)>),
    /// 流式请求体，只能发送一次
    Stream { stream: BodyStream, len: Option<u64> },
}

impl RequestBody {
    /// 非流式请求体可以重放（例如刷新令牌后重试）
    pub fn try_clone(&self) -> Option<RequestBody> {
        match self {
            RequestBody::Empty => Some(RequestBody::Empty),
            RequestBody::Bytes(b) => Some(RequestBody::Bytes(b.clone())),
            RequestBody::Form(f) => Some(RequestBody::Form(f.clone())),
            RequestBody::Stream { .. } => None,
        }
    }
}

impl std::fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestBody::Empty => write!(f, "Empty"),
            RequestBody::Bytes(b) => write!(f, "Bytes({})", b.len()),
            RequestBody::Form(fields) => write!(f, "Form({} fields)", fields.len()),
            RequestBody::Stream { len, .. } => write!(f, "Stream({:?})", len),
        }
    }
}

/// HTTP 请求
#[derive(Debug)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub query: Vec<(String, String)>,
    pub body: RequestBody,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            query: Vec::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    /// 添加请求头（非法的头名称或值会返回参数错误）
    pub fn header(mut self, name: &str, value: &str) -> DriveResult<Self> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| DriveError::InvalidInput(format!("非法请求头名称 {}: {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| DriveError::InvalidInput(format!("非法请求头值: {}", e)))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.push((key.to_string(), value.into()));
        self
    }

    pub fn body(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }

    pub fn json_body<T: serde::Serialize>(self, value: &T) -> DriveResult<Self> {
        let raw = serde_json::to_vec(value)?;
        self.header("Content-Type", "application/json; charset=UTF-8")
            .map(|req| req.body(RequestBody::Bytes(Bytes::from(raw))))
    }

    /// 复制请求（流式请求体无法复制）
    pub fn try_clone(&self) -> Option<HttpRequest> {
        Some(HttpRequest {
            method: self.method.clone(),
            url: self.url.clone(),
            headers: self.headers.clone(),
            query: self.query.clone(),
            body: self.body.try_clone()?,
        })
    }
}

/// HTTP 响应
pub struct HttpResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: ByteStream,
}

impl std::fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish()
    }
}

impl HttpResponse {
    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// 重定向目标
    pub fn location(&self) -> Option<&str> {
        self.headers.get(LOCATION).and_then(|v| v.to_str().ok())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    }

    /// 所有 set-cookie 响应头
    pub fn set_cookies(&self) -> Vec<String> {
        self.headers
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .collect()
    }

    /// 读取完整响应体
    pub async fn bytes(self) -> DriveResult<Vec<u8>> {
        let mut body = self.body;
        let mut buf = Vec::new();
        while let Some(chunk) = body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf)
    }

    pub async fn text(self) -> DriveResult<String> {
        let raw = self.bytes().await?;
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    pub async fn json<T: DeserializeOwned>(self) -> DriveResult<T> {
        let raw = self.bytes().await?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// 状态码 ≥ 400 时读取响应体并转换为错误
    ///
    /// 能解析出结构化错误信息时返回 `RemoteApi`，否则返回 `Http`
    pub async fn error_for_status(self) -> DriveResult<Self> {
        if self.status < 400 {
            return Ok(self);
        }
        let status = self.status;
        let raw = self.bytes().await.unwrap_or_default();
        Err(match ApiErrorBody::parse(&raw) {
            Some(message) => DriveError::RemoteApi { status, message },
            None => DriveError::Http {
                status,
                message: String::from_utf8_lossy(&raw).trim().to_string(),
            },
        })
    }
}

/// HTTP 传输能力
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> DriveResult<HttpResponse>;
}

/// 基于 reqwest 的传输实现
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// 创建传输层
    ///
    /// - 禁用自动重定向，由调用方决定如何跟随
    /// - 只设置连接超时，长时间传输不设整体超时
    pub fn new(config: &DriveConfig) -> DriveResult<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| DriveError::transport(format!("创建HTTP客户端失败: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> DriveResult<HttpResponse> {
        debug!("HTTP {} {}", request.method, request.url);

        let mut builder = self
            .client
            .request(request.method, &request.url)
            .headers(request.headers);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Bytes(b) => builder.body(b),
            RequestBody::Form(fields) => builder.form(&fields),
            RequestBody::Stream { stream, len } => {
                let builder = match len {
                    Some(len) => builder.header(CONTENT_LENGTH, len),
                    None => builder,
                };
                builder.body(reqwest::Body::wrap_stream(stream))
            }
        };

        let resp = builder.send().await?;
        let status = resp.status().as_u16();
        let headers = resp.headers().clone();
        let body = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| DriveError::transport(format!("读取数据流失败: {}", e))))
            .boxed();

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}
