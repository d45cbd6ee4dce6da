//! 令牌会话
//!
//! 一个会话绑定一个账号，负责：
//! - 提供有效的访问令牌（过期前自动刷新）
//! - 发送带认证头的请求，遇到 401 时刷新一次后重放
//! - 把刷新后的令牌通知给订阅者，并可选地写回凭证存储
//!
//! 刷新由会话内的异步锁串行化，并发调用方只会触发一次刷新

use crate::auth::store::CredentialStore;
use crate::auth::types::{Account, AccountType, ClientConfig, Credential};
use crate::config::{AuthConfig, DriveConfig};
use crate::drive::transport::{HttpRequest, HttpResponse, HttpTransport, RequestBody};
use crate::drive::types::TokenResponse;
use crate::error::{DriveError, DriveResult};
use chrono::{Duration, Utc};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

/// 令牌会话
pub struct TokenSession {
    account_id: String,
    account_type: AccountType,
    client: ClientConfig,
    transport: Arc<dyn HttpTransport>,
    token_url: String,
    skew_secs: i64,
    /// 最新凭证（同时作为刷新通知通道）
    credential: watch::Sender<Credential>,
    /// 刷新锁
    refresh_lock: Mutex<()>,
    store: Option<Arc<dyn CredentialStore>>,
}

impl std::fmt::Debug for TokenSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSession")
            .field("account_id", &self.account_id)
            .field("account_type", &self.account_type)
            .finish()
    }
}

impl TokenSession {
    /// 为账号创建会话（复制一份凭证，不修改调用方的账号）
    pub fn for_account(
        account: &Account,
        transport: Arc<dyn HttpTransport>,
        drive: &DriveConfig,
        auth: &AuthConfig,
    ) -> Self {
        let (credential, _) = watch::channel(account.token.clone());
        Self {
            account_id: account.id.clone(),
            account_type: account.account_type,
            client: account.client.clone(),
            transport,
            token_url: drive.token_url.clone(),
            skew_secs: auth.refresh_skew_secs,
            credential,
            refresh_lock: Mutex::new(()),
            store: None,
        }
    }

    /// 刷新后把新令牌写回存储
    pub fn with_store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    /// 最新凭证快照
    pub fn credential(&self) -> Credential {
        self.credential.borrow().clone()
    }

    /// 订阅令牌轮换
    pub fn subscribe_refresh(&self) -> watch::Receiver<Credential> {
        self.credential.subscribe()
    }

    /// 获取有效的访问令牌
    pub async fn access_token(&self) -> DriveResult<String> {
        let current = self.credential();
        if !current.is_expired(self.skew_secs) {
            return Ok(current.access_token);
        }

        let _guard = self.refresh_lock.lock().await;
        // 等锁期间可能已经被其他调用方刷新
        let current = self.credential();
        if !current.is_expired(self.skew_secs) {
            return Ok(current.access_token);
        }
        let fresh = self.refresh(&current).await?;
        Ok(fresh.access_token)
    }

    /// 服务端拒绝了 `stale` 令牌时强制刷新
    ///
    /// 如果其他调用方已经换过令牌，直接返回新令牌
    async fn force_refresh(&self, stale: &str) -> DriveResult<String> {
        let _guard = self.refresh_lock.lock().await;
        let current = self.credential();
        if current.access_token != stale && !current.is_expired(self.skew_secs) {
            return Ok(current.access_token);
        }
        let fresh = self.refresh(&current).await?;
        Ok(fresh.access_token)
    }

    /// 调用令牌接口刷新（调用方必须持有刷新锁）
    async fn refresh(&self, current: &Credential) -> DriveResult<Credential> {
        let refresh_token = current
            .refresh_token
            .clone()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                DriveError::auth(format!("账号 {} 没有可用的 refresh_token", self.account_id))
            })?;

        info!("刷新访问令牌: 账号={}", self.account_id);

        let form = vec![
            ("grant_type".to_string(), "refresh_token".to_string()),
            ("client_id".to_string(), self.client.client_id.clone()),
            ("client_secret".to_string(), self.client.client_secret.clone()),
            ("refresh_token".to_string(), refresh_token.clone()),
        ];
        let request = HttpRequest::post(&self.token_url).body(RequestBody::Form(form));

        let response = self
            .transport
            .send(request)
            .await
            .map_err(|e| DriveError::auth(format!("刷新令牌请求失败: {}", e)))?;
        let response = response
            .error_for_status()
            .await
            .map_err(|e| DriveError::auth(format!("刷新令牌被拒绝: {}", e)))?;
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| DriveError::auth(format!("解析令牌响应失败: {}", e)))?;

        let fresh = Credential {
            access_token: token.access_token,
            // 令牌接口不一定返回新的 refresh_token
            refresh_token: token.refresh_token.or(Some(refresh_token)),
            expiry: token.expires_in.map(|secs| Utc::now() + Duration::seconds(secs)),
            token_type: token.token_type.or_else(|| current.token_type.clone()),
            scope: token.scope.or_else(|| current.scope.clone()),
        };
        self.credential.send_replace(fresh.clone());
        debug!("访问令牌已更新: 账号={}, 过期时间={:?}", self.account_id, fresh.expiry);

        if let Some(store) = &self.store {
            if let Err(e) = store.save_credential(&self.account_id, &fresh).await {
                error!("保存刷新后的令牌失败: 账号={}, 错误={}", self.account_id, e);
            }
        }

        Ok(fresh)
    }

    /// 发送带认证头的请求
    ///
    /// - 返回状态码 < 400 的响应（包括重定向，由调用方处理）
    /// - 401 且请求体可重放时刷新令牌并重放一次，仍为 401 则返回 `Auth`
    /// - 其他错误状态转换为 `RemoteApi` / `Http`
    pub async fn authorized_request(&self, request: HttpRequest) -> DriveResult<HttpResponse> {
        let token = self.access_token().await?;
        let replay = request.try_clone();

        let response = self.transport.send(bearer(request, &token)?).await?;
        if response.status != 401 {
            return response.error_for_status().await;
        }

        let Some(replay) = replay else {
            return Err(unauthorized(response).await);
        };

        warn!("访问令牌被拒绝，刷新后重试: 账号={}", self.account_id);
        let token = self.force_refresh(&token).await?;
        let response = self.transport.send(bearer(replay, &token)?).await?;
        if response.status == 401 {
            return Err(unauthorized(response).await);
        }
        response.error_for_status().await
    }
}

fn bearer(request: HttpRequest, token: &str) -> DriveResult<HttpRequest> {
    request.header("Authorization", &format!("Bearer {}", token))
}

async fn unauthorized(response: HttpResponse) -> DriveError {
    match response.error_for_status().await {
        Err(e) => DriveError::auth(e.to_string()),
        Ok(_) => DriveError::auth("401 Unauthorized"),
    }
}
