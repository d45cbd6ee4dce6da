// 认证模块数据类型定义

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// 账号用途
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountType {
    /// 只读账号，用于下载
    Download,
    /// 拥有完整权限的账号，用于上传/创建/分享
    Upload,
}

impl fmt::Display for AccountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccountType::Download => write!(f, "download"),
            AccountType::Upload => write!(f, "upload"),
        }
    }
}

impl std::str::FromStr for AccountType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "download" => Ok(AccountType::Download),
            "upload" => Ok(AccountType::Upload),
            other => Err(format!("未知的账号类型: {}", other)),
        }
    }
}

/// OAuth 客户端配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// 客户端记录ID
    pub id: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default)]
    pub redirect_uri: Option<String>,
    /// 所属项目（没有项目的客户端不参与账号选择）
    #[serde(default)]
    pub project_id: Option<String>,
}

/// OAuth 凭证
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// 访问令牌过期时间
    #[serde(default)]
    pub expiry: Option<DateTime<Utc>>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl Credential {
    /// 访问令牌是否已过期（或即将在 skew 内过期）
    ///
    /// 没有过期时间的令牌视为有效
    pub fn is_expired(&self, skew_secs: i64) -> bool {
        if self.access_token.is_empty() {
            return true;
        }
        match self.expiry {
            Some(expiry) => Utc::now() + Duration::seconds(skew_secs) >= expiry,
            None => false,
        }
    }
}

// 令牌不能出现在日志里
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"***")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "***"))
            .field("expiry", &self.expiry)
            .finish()
    }
}

/// 账号状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    #[default]
    Active,
    Disabled,
}

/// 账号记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    #[serde(rename = "type")]
    pub account_type: AccountType,
    pub email: String,
    /// 授权范围（存储中可能是空格分隔的字符串）
    #[serde(default, deserialize_with = "deserialize_scopes")]
    pub scopes: BTreeSet<String>,
    pub token: Credential,
    pub client: ClientConfig,
    #[serde(default)]
    pub status: AccountStatus,
    /// 创建时间（账号选择时最新的优先）
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn deserialize_scopes<'de, D>(deserializer: D) -> Result<BTreeSet<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scopes {
        Joined(String),
        List(Vec<String>),
    }

    Ok(match Scopes::deserialize(deserializer)? {
        Scopes::Joined(s) => s.split_whitespace().map(|s| s.to_string()).collect(),
        Scopes::List(list) => list.into_iter().collect(),
    })
}

/// 账号查询条件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountQuery {
    ById(String),
    ByType(AccountType),
}

/// 账号提示：调用方可以直接给出账号、给出账号ID，或交给选择策略
#[derive(Debug, Clone, Default)]
pub enum AccountHint {
    #[default]
    Auto,
    Id(String),
    Account(Box<Account>),
}

impl From<Account> for AccountHint {
    fn from(account: Account) -> Self {
        AccountHint::Account(Box::new(account))
    }
}
