// 账号凭证存储

use crate::auth::types::{Account, AccountQuery, AccountStatus, ClientConfig, Credential};
use crate::error::{DriveError, DriveResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// 凭证存储
///
/// 由外部的授权流程写入账号，传输引擎只读取；
/// 唯一的写操作是把刷新后的令牌写回
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// 按条件查找账号（按类型查询时返回当前的规范账号）
    async fn find_account(&self, query: &AccountQuery) -> DriveResult<Option<Account>>;

    /// 按ID查找客户端配置
    async fn find_client_config(&self, id: &str) -> DriveResult<Option<ClientConfig>>;

    /// 保存刷新后的凭证（默认不持久化）
    async fn save_credential(&self, _account_id: &str, _credential: &Credential) -> DriveResult<()> {
        Ok(())
    }
}

/// 选择规范账号
///
/// - 按ID查询：直接匹配ID
/// - 按类型查询：状态为启用、客户端有项目ID、创建时间最新的账号
pub fn select_canonical<'a, I>(accounts: I, query: &AccountQuery) -> Option<&'a Account>
where
    I: IntoIterator<Item = &'a Account>,
{
    match query {
        AccountQuery::ById(id) => accounts.into_iter().find(|a| &a.id == id),
        AccountQuery::ByType(account_type) => accounts
            .into_iter()
            .filter(|a| a.account_type == *account_type)
            .filter(|a| a.status == AccountStatus::Active)
            .filter(|a| a.client.project_id.is_some())
            .max_by_key(|a| a.created_at),
    }
}

/// 存储文件内容
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreData {
    #[serde(default)]
    pub clients: Vec<ClientConfig>,
    #[serde(default)]
    pub accounts: Vec<Account>,
}

impl StoreData {
    fn find_account(&self, query: &AccountQuery) -> Option<Account> {
        select_canonical(&self.accounts, query).cloned()
    }

    fn find_client(&self, id: &str) -> Option<ClientConfig> {
        self.clients.iter().find(|c| c.id == id).cloned()
    }

    fn update_credential(&mut self, account_id: &str, credential: &Credential) -> bool {
        match self.accounts.iter_mut().find(|a| a.id == account_id) {
            Some(account) => {
                account.token = credential.clone();
                true
            }
            None => false,
        }
    }
}

/// 内存凭证存储
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    data: RwLock<StoreData>,
}

impl MemoryCredentialStore {
    pub fn new(accounts: Vec<Account>) -> Self {
        let clients = accounts.iter().map(|a| a.client.clone()).collect();
        Self {
            data: RwLock::new(StoreData { clients, accounts }),
        }
    }

    /// 当前保存的账号快照
    pub fn accounts(&self) -> Vec<Account> {
        match self.data.read() {
            Ok(data) => data.accounts.clone(),
            Err(poisoned) => poisoned.into_inner().accounts.clone(),
        }
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn find_account(&self, query: &AccountQuery) -> DriveResult<Option<Account>> {
        let data = self
            .data
            .read()
            .map_err(|_| DriveError::auth("凭证存储锁已损坏"))?;
        Ok(data.find_account(query))
    }

    async fn find_client_config(&self, id: &str) -> DriveResult<Option<ClientConfig>> {
        let data = self
            .data
            .read()
            .map_err(|_| DriveError::auth("凭证存储锁已损坏"))?;
        Ok(data.find_client(id))
    }

    async fn save_credential(&self, account_id: &str, credential: &Credential) -> DriveResult<()> {
        let mut data = self
            .data
            .write()
            .map_err(|_| DriveError::auth("凭证存储锁已损坏"))?;
        data.update_credential(account_id, credential);
        Ok(())
    }
}

/// JSON 文件凭证存储
///
/// 文件格式：`{ "clients": [...], "accounts": [...] }`，打开时一次性加载
#[derive(Debug)]
pub struct JsonCredentialStore {
    path: PathBuf,
    data: Mutex<StoreData>,
}

impl JsonCredentialStore {
    /// 打开凭证文件
    pub async fn open(path: impl AsRef<Path>) -> DriveResult<Self> {
        let path = path.as_ref().to_path_buf();
        let content = tokio::fs::read(&path).await?;
        let data: StoreData = serde_json::from_slice(&content)?;
        info!(
            "凭证文件加载成功: {:?}, 客户端 {} 个, 账号 {} 个",
            path,
            data.clients.len(),
            data.accounts.len()
        );
        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, data: &StoreData) -> DriveResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let content = serde_json::to_vec_pretty(data)?;
        // 先写临时文件再重命名，避免写到一半时文件损坏
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for JsonCredentialStore {
    async fn find_account(&self, query: &AccountQuery) -> DriveResult<Option<Account>> {
        Ok(self.data.lock().await.find_account(query))
    }

    async fn find_client_config(&self, id: &str) -> DriveResult<Option<ClientConfig>> {
        Ok(self.data.lock().await.find_client(id))
    }

    async fn save_credential(&self, account_id: &str, credential: &Credential) -> DriveResult<()> {
        let mut data = self.data.lock().await;
        if !data.update_credential(account_id, credential) {
            return Err(DriveError::NotFound(format!("账号 {}", account_id)));
        }
        self.persist(&data).await?;
        debug!("已保存账号 {} 的新令牌", account_id);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::auth::types::AccountType;
    use chrono::{Duration, Utc};
    use std::collections::BTreeSet;

    pub(crate) fn account(id: &str, account_type: AccountType) -> Account {
        Account {
            id: id.to_string(),
            account_type,
            email: format!("{}@example.com", id),
            scopes: BTreeSet::new(),
            token: Credential {
                access_token: format!("token-{}", id),
                refresh_token: Some(format!("refresh-{}", id)),
                expiry: Some(Utc::now() + Duration::hours(1)),
                token_type: Some("Bearer".into()),
                scope: None,
            },
            client: ClientConfig {
                id: "client-1".into(),
                client_id: "cid".into(),
                client_secret: "secret".into(),
                redirect_uri: None,
                project_id: Some("project".into()),
            },
            status: AccountStatus::Active,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_select_canonical_newest_active_with_project() {
        let now = Utc::now();
        let mut old = account("old", AccountType::Upload);
        old.created_at = now - Duration::days(2);
        let mut newest_disabled = account("disabled", AccountType::Upload);
        newest_disabled.created_at = now;
        newest_disabled.status = AccountStatus::Disabled;
        let mut no_project = account("no-project", AccountType::Upload);
        no_project.created_at = now;
        no_project.client.project_id = None;
        let mut current = account("current", AccountType::Upload);
        current.created_at = now - Duration::days(1);
        let download = account("download", AccountType::Download);

        let accounts = vec![old, newest_disabled, no_project, current, download];
        let picked = select_canonical(&accounts, &AccountQuery::ByType(AccountType::Upload));
        assert_eq!(picked.map(|a| a.id.as_str()), Some("current"));

        let picked = select_canonical(&accounts, &AccountQuery::ByType(AccountType::Download));
        assert_eq!(picked.map(|a| a.id.as_str()), Some("download"));

        let picked = select_canonical(&accounts, &AccountQuery::ById("old".into()));
        assert_eq!(picked.map(|a| a.id.as_str()), Some("old"));
    }

    #[tokio::test]
    async fn test_memory_store_save_credential() {
        let store = MemoryCredentialStore::new(vec![account("a", AccountType::Download)]);
        let mut cred = account("a", AccountType::Download).token;
        cred.access_token = "rotated".into();
        store.save_credential("a", &cred).await.unwrap();
        assert_eq!(store.accounts()[0].token.access_token, "rotated");

        let client = store.find_client_config("client-1").await.unwrap();
        assert_eq!(client.map(|c| c.client_id), Some("cid".to_string()));
    }

    #[tokio::test]
    async fn test_json_store_roundtrip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        let data = StoreData {
            clients: vec![account("a", AccountType::Upload).client],
            accounts: vec![account("a", AccountType::Upload)],
        };
        tokio::fs::write(&path, serde_json::to_vec(&data).unwrap())
            .await
            .unwrap();

        let store = JsonCredentialStore::open(&path).await.unwrap();
        let found = store
            .find_account(&AccountQuery::ByType(AccountType::Upload))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, "a");

        let mut cred = found.token.clone();
        cred.access_token = "persisted".into();
        store.save_credential("a", &cred).await.unwrap();

        let reopened = JsonCredentialStore::open(&path).await.unwrap();
        let found = reopened
            .find_account(&AccountQuery::ById("a".into()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.token.access_token, "persisted");

        assert!(store.save_credential("missing", &cred).await.is_err());
    }
}
