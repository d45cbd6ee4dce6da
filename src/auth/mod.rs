// 认证模块

pub mod session;
pub mod store;
pub mod types;

pub use session::TokenSession;
pub use store::{select_canonical, CredentialStore, JsonCredentialStore, MemoryCredentialStore};
pub use types::{
    Account, AccountHint, AccountQuery, AccountStatus, AccountType, ClientConfig, Credential,
};
