use crate::error::{Error, Result};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, RwLock,
};
use tracing::info;
use url::Url;

/// 已登录账户的基础信息，由外部 Session Provider 提供。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Account {
    pub id: String,
    pub server_url: String,
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub my_files: Option<String>,
}

type SignOutListener = Box<dyn Fn(&Account) + Send + Sync>;

/// 当前会话：显式传递给每个需要它的组件，不存在进程级单例。
/// Clone 开销很低，所有克隆共享同一份 token 与登出状态。
#[derive(Clone)]
pub struct Session {
    account: Account,
    access_token: Arc<RwLock<String>>,
    signed_out: Arc<AtomicBool>,
    listeners: Arc<Mutex<Vec<SignOutListener>>>,
}

impl Session {
    pub fn new(account: Account, access_token: impl Into<String>) -> Self {
        Self {
            account,
            access_token: Arc::new(RwLock::new(access_token.into())),
            signed_out: Arc::new(AtomicBool::new(false)),
            listeners: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    /// REST 接口根地址：`{server}/api/-default-/public/`。
    pub fn base_url(&self) -> Result<Url> {
        let server = self.account.server_url.trim_end_matches('/');
        Url::parse(&format!("{server}/api/-default-/public/"))
            .map_err(|e| Error::Configuration(format!("invalid server url {server}: {e}")))
    }

    pub fn access_token(&self) -> Result<String> {
        self.ensure_active()?;
        let token = self
            .access_token
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        Ok(token)
    }

    /// token 刷新由外部完成，这里只负责替换。
    pub fn update_access_token(&self, token: impl Into<String>) {
        *self
            .access_token
            .write()
            .unwrap_or_else(|p| p.into_inner()) = token.into();
    }

    /// 注册登出回调；回调在 `sign_out` 时同步触发。
    pub fn on_signed_out(&self, listener: impl Fn(&Account) + Send + Sync + 'static) {
        let mut listeners = self.listeners.lock().unwrap_or_else(|p| p.into_inner());
        listeners.push(Box::new(listener));
    }

    /// 外部硬中断：之后所有需要访问远端的操作都会立即失败，
    /// 已排队的本地传输记录保持不变。
    pub fn sign_out(&self) {
        if self.signed_out.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(account_id = %self.account.id, "session signed out");
        let listeners = self.listeners.lock().unwrap_or_else(|p| p.into_inner());
        for listener in listeners.iter() {
            listener(&self.account);
        }
    }

    pub fn is_signed_out(&self) -> bool {
        self.signed_out.load(Ordering::SeqCst)
    }

    pub fn ensure_active(&self) -> Result<()> {
        if self.is_signed_out() {
            Err(Error::SignedOut)
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("account", &self.account)
            .field("signed_out", &self.is_signed_out())
            .finish()
    }
}
