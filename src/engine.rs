use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::actions::{ActionExecutor, ActionResolver, ContextualActions};
use crate::db::{default_cache_root, Database};
use crate::entry::Entry;
use crate::error::Result;
use crate::events::EventBus;
use crate::offline::{ContentCache, OfflineRepository, SqliteOfflineStore};
use crate::remote::RemoteRepository;
use crate::session::Session;
use crate::settings::EngineSettings;
use crate::transfer::{HttpTransferService, TransferService, TransferWorker, WorkerConfig, WorkerHandle};

/// 组装好的引擎：一个会话对应一套仓库、事件总线、执行器与传输后台。
pub struct Engine {
    session: Session,
    database: Arc<Database>,
    settings: EngineSettings,
    bus: EventBus,
    remote: Arc<dyn RemoteRepository>,
    repository: Arc<OfflineRepository>,
    resolver: ActionResolver,
    executor: ActionExecutor,
    worker: TransferWorker,
}

impl Engine {
    pub fn open(
        session: Session,
        remote: Arc<dyn RemoteRepository>,
        transfers: Arc<dyn TransferService>,
        database: Arc<Database>,
        cache_root: impl AsRef<Path>,
    ) -> Result<Self> {
        let settings = EngineSettings::load(&database)?;
        let account_id = session.account().id.clone();
        let repository = Arc::new(OfflineRepository::new(
            Arc::new(SqliteOfflineStore::new(database.clone(), &account_id)),
            ContentCache::new(cache_root, &account_id),
        ));
        let bus = EventBus::new();
        let resolver = ActionResolver::new(settings.process_enabled);
        let executor = ActionExecutor::new(
            session.clone(),
            remote.clone(),
            repository.clone(),
            transfers.clone(),
            bus.clone(),
            settings.export_directory.clone(),
        );
        let worker = TransferWorker::new(
            session.clone(),
            repository.clone(),
            remote.clone(),
            transfers,
            bus.clone(),
            WorkerConfig::from(&settings),
        );
        session.on_signed_out(|account| {
            info!(account_id = %account.id, "session signed out, remote actions disabled");
        });
        info!(
            account_id = %account_id,
            max_concurrency = settings.max_concurrency,
            "content sync engine opened"
        );
        Ok(Self {
            session,
            database,
            settings,
            bus,
            remote,
            repository,
            resolver,
            executor,
            worker,
        })
    }

    /// 使用平台默认的数据库、缓存目录与 HTTP 传输服务。
    pub fn open_default(session: Session, remote: Arc<dyn RemoteRepository>) -> Result<Self> {
        let database = Arc::new(Database::open_default()?);
        let transfers = Arc::new(HttpTransferService::new()?);
        Self::open(session, remote, transfers, database, default_cache_root()?)
    }

    /// 恢复中断的传输并开始后台同步。丢弃返回的句柄即停止监听。
    pub async fn start(&self) -> Result<WorkerHandle> {
        let folders = self.repository.requeue_synced_folders()?;
        let recovered = self.worker.recover()?;
        let handle = self.worker.start();
        let started = self.worker.scan().await?;
        info!(folders, recovered, started, "transfer worker started");
        Ok(handle)
    }

    /// 单选上下文，已订阅完成事件。
    pub async fn contextual_actions(&self, entry: Entry) -> ContextualActions {
        let mut context = ContextualActions::load(
            entry,
            self.resolver,
            self.remote.as_ref(),
            self.repository.as_ref(),
        )
        .await;
        context.attach(&self.bus);
        context
    }

    pub fn contextual_actions_multi(&self, entries: Vec<Entry>) -> Result<ContextualActions> {
        let mut context = ContextualActions::multi(entries, self.resolver)?;
        context.attach(&self.bus);
        Ok(context)
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.database
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn repository(&self) -> &Arc<OfflineRepository> {
        &self.repository
    }

    pub fn resolver(&self) -> ActionResolver {
        self.resolver
    }

    pub fn executor(&self) -> &ActionExecutor {
        &self.executor
    }

    pub fn worker(&self) -> &TransferWorker {
        &self.worker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{Action, ActionKind};
    use crate::entry::OfflineStatus;
    use crate::settings::{set_process_enabled, set_transfer_concurrency};
    use crate::testing::{file_entry, test_session, MockRemote, MockTransferService};
    use std::time::Duration;

    fn engine(dir: &Path, database: Arc<Database>) -> Engine {
        Engine::open(
            test_session(),
            Arc::new(MockRemote::default()),
            Arc::new(MockTransferService::default()),
            database,
            dir,
        )
        .unwrap()
    }

    async fn wait_for_status(engine: &Engine, id: &str, status: OfflineStatus) {
        for _ in 0..400 {
            let current = engine.repository().fetch(id).unwrap().map(|r| r.status());
            if current == Some(status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("{id} never reached {status:?}");
    }

    #[tokio::test]
    async fn test_open_applies_stored_settings() {
        let dir = tempfile::tempdir().unwrap();
        let database = Arc::new(Database::open_in_memory().unwrap());
        set_process_enabled(&database, true).unwrap();
        set_transfer_concurrency(&database, 2).unwrap();

        let engine = engine(dir.path(), database);
        assert_eq!(engine.settings().max_concurrency, 2);
        assert!(engine.resolver().process_enabled);
        let resolved = engine.resolver().resolve(&file_entry("n1", "a.txt"));
        assert!(resolved.kinds().contains(&ActionKind::StartProcess));
    }

    #[tokio::test]
    async fn test_start_resumes_interrupted_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let database = Arc::new(Database::open_in_memory().unwrap());
        {
            let previous = engine(dir.path(), database.clone());
            previous.repository().mark_offline(&file_entry("n1", "a.txt")).unwrap();
            previous.repository().begin_transfer("n1").unwrap().unwrap();
        }

        let engine = engine(dir.path(), database);
        let _handle = engine.start().await.unwrap();
        wait_for_status(&engine, "n1", OfflineStatus::Synced).await;
    }

    #[tokio::test]
    async fn test_executed_add_offline_reaches_synced() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), Arc::new(Database::open_in_memory().unwrap()));
        let _handle = engine.start().await.unwrap();
        let entry = file_entry("n1", "a.txt");
        let context = engine.contextual_actions(entry.clone()).await;

        engine
            .executor()
            .execute(&Action::new(ActionKind::AddOffline, entry))
            .await
            .unwrap();
        wait_for_status(&engine, "n1", OfflineStatus::Synced).await;

        let state = context.state();
        assert!(state.entries[0].is_offline);
        assert!(state
            .actions
            .iter()
            .any(|a| a.kind == ActionKind::RemoveOffline));
    }
}
