use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{Action, ActionResolver, ResolvedActions};
use crate::entry::{Entry, EntryType, OfflineLookup};
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::remote::RemoteRepository;

/// 某个选择上下文（单选或多选）当前的动作状态快照。
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ContextualState {
    pub entries: Vec<Entry>,
    pub actions: Vec<Action>,
    pub top_actions: Vec<Action>,
    pub is_multi_selection: bool,
    /// 补全部分条目失败时的错误；此时动作按原始条目计算。
    pub fetch_error: Option<Error>,
}

impl ContextualState {
    fn single(entry: Entry, resolved: ResolvedActions, fetch_error: Option<Error>) -> Self {
        Self {
            entries: vec![entry],
            actions: resolved.actions,
            top_actions: resolved.top_actions,
            is_multi_selection: false,
            fetch_error,
        }
    }

    /// 事件对应的目标是否就是本上下文的目标。
    fn targets(&self, action: &Action) -> bool {
        if self.is_multi_selection {
            action.is_multi() && Entry::with_selected_entries(&self.entries).id == action.entry.id
        } else {
            !action.is_multi() && self.entries.first().is_some_and(|e| e.id == action.entry.id)
        }
    }
}

/// 选择上下文的动作列表，订阅完成事件后在本地重新计算，不再请求网络。
/// 丢弃时停止订阅。
pub struct ContextualActions {
    resolver: ActionResolver,
    state: Arc<Mutex<ContextualState>>,
    listener: Option<JoinHandle<()>>,
}

impl ContextualActions {
    /// 单选。部分条目（且不在离线视图中）先向远端补全，失败时退回原条目。
    pub async fn load(
        entry: Entry,
        resolver: ActionResolver,
        remote: &dyn RemoteRepository,
        lookup: &dyn OfflineLookup,
    ) -> Self {
        let state = if entry.is_partial && !entry.has_offline_status() {
            match hydrate(&entry, remote, lookup).await {
                Ok(full) => {
                    let resolved = resolver.resolve(&full);
                    ContextualState::single(full, resolved, None)
                }
                Err(err) => {
                    warn!(entry_id = %entry.id, error = %err, "failed to fetch full entry");
                    let resolved = resolver.resolve(&entry);
                    ContextualState::single(entry, resolved, Some(err))
                }
            }
        } else {
            let resolved = resolver.resolve(&entry);
            ContextualState::single(entry, resolved, None)
        };
        Self::from_state(resolver, state)
    }

    pub fn multi(entries: Vec<Entry>, resolver: ActionResolver) -> Result<Self> {
        let resolved = resolver.resolve_multi(&entries)?;
        Ok(Self::from_state(
            resolver,
            ContextualState {
                entries,
                actions: resolved.actions,
                top_actions: Vec::new(),
                is_multi_selection: true,
                fetch_error: None,
            },
        ))
    }

    fn from_state(resolver: ActionResolver, state: ContextualState) -> Self {
        Self {
            resolver,
            state: Arc::new(Mutex::new(state)),
            listener: None,
        }
    }

    /// 开始监听会影响可用动作的完成事件。重复调用会替换之前的订阅。
    pub fn attach(&mut self, bus: &EventBus) {
        let mut subscription = bus
            .actions()
            .subscribe_filtered(|action| action.kind.refreshes_context());
        let state = self.state.clone();
        let resolver = self.resolver;
        let listener = tokio::spawn(async move {
            while let Some(action) = subscription.recv().await {
                apply_event(&state, resolver, &action);
            }
        });
        if let Some(previous) = self.listener.replace(listener) {
            previous.abort();
        }
    }

    pub fn state(&self) -> ContextualState {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// 用事件携带的条目重新计算；目标不匹配时忽略并返回 `false`。
    pub fn apply(&self, action: &Action) -> bool {
        apply_event(&self.state, self.resolver, action)
    }
}

impl Drop for ContextualActions {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

fn apply_event(state: &Mutex<ContextualState>, resolver: ActionResolver, action: &Action) -> bool {
    let mut state = state.lock().unwrap_or_else(|p| p.into_inner());
    if !state.targets(action) {
        return false;
    }
    if state.is_multi_selection {
        match resolver.resolve_multi(&action.entries) {
            Ok(resolved) => {
                state.entries = action.entries.clone();
                state.actions = resolved.actions;
                state.top_actions = Vec::new();
            }
            Err(err) => {
                warn!(error = %err, "ignoring completion event with unusable selection");
                return false;
            }
        }
    } else {
        let resolved = resolver.resolve(&action.entry);
        *state = ContextualState::single(action.entry.clone(), resolved, None);
    }
    debug!(kind = action.kind.as_str(), "recomputed contextual actions");
    true
}

/// 补全部分条目：站点通过收藏站点接口，其余通过节点接口。
pub(crate) async fn hydrate(
    entry: &Entry,
    remote: &dyn RemoteRepository,
    lookup: &dyn OfflineLookup,
) -> Result<Entry> {
    match entry.entry_type {
        EntryType::Site => Entry::from_favorite(remote.fetch_favorite_site(&entry.id).await?, lookup),
        _ => Ok(Entry::from_node(remote.fetch_node(&entry.id).await?, lookup)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::ActionKind;
    use crate::entry::OfflineStatus;
    use crate::testing::{file_entry, file_node, MockRemote};
    use std::time::Duration;

    fn kinds(actions: &[Action]) -> Vec<ActionKind> {
        actions.iter().map(|a| a.kind).collect()
    }

    #[tokio::test]
    async fn test_partial_entry_is_hydrated() {
        let remote = MockRemote::default();
        let mut node = file_node("n1", "p1");
        node.is_favorite = Some(true);
        node.allowable_operations = Some(vec!["delete".to_string()]);
        remote.set_node(node);
        let partial = Entry {
            is_partial: true,
            ..file_entry("n1", "a.txt")
        };

        let ctx = ContextualActions::load(partial, ActionResolver::default(), &remote, &()).await;
        let state = ctx.state();
        assert!(state.fetch_error.is_none());
        assert!(!state.entries[0].is_partial);
        assert!(kinds(&state.actions).contains(&ActionKind::RemoveFavorite));
        assert!(kinds(&state.actions).contains(&ActionKind::Delete));
        assert_eq!(remote.calls_to("fetch_node"), 1);
    }

    #[tokio::test]
    async fn test_hydration_failure_keeps_given_entry() {
        let remote = MockRemote::default();
        let partial = Entry {
            is_partial: true,
            ..file_entry("missing", "a.txt")
        };
        let ctx = ContextualActions::load(partial, ActionResolver::default(), &remote, &()).await;
        let state = ctx.state();
        assert!(matches!(state.fetch_error, Some(Error::NotFound(_))));
        assert_eq!(state.entries[0].id, "missing");
        assert_eq!(
            kinds(&state.top_actions),
            vec![ActionKind::AddFavorite, ActionKind::Download]
        );
    }

    #[tokio::test]
    async fn test_offline_partial_entry_is_not_fetched() {
        let remote = MockRemote::default();
        let entry = Entry {
            is_partial: true,
            ..file_entry("n1", "a.txt").with_offline_flags(true, false, OfflineStatus::Synced)
        };
        let ctx = ContextualActions::load(entry, ActionResolver::default(), &remote, &()).await;
        assert_eq!(remote.calls_to("fetch_node"), 0);
        assert!(kinds(&ctx.state().actions).contains(&ActionKind::RemoveOffline));
    }

    #[tokio::test]
    async fn test_completion_event_recomputes_locally() {
        let remote = MockRemote::default();
        let bus = EventBus::new();
        let entry = file_entry("n1", "a.txt");
        let mut ctx = ContextualActions::load(entry.clone(), ActionResolver::default(), &remote, &()).await;
        ctx.attach(&bus);

        // 其它条目的事件被忽略
        bus.actions().publish(Action::new(
            ActionKind::AddFavorite,
            Entry {
                is_favorite: true,
                ..file_entry("n2", "b.txt")
            },
        ));
        bus.actions().publish(Action::new(
            ActionKind::AddFavorite,
            Entry {
                is_favorite: true,
                ..entry
            },
        ));

        for _ in 0..200 {
            if kinds(&ctx.state().top_actions).contains(&ActionKind::RemoveFavorite) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let state = ctx.state();
        assert_eq!(state.entries[0].id, "n1");
        assert_eq!(
            kinds(&state.top_actions),
            vec![ActionKind::RemoveFavorite, ActionKind::Download]
        );
        assert_eq!(remote.calls_to("fetch_node"), 0);
    }

    #[test]
    fn test_multi_context_applies_matching_selection() {
        let entries = vec![file_entry("n1", "a"), file_entry("n2", "b")];
        let ctx = ContextualActions::multi(entries.clone(), ActionResolver::default()).unwrap();
        assert!(kinds(&ctx.state().actions).contains(&ActionKind::AddOffline));

        let updated: Vec<Entry> = entries
            .iter()
            .map(|e| e.clone().with_offline_flags(true, false, OfflineStatus::Pending))
            .collect();
        assert!(!ctx.apply(&Action::new(ActionKind::AddOffline, updated[0].clone())));
        assert!(ctx.apply(&Action::multi(ActionKind::AddOffline, updated)));

        let state = ctx.state();
        assert!(state.is_multi_selection);
        assert!(state.entries.iter().all(|e| e.is_offline));
        assert!(kinds(&state.actions).contains(&ActionKind::RemoveOffline));
        assert!(state.top_actions.is_empty());
    }

    #[test]
    fn test_multi_rejects_empty_selection() {
        assert!(matches!(
            ContextualActions::multi(Vec::new(), ActionResolver::default()),
            Err(Error::IllegalSelection(_))
        ));
    }
}
