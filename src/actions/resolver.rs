use super::{Action, ActionKind};
use crate::entry::{Entry, EntryType};
use crate::error::{Error, Result};

/// 解析结果：完整动作列表 + 工具栏上的精简集合。
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResolvedActions {
    pub actions: Vec<Action>,
    pub top_actions: Vec<Action>,
}

impl ResolvedActions {
    pub fn kinds(&self) -> Vec<ActionKind> {
        self.actions.iter().map(|a| a.kind).collect()
    }

    pub fn top_kinds(&self) -> Vec<ActionKind> {
        self.top_actions.iter().map(|a| a.kind).collect()
    }
}

/// 根据条目状态计算可用动作。纯函数，不做任何 I/O。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ActionResolver {
    pub process_enabled: bool,
}

impl ActionResolver {
    pub fn new(process_enabled: bool) -> Self {
        Self { process_enabled }
    }

    pub fn resolve(&self, entry: &Entry) -> ResolvedActions {
        let kinds = if entry.is_trashed {
            vec![ActionKind::Restore, ActionKind::DeleteForever]
        } else if entry.has_offline_status() {
            // 离线视图：不提供收藏、移动、删除
            let mut kinds = external_kinds(entry);
            kinds.extend(self.process_kind(entry));
            kinds.extend(offline_kind(entry));
            kinds
        } else {
            let mut kinds = external_kinds(entry);
            kinds.push(favorite_kind(entry));
            kinds.extend(self.process_kind(entry));
            kinds.extend(rename_move_kinds(entry));
            kinds.extend(offline_kind(entry));
            if entry.can_delete {
                kinds.push(ActionKind::Delete);
            }
            kinds
        };

        let top = if entry.is_trashed {
            Vec::new()
        } else {
            top_kinds(entry)
        };

        ResolvedActions {
            actions: single_actions(entry, kinds),
            top_actions: single_actions(entry, top),
        }
    }

    /// 多选解析。空选择或包含分组行属于调用方错误。
    pub fn resolve_multi(&self, entries: &[Entry]) -> Result<ResolvedActions> {
        if entries.is_empty() {
            return Err(Error::illegal_selection("multi-selection is empty"));
        }
        if let Some(group) = entries.iter().find(|e| e.entry_type == EntryType::Group) {
            return Err(Error::illegal_selection(format!(
                "group row {} cannot be part of a selection",
                group.id
            )));
        }

        let kinds = if entries.iter().all(|e| e.is_trashed) {
            vec![ActionKind::Restore, ActionKind::DeleteForever]
        } else {
            self.shared_kinds(entries)
        };
        Ok(ResolvedActions {
            actions: kinds
                .into_iter()
                .map(|kind| Action::multi(kind, entries.to_vec()))
                .collect(),
            top_actions: Vec::new(),
        })
    }

    /// 多选共用的动作集合（全部离线的情况也复用这一套）。
    fn shared_kinds(&self, entries: &[Entry]) -> Vec<ActionKind> {
        let mut kinds = Vec::new();
        if entries.iter().any(|e| !e.is_favorite) {
            kinds.push(ActionKind::AddFavorite);
        } else {
            kinds.push(ActionKind::RemoveFavorite);
        }
        if self.process_enabled && entries.iter().all(Entry::is_file) {
            kinds.push(ActionKind::StartProcess);
        }
        let move_delete_allowed = is_move_delete_allowed(entries);
        if move_delete_allowed {
            kinds.push(ActionKind::MoveFilesFolders);
        }
        kinds.push(offline_multi_kind(entries));
        if move_delete_allowed {
            kinds.push(ActionKind::Delete);
        }
        kinds
    }

    fn process_kind(&self, entry: &Entry) -> Option<ActionKind> {
        (self.process_enabled && entry.is_file()).then_some(ActionKind::StartProcess)
    }
}

/// 每个条目都允许删除时才提供移动和删除。
pub fn is_move_delete_allowed(entries: &[Entry]) -> bool {
    !entries.is_empty() && entries.iter().all(|e| e.can_delete)
}

fn single_actions(entry: &Entry, kinds: Vec<ActionKind>) -> Vec<Action> {
    kinds
        .into_iter()
        .map(|kind| Action::new(kind, entry.clone()))
        .collect()
}

fn external_kinds(entry: &Entry) -> Vec<ActionKind> {
    if entry.is_file() {
        vec![ActionKind::OpenWith, ActionKind::Download]
    } else {
        Vec::new()
    }
}

fn favorite_kind(entry: &Entry) -> ActionKind {
    if entry.is_favorite {
        ActionKind::RemoveFavorite
    } else {
        ActionKind::AddFavorite
    }
}

fn rename_move_kinds(entry: &Entry) -> Vec<ActionKind> {
    if entry.can_delete && (entry.is_file() || entry.is_folder()) {
        vec![ActionKind::UpdateFileFolder, ActionKind::MoveFilesFolders]
    } else {
        Vec::new()
    }
}

/// 只有文件和文件夹能切换离线；离线文件夹的子项不能单独切换。
fn offline_kind(entry: &Entry) -> Option<ActionKind> {
    if !entry.is_file() && !entry.is_folder() {
        return None;
    }
    if entry.has_offline_status() && !entry.is_offline {
        return None;
    }
    Some(if entry.is_offline {
        ActionKind::RemoveOffline
    } else {
        ActionKind::AddOffline
    })
}

/// 多选离线切换时参与判断与执行的成员：未进回收站的文件/文件夹，且不是离线文件夹的子项。
pub(crate) fn toggles_offline(entry: &Entry) -> bool {
    (entry.is_file() || entry.is_folder())
        && !entry.is_trashed
        && !entry.is_upload
        && (!entry.has_offline_status() || entry.is_offline)
}

fn offline_multi_kind(entries: &[Entry]) -> ActionKind {
    let any_not_offline = entries
        .iter()
        .filter(|e| toggles_offline(e))
        .any(|e| !e.is_offline);
    if any_not_offline {
        ActionKind::AddOffline
    } else {
        ActionKind::RemoveOffline
    }
}

fn top_kinds(entry: &Entry) -> Vec<ActionKind> {
    let mut kinds = Vec::new();
    if !entry.has_offline_status() {
        kinds.push(favorite_kind(entry));
    }
    if entry.is_file() {
        kinds.push(ActionKind::Download);
    }
    kinds
}
