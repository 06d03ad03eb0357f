use crate::entry::{Entry, EntryType};

/// 多选最多可同时选中的条目数。
pub const MULTI_SELECTION_LIMIT: usize = 25;

/// 列表页的多选状态。保持选择顺序，分组伪行永远不可选。
#[derive(Clone, Debug, Default)]
pub struct MultiSelection {
    selected: Vec<Entry>,
}

impl MultiSelection {
    pub fn new() -> Self {
        Self::default()
    }

    /// 切换选中状态，返回切换后该条目是否处于选中。
    /// 已达上限时选择新条目是无操作；取消选择总是允许。
    pub fn toggle(&mut self, entry: &Entry) -> bool {
        if entry.entry_type == EntryType::Group {
            return false;
        }
        if let Some(index) = self.selected.iter().position(|e| e.id == entry.id) {
            self.selected.remove(index);
            return false;
        }
        if self.selected.len() >= MULTI_SELECTION_LIMIT {
            return false;
        }
        let mut entry = entry.clone();
        entry.is_selected_for_multi_selection = true;
        self.selected.push(entry);
        true
    }

    pub fn reset(&mut self) {
        self.selected.clear();
    }

    pub fn selected(&self) -> &[Entry] {
        &self.selected
    }

    pub fn len(&self) -> usize {
        self.selected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.selected.is_empty()
    }

    pub fn is_selected(&self, entry_id: &str) -> bool {
        self.selected.iter().any(|e| e.id == entry_id)
    }

    /// 把选中标记同步到一页列表条目上。
    pub fn apply_to(&self, entries: &[Entry]) -> Vec<Entry> {
        entries
            .iter()
            .map(|entry| Entry {
                is_selected_for_multi_selection: self.is_selected(&entry.id),
                ..entry.clone()
            })
            .collect()
    }

    /// 选择发生变化后（例如动作完成）用新条目替换旧值，已不存在的条目移出选择。
    pub fn refresh(&mut self, updated: &[Entry]) {
        self.selected = self
            .selected
            .iter()
            .filter_map(|old| updated.iter().find(|e| e.id == old.id))
            .map(|entry| Entry {
                is_selected_for_multi_selection: true,
                ..entry.clone()
            })
            .collect();
    }

    /// 合成的多选目标；没有选中任何条目时为 `None`。
    pub fn target(&self) -> Option<Entry> {
        (!self.selected.is_empty()).then(|| Entry::with_selected_entries(&self.selected))
    }
}
