use std::path::PathBuf;

use crate::entry::Entry;

/// 封闭的动作集合。解析器的输出与执行器支持的集合通过穷尽匹配保持一致。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Download,
    Export,
    UploadPhoto,
    AddFavorite,
    RemoveFavorite,
    AddOffline,
    RemoveOffline,
    MoveFilesFolders,
    UpdateFileFolder,
    Delete,
    DeleteForever,
    Restore,
    StartProcess,
    OpenWith,
    CreateFolder,
    UploadExtensionFiles,
}

impl ActionKind {
    pub const ALL: [ActionKind; 16] = [
        ActionKind::Download,
        ActionKind::Export,
        ActionKind::UploadPhoto,
        ActionKind::AddFavorite,
        ActionKind::RemoveFavorite,
        ActionKind::AddOffline,
        ActionKind::RemoveOffline,
        ActionKind::MoveFilesFolders,
        ActionKind::UpdateFileFolder,
        ActionKind::Delete,
        ActionKind::DeleteForever,
        ActionKind::Restore,
        ActionKind::StartProcess,
        ActionKind::OpenWith,
        ActionKind::CreateFolder,
        ActionKind::UploadExtensionFiles,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Download => "download",
            ActionKind::Export => "export",
            ActionKind::UploadPhoto => "upload_photo",
            ActionKind::AddFavorite => "add_favorite",
            ActionKind::RemoveFavorite => "remove_favorite",
            ActionKind::AddOffline => "add_offline",
            ActionKind::RemoveOffline => "remove_offline",
            ActionKind::MoveFilesFolders => "move_files_folders",
            ActionKind::UpdateFileFolder => "update_file_folder",
            ActionKind::Delete => "delete",
            ActionKind::DeleteForever => "delete_forever",
            ActionKind::Restore => "restore",
            ActionKind::StartProcess => "start_process",
            ActionKind::OpenWith => "open_with",
            ActionKind::CreateFolder => "create_folder",
            ActionKind::UploadExtensionFiles => "upload_extension_files",
        }
    }

    /// 成功后需要在事件总线上发布完成事件的动作。
    pub fn is_mutating(&self) -> bool {
        !matches!(
            self,
            ActionKind::Download | ActionKind::Export | ActionKind::OpenWith
        )
    }

    /// 执行时必须访问远端；会话登出后立即失败。
    /// Download 命中缓存时是纯本地复制，只在走网络的分支上检查会话。
    pub fn touches_remote(&self) -> bool {
        matches!(
            self,
            ActionKind::AddFavorite
                | ActionKind::RemoveFavorite
                | ActionKind::MoveFilesFolders
                | ActionKind::UpdateFileFolder
                | ActionKind::Delete
                | ActionKind::DeleteForever
                | ActionKind::Restore
                | ActionKind::StartProcess
                | ActionKind::CreateFolder
        )
    }

    pub fn supports_multi(&self) -> bool {
        matches!(
            self,
            ActionKind::AddFavorite
                | ActionKind::RemoveFavorite
                | ActionKind::AddOffline
                | ActionKind::RemoveOffline
                | ActionKind::MoveFilesFolders
                | ActionKind::Delete
                | ActionKind::DeleteForever
                | ActionKind::Restore
                | ActionKind::StartProcess
        )
    }

    /// 会改变当前上下文可用动作的完成事件。
    pub fn refreshes_context(&self) -> bool {
        matches!(
            self,
            ActionKind::AddFavorite
                | ActionKind::RemoveFavorite
                | ActionKind::AddOffline
                | ActionKind::RemoveOffline
                | ActionKind::MoveFilesFolders
                | ActionKind::UpdateFileFolder
                | ActionKind::StartProcess
        )
    }
}

/// 用户从系统选择器里挑选的本地文件。
#[derive(Clone, Debug, PartialEq)]
pub struct PickedFile {
    pub path: PathBuf,
    pub name: Option<String>,
    pub mime_type: Option<String>,
}

/// 需要用户交互的动作所收集到的输入；缺失时执行结果为 `Cancelled`。
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ActionInput {
    pub files: Vec<PickedFile>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub destination_id: Option<String>,
}

/// 不可变的动作值：种类 + 主目标，多选时附带全部目标。
#[derive(Clone, Debug, PartialEq)]
pub struct Action {
    pub kind: ActionKind,
    pub entry: Entry,
    pub entries: Vec<Entry>,
    pub input: Option<ActionInput>,
}

impl Action {
    pub fn new(kind: ActionKind, entry: Entry) -> Self {
        Self {
            kind,
            entry,
            entries: Vec::new(),
            input: None,
        }
    }

    /// 多选动作，主目标为合成的选择条目。
    pub fn multi(kind: ActionKind, entries: Vec<Entry>) -> Self {
        Self {
            kind,
            entry: Entry::with_selected_entries(&entries),
            entries,
            input: None,
        }
    }

    pub fn with_input(mut self, input: ActionInput) -> Self {
        self.input = Some(input);
        self
    }

    /// 保留种类与输入，换一个目标条目。
    pub fn copy(&self, entry: Entry) -> Self {
        Self {
            entry,
            ..self.clone()
        }
    }

    pub fn copy_with_entries(&self, entries: Vec<Entry>) -> Self {
        Self {
            entry: Entry::with_selected_entries(&entries),
            entries,
            ..self.clone()
        }
    }

    pub fn is_multi(&self) -> bool {
        !self.entries.is_empty()
    }

    /// 动作作用的全部条目：多选时为各成员，否则为主目标。
    pub fn targets(&self) -> &[Entry] {
        if self.entries.is_empty() {
            std::slice::from_ref(&self.entry)
        } else {
            &self.entries
        }
    }

    /// 执行成功后给用户的一次性提示。
    pub fn toast_message(&self) -> String {
        let count = self.targets().len();
        let subject = if self.is_multi() {
            format!("{count} items")
        } else {
            format!("\"{}\"", self.entry.name)
        };
        match self.kind {
            ActionKind::Download => format!("Downloading {subject}"),
            ActionKind::Export => format!("Exported {subject}"),
            ActionKind::UploadPhoto | ActionKind::UploadExtensionFiles => {
                let files = self.input.as_ref().map_or(0, |input| input.files.len());
                if files == 1 {
                    "1 file queued for upload".to_string()
                } else {
                    format!("{files} files queued for upload")
                }
            }
            ActionKind::AddFavorite => format!("Added {subject} to favorites"),
            ActionKind::RemoveFavorite => format!("Removed {subject} from favorites"),
            ActionKind::AddOffline => format!("{subject} will be available offline"),
            ActionKind::RemoveOffline => format!("{subject} removed from offline"),
            ActionKind::MoveFilesFolders => format!("Moved {subject}"),
            ActionKind::UpdateFileFolder => format!("Updated {subject}"),
            ActionKind::Delete => format!("Moved {subject} to trash"),
            ActionKind::DeleteForever => format!("Permanently deleted {subject}"),
            ActionKind::Restore => format!("Restored {subject}"),
            ActionKind::StartProcess => format!("Started a process for {subject}"),
            ActionKind::OpenWith => format!("Opening {subject}"),
            ActionKind::CreateFolder => format!("Created folder {subject}"),
        }
    }
}
