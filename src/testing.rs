//! 测试用的夹具与远端/传输服务替身。

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use crate::entry::{ContentInfo, Entry, EntryType, Favorite, Node, NodeChildAssociation};
use crate::error::{Error, Result};
use crate::offline::TransferDirection;
use crate::remote::{Paging, RemoteRepository};
use crate::session::{Account, Session};
use crate::transfer::{TransferId, TransferRequest, TransferService, TransferState};

const DEFAULT_BODY: &[u8] = b"content";

fn fixed_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()
}

pub fn file_entry(id: &str, name: &str) -> Entry {
    Entry {
        id: id.to_string(),
        parent_id: Some("root".to_string()),
        entry_type: EntryType::File,
        name: name.to_string(),
        mime_type: Some("text/plain".to_string()),
        modified: Some(fixed_time()),
        ..Entry::default()
    }
}

pub fn folder_entry(id: &str, name: &str) -> Entry {
    Entry {
        entry_type: EntryType::Folder,
        mime_type: None,
        ..file_entry(id, name)
    }
}

pub fn file_node(id: &str, parent_id: &str) -> Node {
    Node {
        id: id.to_string(),
        parent_id: Some(parent_id.to_string()),
        node_type: "cm:content".to_string(),
        name: format!("{id}.txt"),
        is_file: true,
        content: Some(ContentInfo {
            mime_type: Some("text/plain".to_string()),
            size_in_bytes: Some(DEFAULT_BODY.len() as u64),
        }),
        modified_at: Some(fixed_time()),
        is_favorite: Some(false),
        allowable_operations: Some(Vec::new()),
        ..Node::default()
    }
}

pub fn child_node(id: &str, parent_id: &str) -> NodeChildAssociation {
    NodeChildAssociation {
        node: file_node(id, parent_id),
        association: None,
    }
}

pub fn test_session() -> Session {
    Session::new(
        Account {
            id: "alice".to_string(),
            server_url: "https://repo.example.com".to_string(),
            display_name: Some("Alice".to_string()),
            email: None,
            my_files: Some("root".to_string()),
        },
        "token",
    )
}

#[derive(Default)]
struct RemoteState {
    nodes: HashMap<String, Node>,
    children: HashMap<String, Vec<NodeChildAssociation>>,
    favorite_sites: HashMap<String, Favorite>,
    failures: HashMap<String, Error>,
    calls: Vec<String>,
    created: usize,
}

/// 内存中的远端仓库，记录每次调用，可预置一次性失败。
#[derive(Default)]
pub struct MockRemote {
    state: Mutex<RemoteState>,
}

impl MockRemote {
    fn state(&self) -> std::sync::MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap()
    }

    fn record(&self, operation: &str) -> Result<std::sync::MutexGuard<'_, RemoteState>> {
        let mut state = self.state();
        state.calls.push(operation.to_string());
        match state.failures.remove(operation) {
            Some(err) => Err(err),
            None => Ok(state),
        }
    }

    pub fn set_node(&self, node: Node) {
        self.state().nodes.insert(node.id.clone(), node);
    }

    pub fn set_children(&self, parent_id: &str, children: Vec<NodeChildAssociation>) {
        self.state().children.insert(parent_id.to_string(), children);
    }

    pub fn set_favorite_site(&self, site_id: &str, favorite: Favorite) {
        self.state()
            .favorite_sites
            .insert(site_id.to_string(), favorite);
    }

    /// 下一次调用 `operation` 时返回 `err`。
    pub fn fail_next(&self, operation: &str, err: Error) {
        self.state().failures.insert(operation.to_string(), err);
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn calls_to(&self, operation: &str) -> usize {
        self.state().calls.iter().filter(|c| *c == operation).count()
    }
}

fn missing(id: &str) -> Error {
    Error::NotFound(format!("node {id}"))
}

#[async_trait]
impl RemoteRepository for MockRemote {
    async fn fetch_node(&self, node_id: &str) -> Result<Node> {
        let state = self.record("fetch_node")?;
        state.nodes.get(node_id).cloned().ok_or_else(|| missing(node_id))
    }

    async fn fetch_favorite_site(&self, site_id: &str) -> Result<Favorite> {
        let state = self.record("fetch_favorite_site")?;
        state
            .favorite_sites
            .get(site_id)
            .cloned()
            .ok_or_else(|| missing(site_id))
    }

    async fn list_children(
        &self,
        parent_id: &str,
        skip: u64,
        max_items: u64,
    ) -> Result<Paging<NodeChildAssociation>> {
        let state = self.record("list_children")?;
        let all = state.children.get(parent_id).cloned().unwrap_or_default();
        let total = all.len() as u64;
        let entries: Vec<_> = all
            .into_iter()
            .skip(skip as usize)
            .take(max_items as usize)
            .collect();
        Ok(Paging {
            has_more_items: skip + (entries.len() as u64) < total,
            total_items: Some(total),
            entries,
        })
    }

    async fn add_favorite(&self, _entry: &Entry) -> Result<()> {
        self.record("add_favorite").map(drop)
    }

    async fn remove_favorite(&self, _entry: &Entry) -> Result<()> {
        self.record("remove_favorite").map(drop)
    }

    async fn move_node(&self, node_id: &str, target_parent_id: &str) -> Result<Node> {
        let mut state = self.record("move_node")?;
        let node = state.nodes.get_mut(node_id).ok_or_else(|| missing(node_id))?;
        node.parent_id = Some(target_parent_id.to_string());
        Ok(node.clone())
    }

    async fn update_node(
        &self,
        node_id: &str,
        name: &str,
        description: Option<&str>,
    ) -> Result<Node> {
        let mut state = self.record("update_node")?;
        let node = state.nodes.get_mut(node_id).ok_or_else(|| missing(node_id))?;
        node.name = name.to_string();
        if let Some(description) = description {
            node.properties
                .get_or_insert_with(HashMap::new)
                .insert("cm:description".to_string(), Value::from(description));
        }
        Ok(node.clone())
    }

    async fn delete_entry(&self, _entry: &Entry) -> Result<()> {
        self.record("delete_entry").map(drop)
    }

    async fn delete_forever(&self, _node_id: &str) -> Result<()> {
        self.record("delete_forever").map(drop)
    }

    async fn restore_node(&self, node_id: &str) -> Result<Node> {
        let state = self.record("restore_node")?;
        state.nodes.get(node_id).cloned().ok_or_else(|| missing(node_id))
    }

    async fn create_folder(
        &self,
        parent_id: &str,
        name: &str,
        _description: Option<&str>,
    ) -> Result<Node> {
        let mut state = self.record("create_folder")?;
        state.created += 1;
        let node = Node {
            id: format!("folder-{}", state.created),
            parent_id: Some(parent_id.to_string()),
            node_type: "cm:folder".to_string(),
            name: name.to_string(),
            is_folder: true,
            modified_at: Some(fixed_time()),
            is_favorite: Some(false),
            allowable_operations: Some(vec!["delete".to_string(), "create".to_string()]),
            ..Node::default()
        };
        state.nodes.insert(node.id.clone(), node.clone());
        Ok(node)
    }

    async fn start_process(&self, _entries: &[Entry]) -> Result<()> {
        self.record("start_process").map(drop)
    }
}

/// 传输替身的下一个任务结局。
#[derive(Clone, Debug)]
pub enum Scripted {
    /// 首次查询即完成；下载时把内容写到目标路径。
    Complete(Vec<u8>),
    /// 保持 Running，直到 `release()`。
    Hold(Vec<u8>),
    Fail(Error),
}

struct MockJob {
    request: TransferRequest,
    script: Scripted,
    cancelled: bool,
    written: bool,
}

#[derive(Default)]
struct TransferMockState {
    scripts: VecDeque<Scripted>,
    requests: Vec<TransferRequest>,
    jobs: HashMap<TransferId, MockJob>,
    released: bool,
}

#[derive(Default)]
pub struct MockTransferService {
    state: Mutex<TransferMockState>,
}

impl MockTransferService {
    fn state(&self) -> std::sync::MutexGuard<'_, TransferMockState> {
        self.state.lock().unwrap()
    }

    pub fn script(&self, scripted: Scripted) {
        self.state().scripts.push_back(scripted);
    }

    /// 放行所有 Hold 中的任务（包括之后入队的）。
    pub fn release(&self) {
        self.state().released = true;
    }

    pub fn requests(&self) -> Vec<TransferRequest> {
        self.state().requests.clone()
    }
}

#[async_trait]
impl TransferService for MockTransferService {
    async fn enqueue(&self, request: TransferRequest) -> Result<TransferId> {
        let mut state = self.state();
        let script = state
            .scripts
            .pop_front()
            .unwrap_or_else(|| Scripted::Complete(DEFAULT_BODY.to_vec()));
        let id = TransferId::new();
        state.requests.push(request.clone());
        state.jobs.insert(
            id.clone(),
            MockJob {
                request,
                script,
                cancelled: false,
                written: false,
            },
        );
        Ok(id)
    }

    async fn query_status(&self, id: &TransferId) -> Result<TransferState> {
        let mut state = self.state();
        let released = state.released;
        let job = state
            .jobs
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("transfer {}", id.0)))?;
        if job.cancelled {
            return Ok(TransferState::Cancelled);
        }
        let body = match &job.script {
            Scripted::Fail(err) => return Ok(TransferState::Failed(err.clone())),
            Scripted::Hold(body) if !released => {
                return Ok(TransferState::Running {
                    bytes: 0,
                    expected: Some(body.len() as u64),
                });
            }
            Scripted::Hold(body) | Scripted::Complete(body) => body.clone(),
        };
        if job.request.direction == TransferDirection::Download && !job.written {
            let path = &job.request.local_path;
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir).unwrap();
            }
            std::fs::write(path, &body).unwrap();
            job.written = true;
        }
        Ok(TransferState::Completed {
            bytes: body.len() as u64,
        })
    }

    async fn cancel(&self, id: &TransferId) -> Result<()> {
        if let Some(job) = self.state().jobs.get_mut(id) {
            job.cancelled = true;
        }
        Ok(())
    }
}
