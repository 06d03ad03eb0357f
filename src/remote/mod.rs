use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use url::Url;

use crate::entry::{Entry, Favorite, Node, NodeChildAssociation};
use crate::error::{Error, Result};

/// 列表接口默认的分页大小。
pub const DEFAULT_PAGE_SIZE: u64 = 100;

/// 分页结果：当前页条目 + 服务端报告的总数。
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Paging<T> {
    pub entries: Vec<T>,
    pub total_items: Option<u64>,
    pub has_more_items: bool,
}

/// 远端内容仓库客户端。具体的 REST 传输格式由实现方负责，
/// 这里只约定调用语义和错误分类（HTTP 状态经 `Error::from_status` 映射）。
#[async_trait]
pub trait RemoteRepository: Send + Sync {
    async fn fetch_node(&self, node_id: &str) -> Result<Node>;

    /// 站点的收藏记录；站点未被收藏时返回 `NotFound`。
    async fn fetch_favorite_site(&self, site_id: &str) -> Result<Favorite>;

    async fn list_children(
        &self,
        parent_id: &str,
        skip: u64,
        max_items: u64,
    ) -> Result<Paging<NodeChildAssociation>>;

    async fn add_favorite(&self, entry: &Entry) -> Result<()>;

    async fn remove_favorite(&self, entry: &Entry) -> Result<()>;

    async fn move_node(&self, node_id: &str, target_parent_id: &str) -> Result<Node>;

    async fn update_node(
        &self,
        node_id: &str,
        name: &str,
        description: Option<&str>,
    ) -> Result<Node>;

    /// 移到回收站。站点与普通节点的删除接口不同，因此传入完整条目。
    async fn delete_entry(&self, entry: &Entry) -> Result<()>;

    async fn delete_forever(&self, node_id: &str) -> Result<()>;

    async fn restore_node(&self, node_id: &str) -> Result<Node>;

    async fn create_folder(
        &self,
        parent_id: &str,
        name: &str,
        description: Option<&str>,
    ) -> Result<Node>;

    /// 以给定条目为附件启动流程。
    async fn start_process(&self, entries: &[Entry]) -> Result<()>;
}

/// 逐页拉取全部子项，直到服务端表示没有更多。
pub async fn fetch_all_children(
    remote: &dyn RemoteRepository,
    parent_id: &str,
    page_size: u64,
) -> Result<Vec<NodeChildAssociation>> {
    let page_size = page_size.max(1);
    let mut skip = 0;
    let mut children = Vec::new();
    loop {
        let page = remote.list_children(parent_id, skip, page_size).await?;
        let received = page.entries.len() as u64;
        children.extend(page.entries);
        skip += received;
        let reached_total = page.total_items.is_some_and(|total| skip >= total);
        if !page.has_more_items || received == 0 || reached_total {
            break;
        }
    }
    Ok(children)
}

/// 节点内容地址：`{base}nodes/{id}/content?attachment=true`。
pub fn node_content_url(base: &Url, node_id: &str) -> Result<Url> {
    let encoded = utf8_percent_encode(node_id.trim(), NON_ALPHANUMERIC).to_string();
    base.join(&format!("nodes/{encoded}/content?attachment=true"))
        .map_err(|e| Error::Configuration(format!("invalid content url for {node_id}: {e}")))
}

/// 上传地址：`{base}nodes/{parent}/children?name=...&autoRename=true`。
pub fn node_upload_url(base: &Url, parent_id: &str, file_name: &str) -> Result<Url> {
    let parent = utf8_percent_encode(parent_id.trim(), NON_ALPHANUMERIC).to_string();
    let mut url = base
        .join(&format!("nodes/{parent}/children"))
        .map_err(|e| Error::Configuration(format!("invalid upload url for {parent_id}: {e}")))?;
    url.query_pairs_mut()
        .append_pair("name", file_name.trim())
        .append_pair("autoRename", "true");
    Ok(url)
}
