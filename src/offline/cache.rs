use std::io;
use std::path::{Path, PathBuf};

use crate::entry::Entry;
use crate::error::{Error, Result};

const FALLBACK_FILE_NAME: &str = "download.bin";

/// 已同步文件内容的本地缓存，按账户分目录，文件名为 `{id}-{name}`。
#[derive(Clone, Debug)]
pub struct ContentCache {
    root: PathBuf,
}

impl ContentCache {
    pub fn new(root: impl AsRef<Path>, account_id: &str) -> Self {
        Self {
            root: root.as_ref().join(sanitize_file_name(account_id)),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, entry: &Entry) -> PathBuf {
        self.root.join(sanitize_file_name(&entry.file_name()))
    }

    /// 下载中的临时文件，成功后再重命名到 `path_for`。
    pub fn part_path_for(&self, entry: &Entry) -> PathBuf {
        let mut name = sanitize_file_name(&entry.file_name());
        name.push_str(".part");
        self.root.join(name)
    }

    pub fn contains(&self, entry: &Entry) -> bool {
        self.path_for(entry).is_file()
    }

    pub async fn ensure_root(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| Error::from_io(e, format!("failed to create cache directory {:?}", self.root)))
    }

    /// 删除缓存内容及残留的临时文件；文件不存在不算错误。
    pub fn remove(&self, entry: &Entry) -> Result<()> {
        for path in [self.path_for(entry), self.part_path_for(entry)] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(Error::from_io(err, format!("failed to remove cached file {path:?}")))
                }
            }
        }
        Ok(())
    }
}

/// 把文件名中的路径分隔符和保留字符替换掉，空名或 `.`/`..` 回退到默认名。
pub fn sanitize_file_name(raw: &str) -> String {
    let trimmed = raw.trim();
    let candidate = if trimmed.is_empty() {
        FALLBACK_FILE_NAME
    } else {
        trimmed
    };

    let sanitized: String = candidate
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            _ => c,
        })
        .collect();

    let final_name = sanitized.trim();
    if final_name.is_empty() || final_name == "." || final_name == ".." {
        FALLBACK_FILE_NAME.to_string()
    } else {
        final_name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("report.pdf", "report.pdf")]
    #[case("a/b\\c:d", "a_b_c_d")]
    #[case("   ", "download.bin")]
    #[case("..", "download.bin")]
    fn test_sanitize_file_name(#[case] raw: &str, #[case] expected: &str) {
        assert_eq!(sanitize_file_name(raw), expected);
    }

    #[tokio::test]
    async fn test_paths_are_scoped_by_account() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ContentCache::new(dir.path(), "alice");
        let entry = Entry {
            id: "n1".to_string(),
            name: "notes/today.txt".to_string(),
            ..Entry::default()
        };
        assert_eq!(
            cache.path_for(&entry),
            dir.path().join("alice").join("n1-notes_today.txt")
        );
        assert!(cache
            .part_path_for(&entry)
            .to_string_lossy()
            .ends_with(".txt.part"));

        cache.ensure_root().await.unwrap();
        std::fs::write(cache.path_for(&entry), b"body").unwrap();
        assert!(cache.contains(&entry));
        cache.remove(&entry).unwrap();
        assert!(!cache.contains(&entry));
        cache.remove(&entry).unwrap();
    }
}
