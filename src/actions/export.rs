use std::io;
use std::path::{Path, PathBuf};

use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::offline::sanitize_file_name;

/// 同名文件的最大编号，超过后放弃分配。
const MAX_NAME_ATTEMPTS: u32 = 1000;

/// 把已缓存的文件复制到用户可见目录，返回最终写入的路径。
/// 目标文件以 create-new 方式原子分配；复制失败时删除已创建的目标文件。
pub(crate) async fn export_file(source: &Path, directory: &Path, name: &str) -> Result<PathBuf> {
    fs::create_dir_all(directory)
        .await
        .map_err(|e| Error::from_io(e, format!("failed to create export directory {directory:?}")))?;
    let mut reader = File::open(source)
        .await
        .map_err(|e| Error::from_io(e, format!("failed to open cached file {source:?}")))?;
    let (destination, mut writer) = allocate_destination(directory, name).await?;

    let copied = async {
        tokio::io::copy(&mut reader, &mut writer).await?;
        writer.flush().await?;
        writer.sync_all().await
    }
    .await;

    match copied {
        Ok(()) => {
            info!(path = %destination.display(), "exported cached file");
            Ok(destination)
        }
        Err(err) => {
            drop(writer);
            if let Err(remove_err) = fs::remove_file(&destination).await {
                warn!(path = %destination.display(), error = %remove_err, "failed to remove partial export");
            }
            Err(Error::from_io(err, format!("failed to export to {destination:?}")))
        }
    }
}

/// 为网络下载预留一个不重名的目标文件（空文件占位），下载完成后覆盖它。
pub(crate) async fn reserve_destination(directory: &Path, name: &str) -> Result<PathBuf> {
    fs::create_dir_all(directory)
        .await
        .map_err(|e| Error::from_io(e, format!("failed to create export directory {directory:?}")))?;
    let (destination, _placeholder) = allocate_destination(directory, name).await?;
    Ok(destination)
}

/// 依次尝试 `name`、`name (1).ext`、`name (2).ext`……
async fn allocate_destination(directory: &Path, name: &str) -> Result<(PathBuf, File)> {
    let name = sanitize_file_name(name);
    for attempt in 0..MAX_NAME_ATTEMPTS {
        let candidate = directory.join(numbered_name(&name, attempt));
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
            .await
        {
            Ok(file) => return Ok((candidate, file)),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(err) => {
                return Err(Error::from_io(err, format!("failed to create {candidate:?}")));
            }
        }
    }
    Err(Error::storage(format!(
        "no free file name for {name} in {directory:?}"
    )))
}

fn numbered_name(name: &str, attempt: u32) -> String {
    if attempt == 0 {
        return name.to_string();
    }
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem} ({attempt}).{ext}"),
        _ => format!("{name} ({attempt})"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("report.pdf", 0, "report.pdf")]
    #[case("report.pdf", 1, "report (1).pdf")]
    #[case("archive.tar.gz", 2, "archive.tar (2).gz")]
    #[case("README", 3, "README (3)")]
    #[case(".profile", 1, ".profile (1)")]
    fn test_numbered_name(#[case] name: &str, #[case] attempt: u32, #[case] expected: &str) {
        assert_eq!(numbered_name(name, attempt), expected);
    }

    #[tokio::test]
    async fn test_export_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("cached");
        std::fs::write(&source, b"hello").unwrap();
        let target = dir.path().join("out");

        let first = export_file(&source, &target, "a.txt").await.unwrap();
        let second = export_file(&source, &target, "a.txt").await.unwrap();

        assert_eq!(first, target.join("a.txt"));
        assert_eq!(second, target.join("a (1).txt"));
        assert_eq!(std::fs::read(&second).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_missing_source_creates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out");
        let err = export_file(&dir.path().join("nope"), &target, "a.txt")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(!target.join("a.txt").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_copy_removes_allocated_destination() {
        let dir = tempfile::tempdir().unwrap();
        // 目录可以打开，但读取时失败，此时目标文件已分配
        let source = dir.path().join("cached");
        std::fs::create_dir(&source).unwrap();
        let target = dir.path().join("out");

        assert!(export_file(&source, &target, "a.txt").await.is_err());
        assert!(target.is_dir());
        assert_eq!(std::fs::read_dir(&target).unwrap().count(), 0);
    }
}
