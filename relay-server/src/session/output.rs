use common::Result;
use std::path::Path;
use tracing::{debug, info};

/// 转码输出产生的文件扩展名
const HLS_EXTENSIONS: [&str; 3] = ["m3u8", "ts", "tmp"];

/// 准备输出目录
///
/// 目录不存在时创建；`clean` 为真时删除上一次运行遗留的 manifest 和分片，
/// 避免播放器拿到过期的播放列表。返回删除的文件数。
pub async fn prepare_output_dir(dir: &Path, clean: bool) -> Result<usize> {
    tokio::fs::create_dir_all(dir).await?;

    if !clean {
        return Ok(0);
    }

    let mut removed = 0;
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !entry.file_type().await?.is_file() || !is_hls_artifact(&path) {
            continue;
        }
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                removed += 1;
                debug!("Removed stale output {}", path.display());
            }
            // 可能被其他进程先删除
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }

    if removed > 0 {
        info!("✓ Cleared {} stale files from {}", removed, dir.display());
    }
    Ok(removed)
}

fn is_hls_artifact(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| HLS_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known)))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_creates_missing_directory() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("nested").join("hls_output");

        assert_eq!(prepare_output_dir(&dir, true).await.unwrap(), 0);
        assert!(dir.is_dir());
    }

    #[tokio::test]
    async fn test_cleans_only_hls_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["stream.m3u8", "stream_0001.ts", "stream_0002.ts", "stream.m3u8.tmp"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        std::fs::write(dir.path().join("README.txt"), b"keep").unwrap();
        std::fs::create_dir(dir.path().join("archive.ts")).unwrap();

        let removed = prepare_output_dir(dir.path(), true).await.unwrap();
        assert_eq!(removed, 4);
        assert!(dir.path().join("README.txt").exists());
        assert!(dir.path().join("archive.ts").is_dir());
        assert!(!dir.path().join("stream.m3u8").exists());
    }

    #[tokio::test]
    async fn test_keeps_files_when_clean_disabled() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("stream.m3u8"), b"#EXTM3U").unwrap();

        assert_eq!(prepare_output_dir(dir.path(), false).await.unwrap(), 0);
        assert!(dir.path().join("stream.m3u8").exists());
    }
}
