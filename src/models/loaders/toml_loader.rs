use crate::error::AppResult;
use crate::models::request::{DocumentRequest, RequestManifest};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::fs;

/// 解析 TOML 清单内容
pub fn parse_request_manifest(content: &str) -> AppResult<RequestManifest> {
    Ok(toml::from_str(content)?)
}

/// 从 TOML 文件加载请求清单
pub async fn load_request_manifest(toml_file_path: &Path) -> Result<Vec<DocumentRequest>> {
    let content = fs::read_to_string(toml_file_path)
        .await
        .with_context(|| format!("无法读取TOML文件: {}", toml_file_path.display()))?;

    let manifest = parse_request_manifest(&content)
        .with_context(|| format!("无法解析TOML文件: {}", toml_file_path.display()))?;

    Ok(manifest.requests)
}

/// 从文件夹中加载所有 TOML 清单中的请求
///
/// 文件按名称排序后依次加载，单个文件解析失败只记录警告。
pub async fn load_all_manifests(folder_path: &str) -> Result<Vec<DocumentRequest>> {
    let folder = PathBuf::from(folder_path);

    if !folder.exists() {
        anyhow::bail!("文件夹不存在: {}", folder_path);
    }

    let mut toml_files = Vec::new();
    let mut entries = fs::read_dir(&folder)
        .await
        .with_context(|| format!("无法读取文件夹: {}", folder_path))?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) == Some("toml") {
            toml_files.push(path);
        }
    }
    toml_files.sort();

    let mut requests = Vec::new();
    for path in toml_files {
        tracing::info!(
            "正在加载: {}",
            path.file_name().unwrap_or_default().to_string_lossy()
        );

        match load_request_manifest(&path).await {
            Ok(loaded) => {
                tracing::info!("成功加载 {} 个请求", loaded.len());
                requests.extend(loaded);
            }
            Err(e) => {
                tracing::warn!("加载文件失败 {}: {:#}", path.display(), e);
            }
        }
    }

    Ok(requests)
}
