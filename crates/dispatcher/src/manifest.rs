use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use batch_domain::BatchManifest;
use batch_errors::{BatchError, BatchResult};
use tracing::{debug, info};

/// 清单文件的读写
#[derive(Debug, Clone)]
pub struct ManifestStore {
    path: PathBuf,
}

impl ManifestStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_output_dir(output_dir: &Path, file_name: &str) -> Self {
        Self::new(output_dir.join(file_name))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 读取清单，文件不存在时返回 `None`
    pub fn load(&self) -> BatchResult<Option<BatchManifest>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(BatchError::manifest_error(format!(
                    "读取 {} 失败: {e}",
                    self.path.display()
                )))
            }
        };

        let manifest: BatchManifest = serde_json::from_str(&content).map_err(|e| {
            BatchError::manifest_error(format!("解析 {} 失败: {e}", self.path.display()))
        })?;
        info!(
            path = %self.path.display(),
            "已加载清单: {} 条记录",
            manifest.entries.len()
        );
        Ok(Some(manifest))
    }

    /// 原子写入：先写临时文件再重命名
    pub fn save(&self, manifest: &BatchManifest) -> BatchResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let mut tmp_name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "manifest".into());
        tmp_name.push(".tmp");
        let tmp_path = self.path.with_file_name(tmp_name);

        let json = serde_json::to_vec_pretty(manifest)?;
        {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path).map_err(|e| {
            BatchError::manifest_error(format!("写入 {} 失败: {e}", self.path.display()))
        })?;

        debug!(path = %self.path.display(), "清单已保存: {} 条记录", manifest.entries.len());
        Ok(())
    }
}
