use crate::domain::ports::Storage;
use crate::utils::error::Result;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct LocalStorage {
    base_path: String,
}

impl LocalStorage {
    pub fn new(base_path: String) -> Self {
        Self { base_path }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        Path::new(&self.base_path).join(path)
    }
}

fn has_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            extensions
                .iter()
                .any(|wanted| wanted.trim_start_matches('.').eq_ignore_ascii_case(ext))
        })
}

// 遞迴收集檔案，略過隱藏目錄
fn walk(dir: &Path, relative: &Path, extensions: &[String], out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if name.to_string_lossy().starts_with('.') {
            continue;
        }
        let file_type = entry.file_type()?;
        let rel = relative.join(&name);
        if file_type.is_dir() {
            walk(&entry.path(), &rel, extensions, out)?;
        } else if file_type.is_file() && has_extension(&rel, extensions) {
            out.push(rel);
        }
    }
    Ok(())
}

impl Storage for LocalStorage {
    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let data = fs::read(self.resolve(path))?;
        Ok(data)
    }

    async fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        let full_path = self.resolve(path);

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(full_path, data)?;
        Ok(())
    }

    async fn list_files(&self, root: &str, extensions: &[String]) -> Result<Vec<String>> {
        let full_root = self.resolve(root);
        let metadata = fs::metadata(&full_root)?;
        if metadata.is_file() {
            return Ok(vec![root.to_string()]);
        }

        let mut files = Vec::new();
        walk(&full_root, Path::new(root), extensions, &mut files)?;
        files.sort();
        tracing::debug!("📂 {}: {} source files", root, files.len());
        Ok(files
            .into_iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect())
    }
}
