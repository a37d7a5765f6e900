//! 数据目录：插件文件的枚举、按名称解析以及加载顺序

use crate::datatypes::Signature;
use crate::form_id::ModName;
use crate::game::GameDescriptor;
use crate::plugin::{FileHeader, Plugin};
use crate::utils::{EspError, Result};
use crate::SUPPORTED_EXTENSIONS;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::debug;

/// 插件数据目录
#[derive(Debug, Clone)]
pub struct ModDirectory {
    dir: PathBuf,
    /// 名称（大小写不敏感）→ 磁盘上的路径
    files: HashMap<ModName, PathBuf>,
    load_order: Vec<ModName>,
}

impl ModDirectory {
    /// 扫描目录中的 .esp / .esm / .esl 文件
    ///
    /// 加载顺序：主文件（.esm/.esl）在前，各自按修改时间排序，时间相同时按名称。
    pub fn scan(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let mut found = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let is_plugin = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| SUPPORTED_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
                .unwrap_or(false);
            if !is_plugin {
                continue;
            }
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            found.push((ModName::new(file_name), modified, path));
        }

        found.sort_by(|a, b| {
            let a_master = !a.0.as_str().to_lowercase().ends_with(".esp");
            let b_master = !b.0.as_str().to_lowercase().ends_with(".esp");
            b_master
                .cmp(&a_master)
                .then(a.1.cmp(&b.1))
                .then(a.0.cmp(&b.0))
        });

        let load_order: Vec<ModName> = found.iter().map(|(name, _, _)| name.clone()).collect();
        let files = found.into_iter().map(|(name, _, path)| (name, path)).collect();
        debug!("扫描 {}: 找到 {} 个插件", dir.display(), load_order.len());
        Ok(ModDirectory { dir, files, load_order })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 文件是否存在（大小写不敏感）
    pub fn exists(&self, name: &ModName) -> bool {
        self.files.contains_key(name)
    }

    /// 文件的路径；不存在时返回目录下同名路径
    pub fn path(&self, name: &ModName) -> PathBuf {
        self.files
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.dir.join(name.as_str()))
    }

    /// 解析已存在文件的路径
    pub fn resolve(&self, name: &ModName) -> Result<PathBuf> {
        self.files.get(name).cloned().ok_or_else(|| {
            EspError::IoError(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} 中没有 {}", self.dir.display(), name),
            ))
        })
    }

    pub fn load_order(&self) -> &[ModName] {
        &self.load_order
    }

    /// 指定加载顺序（未列出的文件保持原有相对顺序排在后面）
    pub fn set_load_order(&mut self, order: Vec<ModName>) {
        let mut rest: Vec<ModName> = self
            .load_order
            .iter()
            .filter(|name| !order.contains(name))
            .cloned()
            .collect();
        let mut load_order = order;
        load_order.append(&mut rest);
        self.load_order = load_order;
    }

    /// 只读取文件头中的主文件列表
    pub fn read_masters(&self, name: &ModName, header_size: usize) -> Result<Vec<ModName>> {
        let path = self.resolve(name)?;
        Ok(FileHeader::read_from_path(&path, header_size)?.masters)
    }

    /// 打开目录中的插件
    pub fn open(
        &self,
        name: &ModName,
        game: Arc<GameDescriptor>,
        keep_all: bool,
        types: &[Signature],
    ) -> Result<Plugin> {
        let path = self.resolve(name)?;
        Plugin::open(path, game, keep_all, types)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_scan_and_resolve() {
        let temp = tempfile::TempDir::new().unwrap();
        fs::write(temp.path().join("Mod.esp"), b"").unwrap();
        fs::write(temp.path().join("Base.ESM"), b"").unwrap();
        fs::write(temp.path().join("notes.txt"), b"").unwrap();

        let dir = ModDirectory::scan(temp.path()).unwrap();
        assert!(dir.exists(&ModName::new("base.esm")));
        assert!(dir.exists(&ModName::new("MOD.ESP")));
        assert!(!dir.exists(&ModName::new("notes.txt")));
        assert_eq!(dir.load_order()[0].as_str(), "Base.ESM");
        assert_eq!(dir.resolve(&ModName::new("base.esm")).unwrap(), temp.path().join("Base.ESM"));
        assert!(dir.resolve(&ModName::new("Missing.esp")).is_err());
    }

    #[test]
    fn test_explicit_load_order() {
        let temp = tempfile::TempDir::new().unwrap();
        for name in ["A.esm", "B.esp", "C.esp"] {
            fs::write(temp.path().join(name), b"").unwrap();
        }
        let mut dir = ModDirectory::scan(temp.path()).unwrap();
        dir.set_load_order(vec![ModName::new("C.esp"), ModName::new("A.esm")]);
        let order: Vec<&str> = dir.load_order().iter().map(|n| n.as_str()).collect();
        assert_eq!(order, vec!["C.esp", "A.esm", "B.esp"]);
    }
}
