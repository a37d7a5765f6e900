use std::path::Path;
use thiserror::Error;

/// 自定义错误类型
#[derive(Error, Debug)]
pub enum EspError {
    /// 块嵌套或大小不合法（文件截断、损坏或格式不符）
    #[error("Format error: {0}")]
    Format(String),

    /// 当前状态不允许该操作
    #[error("State error: {0}")]
    State(String),

    /// 主文件索引在目标主文件列表中没有对应项
    #[error("Master map error: input master index {0} has no counterpart")]
    MasterMap(usize),

    /// 长FormID的所属文件不在主文件列表中
    #[error("Master not in master list: {0}")]
    MissingMaster(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Invalid top group type: {0}")]
    InvalidTopType(String),

    #[error("Compression error: {0}")]
    CompressionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),
}

impl EspError {
    pub(crate) fn format(message: impl Into<String>) -> Self {
        EspError::Format(message.into())
    }

    pub(crate) fn state(message: impl Into<String>) -> Self {
        EspError::State(message.into())
    }

    pub(crate) fn schema(message: impl Into<String>) -> Self {
        EspError::Schema(message.into())
    }
}

pub type Result<T> = std::result::Result<T, EspError>;

/// 编辑器ID验证：只允许ASCII字母和数字
pub fn is_valid_editor_id(text: &str) -> bool {
    !text.is_empty() && text.chars().all(|c| c.is_ascii_alphanumeric())
}

/// 合法但不以字母开头的编辑器ID（脚本引用时可能出问题）
pub fn is_questionable_editor_id(text: &str) -> bool {
    !text.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
}

/// 创建文件备份
pub fn create_backup(file_path: &Path) -> Result<std::path::PathBuf> {
    if !file_path.exists() {
        return Err(EspError::IoError(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "原文件不存在"
        )));
    }

    let timestamp = chrono::Local::now().format("%Y-%m-%d-%H-%M-%S");
    let backup_path = file_path.with_extension(format!("{}.bak", timestamp));

    std::fs::copy(file_path, &backup_path)?;

    Ok(backup_path)
}

/// 在目标文件所在目录创建临时文件（用于写完后原子替换）
pub fn temp_file_beside(target: &Path) -> Result<tempfile::NamedTempFile> {
    let dir = match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir()?,
    };
    Ok(tempfile::NamedTempFile::new_in(dir)?)
}

/// 把写好的临时文件替换到目标路径
pub fn persist_temp(temp: tempfile::NamedTempFile, target: &Path) -> Result<()> {
    temp.as_file().sync_all()?;
    temp.persist(target).map_err(|e| EspError::IoError(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_editor_id_validation() {
        assert!(is_valid_editor_id("IronSword"));
        assert!(is_valid_editor_id("Sword01"));
        assert!(is_valid_editor_id("01Sword"));

        assert!(!is_valid_editor_id(""));
        assert!(!is_valid_editor_id("Iron Sword"));
        assert!(!is_valid_editor_id("iron_sword"));
        assert!(!is_valid_editor_id("Épée"));
    }

    #[test]
    fn test_questionable_editor_id() {
        assert!(is_questionable_editor_id("01Sword"));
        assert!(!is_questionable_editor_id("Sword01"));
    }

    #[test]
    fn test_create_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Test.esp");
        std::fs::write(&path, b"TES4").unwrap();

        let backup = create_backup(&path).unwrap();
        assert!(backup.exists());
        assert_eq!(std::fs::read(backup).unwrap(), b"TES4");

        assert!(create_backup(&dir.path().join("Missing.esp")).is_err());
    }
}
