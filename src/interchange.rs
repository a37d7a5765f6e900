//! 表格交换格式
//!
//! UTF-8（带BOM）、逗号分隔、所有字段加引号的CSV。第一行是表头；
//! FormID 列总是写成（所属文件名, "0x" + 6位十六进制对象索引）。

use crate::form_id::{LongFid, ModName};
use crate::utils::{persist_temp, temp_file_beside, EspError, Result};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

const BOM: &[u8] = b"\xEF\xBB\xBF";

/// 对象索引 → "0x001234"
pub fn format_object(object: u32) -> String {
    format!("0x{:06X}", object)
}

/// "0x001234" → 对象索引
pub fn parse_object(text: &str) -> Option<u32> {
    let text = text.trim();
    let hex = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X"))?;
    u32::from_str_radix(hex, 16).ok().filter(|v| *v <= 0x00FF_FFFF)
}

/// 文件名替换表（旧名 → 新名），作用于导入时读到的每个文件名列
#[derive(Debug, Clone, Default)]
pub struct Aliases {
    map: HashMap<ModName, ModName>,
}

impl Aliases {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, old: impl Into<ModName>, new: impl Into<ModName>) {
        self.map.insert(old.into(), new.into());
    }

    /// 解析 "Old.esp=New.esp"
    pub fn parse_pair(text: &str) -> Result<(ModName, ModName)> {
        match text.split_once('=') {
            Some((old, new)) if !old.trim().is_empty() && !new.trim().is_empty() => {
                Ok((ModName::new(old.trim()), ModName::new(new.trim())))
            }
            _ => Err(EspError::schema(format!("别名格式应为 OLD=NEW: {:?}", text))),
        }
    }

    pub fn apply(&self, name: &str) -> ModName {
        let name = ModName::new(name.trim());
        self.map.get(&name).cloned().unwrap_or(name)
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// 无法解析的数据行
#[derive(Debug, Clone, PartialEq)]
pub struct BadRow {
    /// 文件中的行号（从 1 开始）
    pub line: u64,
    pub fields: Vec<String>,
    pub reason: String,
}

/// 一行数据
#[derive(Debug, Clone)]
pub struct Row {
    pub line: u64,
    pub fields: Vec<String>,
}

impl Row {
    /// 第 `index` 列；缺失时为空串
    pub fn get(&self, index: usize) -> &str {
        self.fields.get(index).map(String::as_str).unwrap_or("")
    }

    /// 该列是否为 "0x" 开头的FormID（否则视为表头或说明行）
    pub fn is_data(&self, fid_column: usize) -> bool {
        let text = self.get(fid_column).trim();
        text.get(..2).is_some_and(|prefix| prefix.eq_ignore_ascii_case("0x"))
    }

    /// 由文件名列和对象索引列组成长格式FormID
    pub fn long_fid(&self, mod_column: usize, object_column: usize, aliases: &Aliases) -> Option<LongFid> {
        let object = parse_object(self.get(object_column))?;
        let master = self.get(mod_column).trim();
        if master.is_empty() {
            return None;
        }
        Some(LongFid::new(aliases.apply(master), object))
    }

    pub fn bad(&self, reason: impl Into<String>) -> BadRow {
        BadRow {
            line: self.line,
            fields: self.fields.clone(),
            reason: reason.into(),
        }
    }
}

/// 读取表格（跳过第一行表头）
///
/// 不是合法 UTF-8 的行返回 CSV 错误（带行号），不做替换。
pub fn read_table(path: &Path) -> Result<Vec<Row>> {
    let bytes = std::fs::read(path)?;
    let bytes = bytes.strip_prefix(BOM).unwrap_or(&bytes);

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(bytes);

    let mut rows = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record = record?;
        if index == 0 {
            continue;
        }
        let line = record.position().map(|p| p.line()).unwrap_or(index as u64 + 1);
        rows.push(Row {
            line,
            fields: record.iter().map(str::to_string).collect(),
        });
    }
    debug!("读取 {}: {} 行", path.display(), rows.len());
    Ok(rows)
}

/// 表格写出器：写入临时文件，`finish` 时原子替换目标
pub struct TableWriter {
    writer: csv::Writer<NamedTempFile>,
    path: PathBuf,
    rows: usize,
}

impl TableWriter {
    pub fn create(path: &Path) -> Result<Self> {
        let mut temp = temp_file_beside(path)?;
        temp.write_all(BOM)?;
        let writer = csv::WriterBuilder::new()
            .quote_style(csv::QuoteStyle::Always)
            .terminator(csv::Terminator::CRLF)
            .flexible(true)
            .from_writer(temp);
        Ok(TableWriter {
            writer,
            path: path.to_path_buf(),
            rows: 0,
        })
    }

    pub fn write_row<I, S>(&mut self, row: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        self.writer.write_record(row)?;
        self.rows += 1;
        Ok(())
    }

    pub fn finish(self) -> Result<()> {
        let rows = self.rows;
        let temp = self.writer.into_inner().map_err(|e| {
            EspError::IoError(std::io::Error::new(e.error().kind(), e.error().to_string()))
        })?;
        persist_temp(temp, &self.path)?;
        debug!("写出 {}: {} 行", self.path.display(), rows);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_format() {
        assert_eq!(format_object(0x1234), "0x001234");
        assert_eq!(parse_object("0x001234"), Some(0x1234));
        assert_eq!(parse_object(" 0XABCDEF "), Some(0xABCDEF));
        assert_eq!(parse_object("0x1000000"), None);
        assert_eq!(parse_object("1234"), None);
        assert_eq!(parse_object("0xZZ"), None);
    }

    #[test]
    fn test_aliases() {
        let (old, new) = Aliases::parse_pair("Old.esp=New.esp").unwrap();
        let mut aliases = Aliases::new();
        aliases.insert(old, new);
        assert_eq!(aliases.apply("old.ESP").as_str(), "New.esp");
        assert_eq!(aliases.apply("Other.esp").as_str(), "Other.esp");
        assert!(Aliases::parse_pair("missing").is_err());
    }

    #[test]
    fn test_table_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("table.csv");

        let mut writer = TableWriter::create(&path).unwrap();
        writer.write_row(["Mod Name", "ObjectIndex", "Name"]).unwrap();
        writer.write_row(["A.esp", "0x000801", "Iron, \"Sword\""]).unwrap();
        writer.write_row(["note", "", ""]).unwrap();
        writer.finish().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert!(bytes.starts_with(BOM));
        assert!(String::from_utf8_lossy(&bytes).contains("\"A.esp\",\"0x000801\""));

        let rows = read_table(&path).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].is_data(1));
        assert!(!rows[1].is_data(1));
        assert_eq!(rows[0].get(2), "Iron, \"Sword\"");
        assert_eq!(
            rows[0].long_fid(0, 1, &Aliases::new()),
            Some(LongFid::new("A.esp", 0x801))
        );
        assert_eq!(rows[0].get(9), "");
    }

    #[test]
    fn test_multibyte_note_is_not_data() {
        let row = Row {
            line: 3,
            fields: vec!["NPC_".to_string(), "说明".to_string(), "0".to_string()],
        };
        assert!(!row.is_data(1));
        assert!(!row.is_data(2));
        assert!(!row.is_data(7));

        let row = Row {
            line: 4,
            fields: vec![" 0X000801".to_string()],
        };
        assert!(row.is_data(0));
    }

    #[test]
    fn test_invalid_utf8_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.csv");
        let mut bytes = BOM.to_vec();
        bytes.extend_from_slice(b"\"Mod Name\",\"ObjectIndex\",\"Name\"\r\n");
        bytes.extend_from_slice(b"\"A.esp\",\"0x000801\",\"Iron \xFF Sword\"\r\n");
        std::fs::write(&path, bytes).unwrap();

        assert!(matches!(read_table(&path), Err(EspError::Csv(_))));
    }
}
