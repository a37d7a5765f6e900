use crate::datatypes::{RawString, Signature};
use crate::group::{Group, GroupChild, RecordGroup, TopGroup};
use crate::plugin::Plugin;
use crate::record::Record;
use crate::subrecord::Subrecord;
use crate::utils::Result;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// 数据预览的最大字节数
const PREVIEW_LEN: usize = 32;

/// 插件结构调试输出
pub struct EspDebugger;

impl EspDebugger {
    /// 把插件结构写入文件
    pub fn dump_file_structure(plugin: &Plugin, output_path: &Path) -> Result<()> {
        let mut output = BufWriter::new(File::create(output_path)?);
        Self::dump_structure(plugin, &mut output)?;
        output.flush()?;
        Ok(())
    }

    /// 按加载顺序输出文件头、主文件和每个顶层组
    pub fn dump_structure(plugin: &Plugin, output: &mut dyn Write) -> Result<()> {
        let header = plugin.header();
        writeln!(output, "=== 插件结构 ===")?;
        writeln!(output, "文件: {}", plugin.name())?;
        writeln!(output, "游戏: {}", plugin.game().name)?;
        writeln!(output, "版本: {:.2}", header.version)?;
        writeln!(output, "标志位: 0x{:08X}", header.flags)?;
        writeln!(output, "记录数: {}", header.num_records)?;
        writeln!(output, "下一个对象索引: 0x{:06X}", header.next_object)?;
        writeln!(output, "FormID格式: {}", plugin.fid_form())?;
        writeln!(output)?;

        writeln!(output, "=== 主文件 ({}) ===", plugin.masters().len())?;
        for (index, master) in plugin.masters().iter().enumerate() {
            writeln!(output, "  {:02X}: {}", index, master)?;
        }
        writeln!(output)?;

        writeln!(output, "=== 顶层组 ===")?;
        for top in plugin.tops() {
            Self::dump_top(top, output)?;
        }
        if !plugin.skipped().is_empty() {
            let skipped: Vec<String> = plugin.skipped().iter().map(Signature::to_string).collect();
            writeln!(output, "跳过: {}", skipped.join(", "))?;
        }
        Ok(())
    }

    fn dump_top(top: &TopGroup, output: &mut dyn Write) -> Result<()> {
        match top {
            TopGroup::Raw(raw) => {
                writeln!(output, "GRUP {} (未解析, {} bytes)", top.label(), raw.data().len())?;
                Ok(())
            }
            _ => match top.as_group() {
                Some(group) => Self::dump_group(group, output, 0),
                None => Ok(()),
            },
        }
    }

    fn dump_group(group: &Group, output: &mut dyn Write, indent: usize) -> Result<()> {
        let prefix = "  ".repeat(indent);
        writeln!(
            output,
            "{}GRUP {:?} '{}' ({} bytes, {} 个子元素)",
            prefix,
            group.get_type(),
            String::from_utf8_lossy(&group.header.label),
            group.header.size,
            group.children.len()
        )?;
        for child in &group.children {
            match child {
                GroupChild::Group(subgroup) => Self::dump_group(subgroup, output, indent + 1)?,
                GroupChild::Record(record) => Self::dump_record(record, output, indent + 1)?,
                GroupChild::Raw(raw) => writeln!(
                    output,
                    "{}  GRUP {:?} (延迟解析, {} bytes)",
                    prefix,
                    raw.header.group_type,
                    raw.data().len()
                )?,
            }
        }
        Ok(())
    }

    fn dump_record(record: &Record, output: &mut dyn Write, indent: usize) -> Result<()> {
        let prefix = "  ".repeat(indent);
        writeln!(
            output,
            "{}{} {} 标志位 0x{:08X}{}",
            prefix,
            record.record_type,
            record.form_id,
            record.flags,
            if record.is_modified() { " (已修改)" } else { "" }
        )?;
        if !record.is_unpacked() {
            return Ok(());
        }
        let text_fields = record.schema().text_fields().to_vec();
        for subrecord in record.subrecords()?.iter() {
            Self::dump_subrecord(subrecord, &text_fields, output, indent + 1)?;
        }
        Ok(())
    }

    fn dump_subrecord(
        subrecord: &Subrecord,
        text_fields: &[Signature],
        output: &mut dyn Write,
        indent: usize,
    ) -> Result<()> {
        let prefix = "  ".repeat(indent);
        let preview: Vec<String> = subrecord
            .data
            .iter()
            .take(PREVIEW_LEN)
            .map(|b| format!("{:02X}", b))
            .collect();
        writeln!(
            output,
            "{}{} ({} bytes) {}{}",
            prefix,
            subrecord.record_type,
            subrecord.data.len(),
            preview.join(" "),
            if subrecord.data.len() > PREVIEW_LEN { " ..." } else { "" }
        )?;
        if Self::is_text(subrecord.record_type, text_fields) {
            let text = RawString::parse_zstring(&subrecord.data).content;
            if !text.is_empty() {
                writeln!(output, "{}  \"{}\"", prefix, text.lines().next().unwrap_or_default())?;
            }
        }
        Ok(())
    }

    fn is_text(sig: Signature, text_fields: &[Signature]) -> bool {
        sig == Signature::EDID || sig == Signature::FULL || text_fields.contains(&sig)
    }

    /// 比较两个文件的字节，返回第一个不同的偏移（长度不同时为较短文件的长度）
    pub fn first_difference(original: &Path, rebuilt: &Path) -> Result<Option<usize>> {
        let a = std::fs::read(original)?;
        let b = std::fs::read(rebuilt)?;
        let diff = a.iter().zip(&b).position(|(x, y)| x != y);
        Ok(match diff {
            Some(offset) => Some(offset),
            None if a.len() != b.len() => Some(a.len().min(b.len())),
            None => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_difference() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.esp");
        let b = dir.path().join("b.esp");
        std::fs::write(&a, b"TES4abcd").unwrap();
        std::fs::write(&b, b"TES4abcd").unwrap();
        assert_eq!(EspDebugger::first_difference(&a, &b).unwrap(), None);
        std::fs::write(&b, b"TES4abXd").unwrap();
        assert_eq!(EspDebugger::first_difference(&a, &b).unwrap(), Some(6));
        std::fs::write(&b, b"TES4ab").unwrap();
        assert_eq!(EspDebugger::first_difference(&a, &b).unwrap(), Some(6));
    }
}
