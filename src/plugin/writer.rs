use super::Plugin;
use crate::datatypes::Signature;
use crate::form_id::{FidForm, FormId};
use crate::group::{Group, GroupChild, GroupHeader, RawGroup, RecordGroup, TopGroup};
use crate::record::Record;
use crate::utils::{create_backup, persist_temp, temp_file_beside, EspError, Result};
use std::io::Write;
use std::path::Path;
use tracing::{debug, info, warn};

impl Plugin {
    /// 保存文件
    ///
    /// 只能保存以保留全部内容的方式加载、且处于短格式的文件。
    /// 先写入同目录下的临时文件，成功后原子替换目标。
    pub fn save(&mut self, path: Option<&Path>) -> Result<()> {
        self.require_form(FidForm::Short)?;
        if !self.factory.is_keep_all() {
            return Err(EspError::state(format!(
                "{} 为选择性加载，缺少数据无法保存",
                self.name
            )));
        }
        if self.fid_repairs > 0 {
            warn!(
                "{}: 加载时修复了 {} 个越界的主文件槽位，保存结果与原文件不同",
                self.name, self.fid_repairs
            );
        }

        let header_size = self.game.header_size;
        let mut num_records = 0;
        for top in &self.tops {
            num_records += top.num_records(header_size)?;
        }
        self.header.num_records = num_records as u32;

        let header_record = self
            .header_record
            .as_mut()
            .ok_or_else(|| EspError::state("缺少文件头记录"))?;
        if self.header.apply_to(header_record)? {
            debug!("{}: 文件头已更新", self.name);
        }

        let output = self.serialize()?;

        let target = path.unwrap_or(&self.path).to_path_buf();
        let mut temp = temp_file_beside(&target)?;
        temp.write_all(&output)?;
        persist_temp(temp, &target)?;

        info!("已保存 {} ({} bytes, {} 条记录)", target.display(), output.len(), num_records);
        Ok(())
    }

    /// 先备份再保存到原路径
    pub fn safe_save(&mut self) -> Result<()> {
        if self.path.exists() {
            let backup = create_backup(&self.path)?;
            debug!("备份 {} -> {}", self.path.display(), backup.display());
        }
        self.save(None)
    }

    /// 序列化为字节（文件头 + 按规范顺序排列的顶层组）
    pub(crate) fn serialize(&self) -> Result<Vec<u8>> {
        let header_size = self.game.header_size;
        let header_record = self
            .header_record
            .as_ref()
            .ok_or_else(|| EspError::state("缺少文件头记录"))?;

        let mut output = Vec::new();
        write_record(header_record, header_size, &mut output)?;

        for top in self.ordered_tops() {
            match top {
                TopGroup::Raw(raw) => write_raw(raw, header_size, &mut output)?,
                TopGroup::Flat(flat) => write_top(flat.group(), header_size, &mut output)?,
                TopGroup::Hierarchical(tree) => write_top(tree.group(), header_size, &mut output)?,
            }
        }
        Ok(output)
    }

    /// 规范顺序在前，其余按读取顺序追加
    fn ordered_tops(&self) -> Vec<&TopGroup> {
        let canonical = &self.game.top_types;
        let mut ordered: Vec<&TopGroup> = canonical
            .iter()
            .filter_map(|sig| self.tops.iter().find(|top| top.label() == *sig))
            .collect();
        ordered.extend(
            self.tops
                .iter()
                .filter(|top| !canonical.contains(&top.label())),
        );
        ordered
    }
}

fn write_top(group: &Group, header_size: usize, output: &mut Vec<u8>) -> Result<()> {
    if group.is_empty_new() {
        debug!("跳过空的新组 {}", group.label_signature());
        return Ok(());
    }
    write_group(group, header_size, output)
}

/// 写入记录
pub(crate) fn write_record(record: &Record, header_size: usize, output: &mut Vec<u8>) -> Result<()> {
    let form_id = match &record.form_id {
        FormId::Short(value) => *value,
        FormId::Long(fid) => {
            return Err(EspError::state(format!(
                "记录 {} 的FormID {} 仍为长格式",
                record.record_type, fid
            )))
        }
    };
    // 未修改时为原始字节（零拷贝）
    let payload = record.payload_for_write()?;

    output.extend_from_slice(record.record_type.as_bytes());
    output.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    output.extend_from_slice(&record.flags.to_le_bytes());
    output.extend_from_slice(&form_id.to_le_bytes());
    output.extend_from_slice(&record.version_control_info.to_le_bytes());
    if header_size >= 24 {
        output.extend_from_slice(&record.internal_version.to_le_bytes());
    }
    output.extend_from_slice(&payload);
    Ok(())
}

fn write_group_header(header: &GroupHeader, size: u32, header_size: usize, output: &mut Vec<u8>) {
    output.extend_from_slice(Signature::GRUP.as_bytes());
    output.extend_from_slice(&size.to_le_bytes());
    output.extend_from_slice(&header.label);
    output.extend_from_slice(&header.group_type.to_i32().to_le_bytes());
    output.extend_from_slice(&header.version_control_info.to_le_bytes());
    if header_size >= 24 {
        output.extend_from_slice(&header.internal_version.to_le_bytes());
    }
}

/// 写入组
pub(crate) fn write_group(group: &Group, header_size: usize, output: &mut Vec<u8>) -> Result<()> {
    let start = output.len();
    // 大小先占位，写完子元素后回填
    write_group_header(&group.header, 0, header_size, output);

    for child in &group.children {
        match child {
            GroupChild::Record(record) => write_record(record, header_size, output)?,
            GroupChild::Group(subgroup) => write_group(subgroup, header_size, output)?,
            GroupChild::Raw(raw) => write_raw(raw, header_size, output)?,
        }
    }

    let size = (output.len() - start) as u32;
    output[start + 4..start + 8].copy_from_slice(&size.to_le_bytes());
    Ok(())
}

/// 原样写出未解析的组
pub(crate) fn write_raw(raw: &RawGroup, header_size: usize, output: &mut Vec<u8>) -> Result<()> {
    let size = (header_size + raw.data().len()) as u32;
    write_group_header(&raw.header, size, header_size, output);
    output.extend_from_slice(raw.data());
    Ok(())
}
