use super::Plugin;
use crate::datatypes::Signature;
use crate::group::{Group, GroupChild, TopGroup};
use std::collections::BTreeMap;

/// 插件统计信息
#[derive(Debug, Clone)]
pub struct PluginStats {
    pub name: String,
    pub version: f32,
    pub is_master: bool,
    pub is_localized: bool,
    pub masters: Vec<String>,
    pub group_count: usize,
    pub record_count: usize,
    /// 未解析的组（原始字节）
    pub raw_group_count: usize,
    /// 每种记录类型的数量
    pub records_by_type: BTreeMap<Signature, usize>,
    pub skipped: Vec<Signature>,
}

impl std::fmt::Display for PluginStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== 插件统计信息 ===")?;
        writeln!(f, "名称: {}", self.name)?;
        writeln!(f, "版本: {:.2}", self.version)?;
        writeln!(f, "主文件: {}", if self.is_master { "是" } else { "否" })?;
        writeln!(f, "本地化: {}", if self.is_localized { "是" } else { "否" })?;
        writeln!(f, "依赖主文件数: {}", self.masters.len())?;
        for master in &self.masters {
            writeln!(f, "  - {}", master)?;
        }
        writeln!(f, "组数量: {}", self.group_count)?;
        writeln!(f, "未解析组数量: {}", self.raw_group_count)?;
        writeln!(f, "记录数量: {}", self.record_count)?;
        for (sig, count) in &self.records_by_type {
            writeln!(f, "  {}: {}", sig, count)?;
        }
        if !self.skipped.is_empty() {
            let skipped: Vec<String> = self.skipped.iter().map(|s| s.to_string()).collect();
            writeln!(f, "跳过的记录类型: {}", skipped.join(", "))?;
        }
        Ok(())
    }
}

impl Plugin {
    /// 获取统计信息
    pub fn stats(&self) -> PluginStats {
        let mut stats = PluginStats {
            name: self.name.to_string(),
            version: self.header.version,
            is_master: self.is_master(),
            is_localized: self.is_localized(),
            masters: self.header.masters.iter().map(|m| m.to_string()).collect(),
            group_count: 0,
            record_count: 0,
            raw_group_count: 0,
            records_by_type: BTreeMap::new(),
            skipped: self.skipped.iter().copied().collect(),
        };

        for top in &self.tops {
            match top {
                TopGroup::Raw(_) => {
                    stats.group_count += 1;
                    stats.raw_group_count += 1;
                }
                _ => {
                    if let Some(group) = top.as_group() {
                        count_group(group, &mut stats);
                    }
                }
            }
        }
        stats.record_count = stats.records_by_type.values().sum();
        stats
    }
}

/// 统计组及其子组
fn count_group(group: &Group, stats: &mut PluginStats) {
    stats.group_count += 1;
    for child in &group.children {
        match child {
            GroupChild::Group(subgroup) => count_group(subgroup, stats),
            GroupChild::Record(record) => {
                *stats.records_by_type.entry(record.record_type).or_insert(0) += 1;
            }
            // 延迟的块只计入组本身
            GroupChild::Raw(_) => {
                stats.group_count += 1;
                stats.raw_group_count += 1;
            }
        }
    }
}
