//! 批量数据提取器
//!
//! 每个提取器把插件中的一类数据投影为按长格式FormID索引的表：
//! 可以从插件（先合并其主文件）或交换表格读取，也可以写回插件或导出表格。
//! 写回时只修改值不同的记录，没有任何修改时不保存文件。

pub mod actor_factions;
pub mod actor_levels;
pub mod editor_ids;
pub mod faction_relations;
pub mod fid_replacer;
pub mod full_names;
pub mod item_prices;
pub mod item_stats;
pub mod script_text;
pub mod spell_records;

pub use actor_factions::ActorFactions;
pub use actor_levels::ActorLevels;
pub use editor_ids::EditorIds;
pub use faction_relations::FactionRelations;
pub use fid_replacer::FidReplacer;
pub use full_names::FullNames;
pub use item_prices::ItemPrices;
pub use item_stats::ItemStats;
pub use script_text::ScriptText;
pub use spell_records::SpellRecords;

use crate::datatypes::Signature;
use crate::form_id::{LongFid, ModName};
use crate::game::GameDescriptor;
use crate::interchange::{Aliases, BadRow};
use crate::mod_dir::ModDirectory;
use crate::plugin::Plugin;
use crate::progress::{NullProgress, Progress, ProgressScope, SubProgress};
use crate::record::Record;
use crate::utils::Result;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 一次写回的结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeReport {
    /// 所属文件 → 被修改的记录数
    pub changed: BTreeMap<ModName, usize>,
    /// 编辑器ID重命名（旧, 新）
    pub renamed: Vec<(String, String)>,
    /// 因名称替换而被修改的其他记录：所属文件 → 记录数
    pub propagated: BTreeMap<ModName, usize>,
    /// 新建的记录
    pub added: Vec<LongFid>,
}

impl ChangeReport {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.propagated.is_empty() && self.added.is_empty()
    }

    /// 记一条被修改的记录
    pub fn count(&mut self, fid: &LongFid) {
        *self.changed.entry(fid.master.clone()).or_insert(0) += 1;
    }

    pub fn count_propagated(&mut self, fid: &LongFid) {
        *self.propagated.entry(fid.master.clone()).or_insert(0) += 1;
    }

    /// 修改的记录总数
    pub fn total(&self) -> usize {
        self.changed.values().sum::<usize>() + self.propagated.values().sum::<usize>() + self.added.len()
    }
}

/// 提取器的公共接口
pub trait Extractor {
    fn game(&self) -> &Arc<GameDescriptor>;

    /// 读取时需要解码的记录类型
    fn read_types(&self) -> Vec<Signature>;

    /// 写回时需要解码的记录类型
    fn write_types(&self) -> Vec<Signature> {
        self.read_types()
    }

    /// 从已转换为长格式的插件读取
    fn read_plugin(&mut self, plugin: &Plugin) -> Result<()>;

    /// 把表中的数据写入已转换为长格式的插件
    fn apply_to_plugin(&self, plugin: &mut Plugin, report: &mut ChangeReport, progress: &dyn Progress) -> Result<()>;

    /// 读取交换表格，返回无法解析的行
    fn read_from_interchange(&mut self, path: &Path, aliases: &Aliases) -> Result<Vec<BadRow>>;

    fn write_to_interchange(&self, path: &Path) -> Result<()>;

    /// 读取插件：先按顺序读取它的主文件，再读取它自身
    fn read_from_file(&mut self, dir: &ModDirectory, name: &ModName) -> Result<()> {
        self.read_from_file_with_progress(dir, name, &NullProgress)
    }

    fn read_from_file_with_progress(
        &mut self,
        dir: &ModDirectory,
        name: &ModName,
        progress: &dyn Progress,
    ) -> Result<()> {
        let mut scope = ProgressScope::new(progress, 0);
        let game = Arc::clone(self.game());
        let types = self.read_types();
        let mut files: Vec<ModName> = Vec::new();
        for master in dir.read_masters(name, game.header_size)? {
            if dir.exists(&master) {
                files.push(master);
            } else {
                warn!("{}: 主文件 {} 不存在，跳过", name, master);
            }
        }
        files.push(name.clone());

        scope.set_total(files.len());
        for (index, file) in files.iter().enumerate() {
            scope.step(index, file.as_str());
            let plugin = open_long(dir, file, &game, false, &types)?;
            self.read_plugin(&plugin)?;
        }
        Ok(())
    }

    /// 写回插件；有修改时转回短格式并备份保存
    fn write_to_file(&self, dir: &ModDirectory, name: &ModName) -> Result<ChangeReport> {
        self.write_to_file_with_progress(dir, name, &NullProgress)
    }

    fn write_to_file_with_progress(
        &self,
        dir: &ModDirectory,
        name: &ModName,
        progress: &dyn Progress,
    ) -> Result<ChangeReport> {
        let _scope = ProgressScope::new(progress, 1);
        let game = Arc::clone(self.game());
        let mut plugin = open_long(dir, name, &game, true, &self.write_types())?;
        let mut report = ChangeReport::default();
        self.apply_to_plugin(&mut plugin, &mut report, &SubProgress::new(progress, 0.0, 0.9))?;

        if report.is_empty() {
            debug!("{}: 没有变化，不保存", name);
            return Ok(report);
        }
        plugin.convert_to_short_fids()?;
        plugin.safe_save()?;
        info!("{}: 修改 {} 条记录", name, report.total());
        Ok(report)
    }
}

/// 打开插件并转换为长格式
pub(crate) fn open_long(
    dir: &ModDirectory,
    name: &ModName,
    game: &Arc<GameDescriptor>,
    keep_all: bool,
    types: &[Signature],
) -> Result<Plugin> {
    let mut plugin = dir.open(name, Arc::clone(game), keep_all, types)?;
    plugin.convert_to_long_fids(None)?;
    Ok(plugin)
}

/// 记录类型所在的顶层组
pub(crate) fn top_of(sig: Signature) -> Signature {
    if sig == Signature::new(b"INFO") {
        Signature::new(b"DIAL")
    } else {
        sig
    }
}

/// 插件中某类型的有效记录
pub(crate) fn records_of(plugin: &Plugin, sig: Signature) -> Vec<&Record> {
    plugin
        .records(top_of(sig))
        .into_iter()
        .filter(|r| r.record_type == sig)
        .collect()
}

/// 插件中某类型的有效记录（可变）
pub(crate) fn records_of_mut(plugin: &mut Plugin, sig: Signature) -> Vec<&mut Record> {
    plugin
        .records_mut(top_of(sig), sig)
        .into_iter()
        .filter(|r| r.is_active())
        .collect()
}

/// 记录的长格式FormID
pub(crate) fn long_fid_of(record: &Record) -> Result<LongFid> {
    record.form_id.expect_long().cloned()
}

/// 解析表格中的类型列
pub(crate) fn parse_type(text: &str) -> Option<Signature> {
    text.trim().parse::<Signature>().ok()
}
