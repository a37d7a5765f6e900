use super::{long_fid_of, records_of, records_of_mut, ChangeReport, Extractor};
use crate::datatypes::Signature;
use crate::fields::AttrValue;
use crate::form_id::{LongFid, ModName};
use crate::game::GameDescriptor;
use crate::interchange::{format_object, parse_object, read_table, Aliases, BadRow, Row, TableWriter};
use crate::plugin::Plugin;
use crate::progress::Progress;
use crate::record::Record;
use crate::utils::Result;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

const NPC_: Signature = Signature::new(b"NPC_");

/// 来源未知的导入数据（旧格式表格）
pub const UNKNOWN_SOURCE: &str = "Unknown";

/// 一个角色的等级数据
#[derive(Debug, Clone, PartialEq)]
pub struct ActorLevel {
    pub eid: String,
    /// 等级是否为相对玩家等级的偏移
    pub is_offset: bool,
    pub offset: i64,
    pub calc_min: i64,
    pub calc_max: i64,
}

impl ActorLevel {
    fn from_record(record: &Record) -> Result<Self> {
        let int = |name: &str| -> Result<i64> {
            Ok(record.attr(name)?.and_then(|v| v.as_int()).unwrap_or(0))
        };
        Ok(ActorLevel {
            eid: record.get_editor_id().unwrap_or_default(),
            is_offset: record.attr("pcLevelOffset")?.and_then(|v| v.as_bool()).unwrap_or(false),
            offset: int("level")?,
            calc_min: int("calcMin")?,
            calc_max: int("calcMax")?,
        })
    }
}

/// 角色等级（玩家等级偏移、最小/最大计算等级）
///
/// 数据按来源文件分开保存；导出时旧值列取自游戏主文件。
#[derive(Debug)]
pub struct ActorLevels {
    game: Arc<GameDescriptor>,
    /// 来源文件 → 角色 → 等级
    pub levels: BTreeMap<ModName, BTreeMap<LongFid, ActorLevel>>,
    read_sources: BTreeSet<ModName>,
}

impl ActorLevels {
    pub fn new(game: Arc<GameDescriptor>) -> Self {
        ActorLevels {
            game,
            levels: BTreeMap::new(),
            read_sources: BTreeSet::new(),
        }
    }

    fn game_master(&self) -> ModName {
        self.game.master_names().into_iter().next().unwrap_or_default()
    }

    /// 旧格式：FormID, 编辑器ID, 偏移, 最小, 最大；所属文件为游戏主文件
    fn read_legacy_row(&mut self, row: &Row) -> Option<()> {
        let text = row.get(0).trim();
        let object = parse_object(&format!("0x{}", text.get(text.len().saturating_sub(6)..)?))?;
        let level = ActorLevel {
            eid: row.get(1).to_string(),
            is_offset: true,
            offset: row.get(2).trim().parse().ok()?,
            calc_min: row.get(3).trim().parse().ok()?,
            calc_max: row.get(4).trim().parse().ok()?,
        };
        let key = LongFid::new(self.game_master(), object);
        self.levels
            .entry(ModName::new(UNKNOWN_SOURCE))
            .or_default()
            .insert(key, level);
        Some(())
    }

    fn read_row(&mut self, row: &Row, aliases: &Aliases) -> Option<()> {
        let fid = row.long_fid(2, 3, aliases)?;
        let level = ActorLevel {
            eid: row.get(1).to_string(),
            is_offset: true,
            offset: row.get(4).trim().parse().ok()?,
            calc_min: row.get(5).trim().parse().ok()?,
            calc_max: row.get(6).trim().parse().ok()?,
        };
        let source = ModName::new(row.get(0).trim());
        self.levels.entry(source).or_default().insert(fid, level);
        Some(())
    }
}

impl Extractor for ActorLevels {
    fn game(&self) -> &Arc<GameDescriptor> {
        &self.game
    }

    fn read_types(&self) -> Vec<Signature> {
        vec![NPC_]
    }

    fn read_plugin(&mut self, plugin: &Plugin) -> Result<()> {
        if !self.read_sources.insert(plugin.name().clone()) {
            return Ok(());
        }
        let mut table = BTreeMap::new();
        for record in records_of(plugin, NPC_) {
            table.insert(long_fid_of(record)?, ActorLevel::from_record(record)?);
        }
        if !table.is_empty() {
            self.levels.insert(plugin.name().clone(), table);
        }
        Ok(())
    }

    fn apply_to_plugin(&self, plugin: &mut Plugin, report: &mut ChangeReport, _progress: &dyn Progress) -> Result<()> {
        let table = self
            .levels
            .get(plugin.name())
            .or_else(|| self.levels.get(&ModName::new(UNKNOWN_SOURCE)));
        let Some(table) = table else { return Ok(()) };

        for record in records_of_mut(plugin, NPC_) {
            let fid = long_fid_of(record)?;
            let Some(level) = table.get(&fid) else { continue };
            let mut changed = false;
            for (name, value) in [
                ("level", level.offset),
                ("calcMin", level.calc_min),
                ("calcMax", level.calc_max),
            ] {
                changed |= record.set_attr(name, &AttrValue::Int(value))?;
            }
            if changed {
                report.count(&fid);
            }
        }
        Ok(())
    }

    fn read_from_interchange(&mut self, path: &Path, aliases: &Aliases) -> Result<Vec<BadRow>> {
        let game_master = self.game_master();
        let mut bad = Vec::new();
        for row in read_table(path)? {
            if row.is_data(0) {
                if self.read_legacy_row(&row).is_none() {
                    bad.push(row.bad("旧格式行无法解析"));
                }
                continue;
            }
            if row.fields.len() < 7 || !row.is_data(3) {
                continue;
            }
            let source = row.get(0).trim();
            if source.eq_ignore_ascii_case("none") || ModName::new(source) == game_master {
                continue;
            }
            if row.get(2).trim().eq_ignore_ascii_case("none") {
                continue;
            }
            if self.read_row(&row, aliases).is_none() {
                bad.push(row.bad("FormID或等级无效"));
            }
        }
        Ok(bad)
    }

    fn write_to_interchange(&self, path: &Path) -> Result<()> {
        let game_master = self.game_master();
        let old_levels = self.levels.get(&game_master);

        let mut writer = TableWriter::create(path)?;
        writer.write_row([
            "Source Mod",
            "Actor Eid",
            "Actor Mod",
            "Actor Object",
            "Offset",
            "CalcMin",
            "CalcMax",
            "Old IsPCLevelOffset",
            "Old Offset",
            "Old CalcMin",
            "Old CalcMax",
        ])?;
        for (source, table) in &self.levels {
            if *source == game_master {
                continue;
            }
            let mut actors: Vec<(&LongFid, &ActorLevel)> =
                table.iter().filter(|(_, level)| level.is_offset).collect();
            actors.sort_by_key(|(fid, level)| (fid.master.clone(), level.eid.to_lowercase()));

            for (fid, level) in actors {
                let mut row = vec![
                    source.to_string(),
                    level.eid.clone(),
                    fid.master.to_string(),
                    format_object(fid.object),
                    level.offset.to_string(),
                    level.calc_min.to_string(),
                    level.calc_max.to_string(),
                ];
                match old_levels.and_then(|old| old.get(fid)) {
                    Some(old) => row.extend([
                        (old.is_offset as u8).to_string(),
                        old.offset.to_string(),
                        old.calc_min.to_string(),
                        old.calc_max.to_string(),
                    ]),
                    None => row.extend(std::iter::repeat(String::new()).take(4)),
                }
                writer.write_row(&row)?;
            }
        }
        writer.finish()
    }
}
