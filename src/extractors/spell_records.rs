//! 法术数据
//!
//! 基本模式导出名称、消耗、等级和类型；详细模式另有七个标志列，
//! 以及每个效果一组13列（效果代码、显示名称、数值、范围、脚本效果等）。

use super::{long_fid_of, parse_type, records_of, records_of_mut, ChangeReport, Extractor};
use crate::datatypes::Signature;
use crate::fields::{AttrValue, Effect, ScriptEffect};
use crate::form_id::{FormId, LongFid};
use crate::game::GameDescriptor;
use crate::interchange::{format_object, parse_object, read_table, Aliases, BadRow, Row, TableWriter};
use crate::plugin::Plugin;
use crate::progress::Progress;
use crate::record::Record;
use crate::utils::{EspError, Result};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

const SPEL: Signature = Signature::new(b"SPEL");
const MGEF: Signature = Signature::new(b"MGEF");

const SPELL_TYPES: [&str; 6] = ["Spell", "Disease", "Power", "LesserPower", "Ability", "Poison"];
const LEVEL_TYPES: [&str; 5] = ["Novice", "Apprentice", "Journeyman", "Expert", "Master"];
const RANGES: [&str; 3] = ["Self", "Touch", "Target"];
const SCHOOLS: [&str; 6] = ["Alteration", "Conjuration", "Destruction", "Illusion", "Mysticism", "Restoration"];

/// 详细模式的标志属性与列名
const FLAGS: [(&str, &str); 7] = [
    ("noAutoCalc", "Manual Cost"),
    ("startSpell", "Start Spell"),
    ("immuneToSilence", "Immune To Silence"),
    ("ignoreLOS", "Area Effect Ignores LOS"),
    ("scriptEffectAlwaysApplies", "Script Always Applies"),
    ("disallowAbsorbReflect", "Disallow Absorb and Reflect"),
    ("touchExplodesWOTarget", "Touch Explodes Without Target"),
];

const EFFECT_HEADERS: [&str; 13] = [
    "Effect",
    "Name",
    "Magnitude",
    "Area",
    "Duration",
    "Range",
    "Actor Value",
    "Script Mod",
    "Script Object",
    "Script School",
    "Visual Effect",
    "Is Hostile",
    "Script Name",
];

/// 基本列数（类型到法术类型）
const BASE_COLUMNS: usize = 8;
const NONE: &str = "NONE";

fn name_of(names: &[&str], value: i64) -> String {
    usize::try_from(value)
        .ok()
        .and_then(|i| names.get(i))
        .map(|name| name.to_string())
        .unwrap_or_else(|| value.to_string())
}

/// 名称（大小写不敏感）或数字
fn number_of(names: &[&str], text: &str) -> Option<i64> {
    let text = text.trim();
    names
        .iter()
        .position(|name| name.eq_ignore_ascii_case(text))
        .map(|i| i as i64)
        .or_else(|| text.parse().ok())
}

fn parse_bool(text: &str) -> Option<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" | "" => Some(false),
        _ => None,
    }
}

/// 脚本效果的六列；文件名为空或 "None" 时没有脚本效果
fn parse_script_effect(columns: &[&str], aliases: &Aliases) -> Option<ScriptEffect> {
    let master = columns[0].trim();
    if master.is_empty() || master.eq_ignore_ascii_case("none") {
        return None;
    }
    let fid = LongFid::new(aliases.apply(master), parse_object(columns[1])?);
    let visual = match columns[3].trim() {
        text if text.eq_ignore_ascii_case(NONE) => String::new(),
        text => text.to_string(),
    };
    let mut script = ScriptEffect {
        name: columns[5].to_string(),
        ..ScriptEffect::default()
    };
    script.values.insert("script".into(), AttrValue::Fid(FormId::Long(fid)));
    script.values.insert("school".into(), AttrValue::Int(number_of(&SCHOOLS, columns[2])?));
    script.values.insert("visual".into(), AttrValue::Str(visual));
    script.values.insert("hostile".into(), AttrValue::Bool(parse_bool(columns[4])?));
    Some(script)
}

/// 一个法术的数据
#[derive(Debug, Clone, PartialEq)]
pub struct SpellStats {
    pub eid: String,
    pub name: String,
    pub cost: i64,
    pub level_type: i64,
    pub spell_type: i64,
    /// 详细模式下的七个标志
    pub flags: Option<[bool; 7]>,
    /// 详细模式下的效果列表
    pub effects: Option<Vec<Effect>>,
}

impl SpellStats {
    fn from_record(record: &Record, detailed: bool) -> Result<Self> {
        let int = |name: &str| -> Result<i64> { Ok(record.attr(name)?.and_then(|v| v.as_int()).unwrap_or(0)) };
        let mut stats = SpellStats {
            eid: record.get_editor_id().unwrap_or_default(),
            name: record.full_name()?.unwrap_or_default(),
            cost: int("cost")?,
            level_type: int("levelType")?,
            spell_type: int("spellType")?,
            flags: None,
            effects: None,
        };
        if detailed {
            let mut flags = [false; 7];
            for (slot, (attr, _)) in flags.iter_mut().zip(FLAGS) {
                *slot = record.attr(attr)?.and_then(|v| v.as_bool()).unwrap_or(false);
            }
            stats.flags = Some(flags);
            stats.effects = Some(record.effects()?);
        }
        Ok(stats)
    }

    /// 与插件中的值比较时忽略编辑器ID，并只比较表中存在的部分
    fn same_values(&self, current: &SpellStats) -> bool {
        self.name == current.name
            && self.cost == current.cost
            && self.level_type == current.level_type
            && self.spell_type == current.spell_type
            && (self.flags.is_none() || self.flags == current.flags)
            && (self.effects.is_none() || self.effects == current.effects)
    }

    fn apply(&self, record: &mut Record) -> Result<bool> {
        let mut changed = record.set_full_name(&self.name)?;
        for (attr, value) in [
            ("cost", self.cost),
            ("levelType", self.level_type),
            ("spellType", self.spell_type),
        ] {
            changed |= record.set_attr(attr, &AttrValue::Int(value))?;
        }
        if let Some(flags) = &self.flags {
            for (on, (attr, _)) in flags.iter().zip(FLAGS) {
                changed |= record.set_attr(attr, &AttrValue::Bool(*on))?;
            }
        }
        if let Some(effects) = &self.effects {
            changed |= record.set_effects(effects)?;
        }
        Ok(changed)
    }
}

/// 法术
#[derive(Debug)]
pub struct SpellRecords {
    game: Arc<GameDescriptor>,
    detailed: bool,
    pub spells: BTreeMap<LongFid, SpellStats>,
    /// 魔法效果代码 → 显示名称（游戏默认值叠加读取过的插件）
    effect_names: BTreeMap<String, String>,
}

impl SpellRecords {
    pub fn new(game: Arc<GameDescriptor>, detailed: bool) -> Result<Self> {
        if game.schema(SPEL).effects().is_none() {
            return Err(EspError::schema(format!("{} 没有描述法术记录的效果结构", game.name)));
        }
        let effect_names = game.mgef_names.clone();
        Ok(SpellRecords {
            game,
            detailed,
            spells: BTreeMap::new(),
            effect_names,
        })
    }

    pub fn is_detailed(&self) -> bool {
        self.detailed
    }

    fn effect_columns(&self, effect: &Effect) -> Vec<String> {
        let text = |field: &str| effect.get(field).map(ToString::to_string).unwrap_or_default();
        let int = |field: &str| effect.get(field).and_then(AttrValue::as_int).unwrap_or(0);

        let code = text("name");
        let actor_value = match int("actorValue") {
            -1 => NONE.to_string(),
            index => self
                .game
                .actor_value_name(index)
                .map(str::to_string)
                .unwrap_or_else(|| index.to_string()),
        };
        let mut columns = vec![
            code.clone(),
            self.effect_names.get(&code).cloned().unwrap_or_default(),
            text("magnitude"),
            text("area"),
            text("duration"),
            name_of(&RANGES, int("recipient")),
            actor_value,
        ];

        match &effect.script {
            Some(script) => {
                let (master, object) = match script.values.get("script").and_then(AttrValue::as_fid) {
                    Some(FormId::Long(fid)) => (fid.master.to_string(), format_object(fid.object)),
                    _ => (String::new(), format_object(0)),
                };
                let school = script.values.get("school").and_then(AttrValue::as_int).unwrap_or(0);
                let visual = script
                    .values
                    .get("visual")
                    .map(ToString::to_string)
                    .filter(|v| !v.is_empty())
                    .unwrap_or_else(|| NONE.to_string());
                let hostile = script.values.get("hostile").and_then(AttrValue::as_bool).unwrap_or(false);
                columns.extend([
                    master,
                    object,
                    name_of(&SCHOOLS, school),
                    visual,
                    AttrValue::Bool(hostile).to_string(),
                    script.name.clone(),
                ]);
            }
            None => columns.extend(std::iter::repeat("None".to_string()).take(6)),
        }
        columns
    }

    /// 解析一组效果列；基本字段无法解析时返回 None（跳过该效果）
    fn parse_effect(&self, columns: &[&str], aliases: &Aliases) -> Option<Effect> {
        let code = columns[0].trim();
        if code.is_empty() {
            return None;
        }
        let actor_value = match columns[6].trim() {
            text if text.eq_ignore_ascii_case(NONE) => -1,
            text => self.game.actor_value_index(text).or_else(|| text.parse().ok())?,
        };
        let mut effect = Effect::default();
        effect.values.insert("name".into(), AttrValue::Str(code.to_string()));
        for (field, index) in [("magnitude", 2), ("area", 3), ("duration", 4)] {
            effect.values.insert(field.into(), AttrValue::Int(columns[index].trim().parse().ok()?));
        }
        effect.values.insert("recipient".into(), AttrValue::Int(number_of(&RANGES, columns[5])?));
        effect.values.insert("actorValue".into(), AttrValue::Int(actor_value));

        effect.script = parse_script_effect(&columns[7..], aliases);
        Some(effect)
    }

    fn parse_row(&self, row: &Row, aliases: &Aliases) -> Option<(LongFid, SpellStats)> {
        let fid = row.long_fid(1, 2, aliases)?;
        let mut stats = SpellStats {
            eid: row.get(3).to_string(),
            name: row.get(4).to_string(),
            cost: row.get(5).trim().parse().ok()?,
            level_type: number_of(&LEVEL_TYPES, row.get(6)).unwrap_or(0),
            spell_type: number_of(&SPELL_TYPES, row.get(7)).unwrap_or(0),
            flags: None,
            effects: None,
        };
        let extra = row.fields.len().saturating_sub(BASE_COLUMNS);
        if !self.detailed || extra < FLAGS.len() {
            return Some((fid, stats));
        }

        let mut flags = [false; 7];
        for (index, slot) in flags.iter_mut().enumerate() {
            *slot = parse_bool(row.get(BASE_COLUMNS + index))?;
        }
        stats.flags = Some(flags);

        let rest: Vec<&str> = row.fields[BASE_COLUMNS + FLAGS.len()..]
            .iter()
            .map(String::as_str)
            .collect();
        let effects = rest
            .chunks_exact(EFFECT_HEADERS.len())
            .filter_map(|columns| self.parse_effect(columns, aliases))
            .collect();
        stats.effects = Some(effects);
        Some((fid, stats))
    }
}

impl Extractor for SpellRecords {
    fn game(&self) -> &Arc<GameDescriptor> {
        &self.game
    }

    fn read_types(&self) -> Vec<Signature> {
        if self.game.is_described(MGEF) {
            vec![SPEL, MGEF]
        } else {
            vec![SPEL]
        }
    }

    fn write_types(&self) -> Vec<Signature> {
        vec![SPEL]
    }

    fn read_plugin(&mut self, plugin: &Plugin) -> Result<()> {
        self.effect_names
            .extend(plugin.mgef_names().iter().map(|(code, name)| (code.clone(), name.clone())));
        for record in records_of(plugin, SPEL) {
            self.spells
                .insert(long_fid_of(record)?, SpellStats::from_record(record, self.detailed)?);
        }
        Ok(())
    }

    fn apply_to_plugin(&self, plugin: &mut Plugin, report: &mut ChangeReport, _progress: &dyn Progress) -> Result<()> {
        for record in records_of_mut(plugin, SPEL) {
            let fid = long_fid_of(record)?;
            let Some(stats) = self.spells.get(&fid) else { continue };
            let current = SpellStats::from_record(record, stats.flags.is_some() || stats.effects.is_some())?;
            if stats.same_values(&current) {
                continue;
            }
            if stats.apply(record)? {
                report.count(&fid);
            }
        }
        Ok(())
    }

    fn read_from_interchange(&mut self, path: &Path, aliases: &Aliases) -> Result<Vec<BadRow>> {
        let mut bad = Vec::new();
        for row in read_table(path)? {
            if row.fields.len() < BASE_COLUMNS || !row.is_data(2) {
                continue;
            }
            if parse_type(row.get(0)) != Some(SPEL) {
                continue;
            }
            match self.parse_row(&row, aliases) {
                Some((fid, stats)) => {
                    self.spells.insert(fid, stats);
                }
                None => bad.push(row.bad("FormID、消耗或标志无效")),
            }
        }
        Ok(bad)
    }

    fn write_to_interchange(&self, path: &Path) -> Result<()> {
        let mut header: Vec<String> = [
            "Type",
            "Mod Name",
            "ObjectIndex",
            "Editor Id",
            "Name",
            "Cost",
            "Level Type",
            "Spell Type",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        if self.detailed {
            header.extend(FLAGS.iter().map(|(_, column)| column.to_string()));
            for _ in 0..2 {
                header.extend(EFFECT_HEADERS.iter().map(|s| s.to_string()));
            }
            header.push("Additional Effects (Same format)".to_string());
        }

        let mut spells: Vec<(&LongFid, &SpellStats)> = self.spells.iter().collect();
        spells.sort_by_key(|(fid, stats)| (stats.eid.to_lowercase(), fid.master.clone()));

        let mut writer = TableWriter::create(path)?;
        writer.write_row(&header)?;
        for (fid, stats) in spells {
            let mut row = vec![
                SPEL.to_string(),
                fid.master.to_string(),
                format_object(fid.object),
                stats.eid.clone(),
                stats.name.clone(),
                stats.cost.to_string(),
                name_of(&LEVEL_TYPES, stats.level_type),
                name_of(&SPELL_TYPES, stats.spell_type),
            ];
            if self.detailed {
                if let Some(flags) = &stats.flags {
                    row.extend(flags.iter().map(|on| AttrValue::Bool(*on).to_string()));
                }
                for effect in stats.effects.iter().flatten() {
                    row.extend(self.effect_columns(effect));
                }
            }
            writer.write_row(&row)?;
        }
        writer.finish()
    }
}
