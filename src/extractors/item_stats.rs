use super::{long_fid_of, parse_type, records_of, records_of_mut, ChangeReport, Extractor};
use crate::datatypes::Signature;
use crate::fields::AttrValue;
use crate::form_id::LongFid;
use crate::game::GameDescriptor;
use crate::interchange::{format_object, read_table, Aliases, BadRow, Row, TableWriter};
use crate::plugin::Plugin;
use crate::progress::Progress;
use crate::utils::Result;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// 属性表中代表编辑器ID的列名
const EID: &str = "eid";

/// 属性名 → 值
pub type ItemAttrs = BTreeMap<String, AttrValue>;

/// 物品数值（重量、价格、伤害等，按游戏描述的属性列表）
#[derive(Debug)]
pub struct ItemStats {
    game: Arc<GameDescriptor>,
    /// 类型 → FormID → 属性
    pub stats: BTreeMap<Signature, BTreeMap<LongFid, ItemAttrs>>,
}

impl ItemStats {
    pub fn new(game: Arc<GameDescriptor>) -> Self {
        ItemStats {
            game,
            stats: BTreeMap::new(),
        }
    }

    fn attr_names(&self, sig: Signature) -> &[String] {
        self.game.stats_types.get(&sig).map(Vec::as_slice).unwrap_or(&[])
    }

    fn parse_row(&self, sig: Signature, row: &Row) -> Option<ItemAttrs> {
        let schema = self.game.schema(sig);
        let mut attrs = ItemAttrs::new();
        for (index, name) in self.attr_names(sig).iter().enumerate() {
            let text = row.get(3 + index);
            let value = if name == EID {
                AttrValue::Str(text.to_string())
            } else {
                AttrValue::parse(schema.attr(name)?.field.kind, text)?
            };
            attrs.insert(name.clone(), value);
        }
        Some(attrs)
    }
}

impl Extractor for ItemStats {
    fn game(&self) -> &Arc<GameDescriptor> {
        &self.game
    }

    fn read_types(&self) -> Vec<Signature> {
        self.game.stats_types.keys().copied().collect()
    }

    fn read_plugin(&mut self, plugin: &Plugin) -> Result<()> {
        for sig in self.read_types() {
            let names = self.attr_names(sig).to_vec();
            let mut table = BTreeMap::new();
            for record in records_of(plugin, sig) {
                let mut attrs = ItemAttrs::new();
                for name in &names {
                    let value = if name == EID {
                        Some(AttrValue::Str(record.get_editor_id().unwrap_or_default()))
                    } else {
                        record.attr(name)?
                    };
                    if let Some(value) = value {
                        attrs.insert(name.clone(), value);
                    }
                }
                table.insert(long_fid_of(record)?, attrs);
            }
            self.stats.entry(sig).or_default().extend(table);
        }
        Ok(())
    }

    fn apply_to_plugin(&self, plugin: &mut Plugin, report: &mut ChangeReport, _progress: &dyn Progress) -> Result<()> {
        for (sig, table) in &self.stats {
            for record in records_of_mut(plugin, *sig) {
                let fid = long_fid_of(record)?;
                let Some(attrs) = table.get(&fid) else { continue };
                let mut changed = false;
                for (name, value) in attrs.iter().filter(|(name, _)| name.as_str() != EID) {
                    // 按文本比较，表格中的浮点数与记录中的值在显示精度内相同即视为未修改
                    let current = record.attr(name)?;
                    if current.as_ref().map(ToString::to_string) == Some(value.to_string()) {
                        continue;
                    }
                    changed |= record.set_attr(name, value)?;
                }
                if changed {
                    report.count(&fid);
                }
            }
        }
        Ok(())
    }

    fn read_from_interchange(&mut self, path: &Path, aliases: &Aliases) -> Result<Vec<BadRow>> {
        let mut bad = Vec::new();
        for row in read_table(path)? {
            if !row.is_data(2) {
                continue;
            }
            let Some(sig) = parse_type(row.get(0)).filter(|sig| self.game.stats_types.contains_key(sig)) else {
                bad.push(row.bad("未知的物品类型"));
                continue;
            };
            let (Some(fid), Some(attrs)) = (row.long_fid(1, 2, aliases), self.parse_row(sig, &row)) else {
                bad.push(row.bad("FormID或数值无效"));
                continue;
            };
            self.stats.entry(sig).or_default().insert(fid, attrs);
        }
        Ok(bad)
    }

    fn write_to_interchange(&self, path: &Path) -> Result<()> {
        let mut writer = TableWriter::create(path)?;
        for (sig, table) in &self.stats {
            if table.is_empty() {
                continue;
            }
            let names = self.attr_names(*sig);
            let mut header = vec!["Type".to_string(), "Mod Name".to_string(), "ObjectIndex".to_string()];
            header.extend(names.iter().cloned());
            writer.write_row(&header)?;

            for (fid, attrs) in table {
                let mut row = vec![sig.to_string(), fid.master.to_string(), format_object(fid.object)];
                row.extend(
                    names
                        .iter()
                        .map(|name| attrs.get(name).map(ToString::to_string).unwrap_or_default()),
                );
                writer.write_row(&row)?;
            }
        }
        writer.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sections_and_value_kinds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.csv");
        let game = Arc::new(GameDescriptor::builtin("oblivion").unwrap());

        let mut stats = ItemStats::new(Arc::clone(&game));
        let sword = LongFid::new("Mod.esp", 0x801);
        let mut attrs = ItemAttrs::new();
        attrs.insert("eid".into(), AttrValue::Str("IronSword".into()));
        attrs.insert("weight".into(), AttrValue::Float(12.5));
        attrs.insert("value".into(), AttrValue::Int(25));
        attrs.insert("health".into(), AttrValue::Int(100));
        attrs.insert("damage".into(), AttrValue::Int(9));
        attrs.insert("speed".into(), AttrValue::Float(1.0));
        attrs.insert("reach".into(), AttrValue::Float(1.0));
        attrs.insert("enchantPoints".into(), AttrValue::Int(0));
        stats.stats.entry(Signature::new(b"WEAP")).or_default().insert(sword.clone(), attrs.clone());
        stats.write_to_interchange(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"Type\",\"Mod Name\",\"ObjectIndex\",\"eid\",\"weight\",\"value\""));
        assert!(text.contains("\"12.500000\""));

        let mut fresh = ItemStats::new(game);
        assert!(fresh.read_from_interchange(&path, &Aliases::new()).unwrap().is_empty());
        assert_eq!(fresh.stats[&Signature::new(b"WEAP")][&sword], attrs);
    }

    #[test]
    fn test_unparsable_value_is_bad_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.csv");
        std::fs::write(
            &path,
            "\"Type\",\"Mod Name\",\"ObjectIndex\",\"eid\",\"weight\",\"value\"\r\n\
             \"MISC\",\"Mod.esp\",\"0x000801\",\"Junk\",\"heavy\",\"3\"\r\n\
             \"STAT\",\"Mod.esp\",\"0x000802\",\"Rock\",\"1\",\"1\"\r\n",
        )
        .unwrap();
        let mut stats = ItemStats::new(Arc::new(GameDescriptor::builtin("oblivion").unwrap()));
        let bad = stats.read_from_interchange(&path, &Aliases::new()).unwrap();
        assert_eq!(bad.len(), 2);
    }
}
