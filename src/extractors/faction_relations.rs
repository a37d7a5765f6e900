use super::{long_fid_of, records_of, records_of_mut, ChangeReport, Extractor};
use crate::datatypes::Signature;
use crate::fields::AttrValue;
use crate::form_id::{FormId, LongFid};
use crate::game::GameDescriptor;
use crate::interchange::{format_object, read_table, Aliases, BadRow, TableWriter};
use crate::plugin::Plugin;
use crate::progress::Progress;
use crate::utils::Result;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

const FACT: Signature = Signature::new(b"FACT");
const LIST: &str = "relations";

/// 阵营之间的好感度
#[derive(Debug)]
pub struct FactionRelations {
    game: Arc<GameDescriptor>,
    /// 阵营 → 另一阵营 → 好感度
    pub relations: BTreeMap<LongFid, BTreeMap<LongFid, i64>>,
    pub eids: HashMap<LongFid, String>,
}

impl FactionRelations {
    pub fn new(game: Arc<GameDescriptor>) -> Self {
        FactionRelations {
            game,
            relations: BTreeMap::new(),
            eids: HashMap::new(),
        }
    }

    fn eid_of(&self, fid: &LongFid) -> &str {
        self.eids.get(fid).map(String::as_str).unwrap_or("")
    }
}

fn other_of(value: Option<&AttrValue>) -> Option<LongFid> {
    value?.as_fid()?.long().cloned()
}

impl Extractor for FactionRelations {
    fn game(&self) -> &Arc<GameDescriptor> {
        &self.game
    }

    fn read_types(&self) -> Vec<Signature> {
        vec![FACT]
    }

    fn read_plugin(&mut self, plugin: &Plugin) -> Result<()> {
        for record in records_of(plugin, FACT) {
            let fid = long_fid_of(record)?;
            if let Some(eid) = record.get_editor_id() {
                self.eids.insert(fid.clone(), eid);
            }
            let entries = record.entries(LIST)?;
            if entries.is_empty() {
                continue;
            }
            let table = self.relations.entry(fid).or_default();
            for entry in entries {
                let Some(other) = other_of(entry.get("faction")) else { continue };
                table.insert(other, entry.get("mod").and_then(AttrValue::as_int).unwrap_or(0));
            }
        }
        Ok(())
    }

    fn apply_to_plugin(&self, plugin: &mut Plugin, report: &mut ChangeReport, _progress: &dyn Progress) -> Result<()> {
        let masters = plugin.masters().to_vec();
        let own = plugin.name().clone();

        for record in records_of_mut(plugin, FACT) {
            let fid = long_fid_of(record)?;
            let Some(table) = self.relations.get(&fid) else { continue };
            let current: Vec<(Option<LongFid>, i64)> = record
                .entries(LIST)?
                .iter()
                .map(|entry| {
                    let disp = entry.get("mod").and_then(AttrValue::as_int).unwrap_or(0);
                    (other_of(entry.get("faction")), disp)
                })
                .collect();

            let mut changed = false;
            for (other, disp) in table {
                if other.master != own && !masters.contains(&other.master) {
                    warn!("{}: 阵营 {} 的所属文件不是 {} 的主文件，跳过", fid, other, own);
                    continue;
                }
                match current.iter().position(|(f, _)| f.as_ref() == Some(other)) {
                    Some(index) if current[index].1 == *disp => {}
                    Some(index) => {
                        changed |= record.set_entry_field(LIST, index, "mod", &AttrValue::Int(*disp))?;
                    }
                    None => {
                        record.push_entry(
                            LIST,
                            &[
                                ("faction", AttrValue::Fid(FormId::Long(other.clone()))),
                                ("mod", AttrValue::Int(*disp)),
                            ],
                        )?;
                        changed = true;
                    }
                }
            }
            if changed {
                report.count(&fid);
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
            let parsed = (
                row.long_fid(1, 2, aliases),
                row.long_fid(4, 5, aliases),
                row.get(6).trim().parse::<i64>().ok(),
            );
            let (Some(main), Some(other), Some(disp)) = parsed else {
                bad.push(row.bad("FormID或好感度无效"));
                continue;
            };
            for (fid, eid) in [(&main, row.get(0)), (&other, row.get(3))] {
                if !eid.is_empty() {
                    self.eids.insert(fid.clone(), eid.to_string());
                }
            }
            self.relations.entry(main).or_default().insert(other, disp);
        }
        Ok(bad)
    }

    fn write_to_interchange(&self, path: &Path) -> Result<()> {
        let mut writer = TableWriter::create(path)?;
        writer.write_row([
            "Main Eid",
            "Main Mod",
            "Main Object",
            "Other Eid",
            "Other Mod",
            "Other Object",
            "Disp",
        ])?;
        for (main, table) in &self.relations {
            for (other, disp) in table {
                writer.write_row([
                    self.eid_of(main),
                    main.master.as_str(),
                    &format_object(main.object),
                    self.eid_of(other),
                    other.master.as_str(),
                    &format_object(other.object),
                    &disp.to_string(),
                ])?;
            }
        }
        writer.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aliases_rewrite_both_identities() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relations.csv");
        std::fs::write(
            &path,
            "\"Main Eid\",\"Main Mod\",\"Main Object\",\"Other Eid\",\"Other Mod\",\"Other Object\",\"Disp\"\r\n\
             \"Guild\",\"Old.esp\",\"0x000801\",\"Thieves\",\"Oblivion.esm\",\"0x00AB12\",\"-20\"\r\n\
             \"Broken\",\"Old.esp\",\"0x000802\",\"\",\"Oblivion.esm\",\"0x00AB12\",\"\"\r\n",
        )
        .unwrap();

        let mut aliases = Aliases::new();
        aliases.insert("Old.esp", "New.esp");
        let mut relations = FactionRelations::new(Arc::new(GameDescriptor::builtin("oblivion").unwrap()));
        let bad = relations.read_from_interchange(&path, &aliases).unwrap();
        assert_eq!(bad.len(), 1);
        assert_eq!(bad[0].fields[0], "Broken");

        let main = LongFid::new("New.esp", 0x801);
        assert_eq!(relations.relations[&main][&LongFid::new("Oblivion.esm", 0xAB12)], -20);
        assert_eq!(relations.eid_of(&main), "Guild");
    }
}
