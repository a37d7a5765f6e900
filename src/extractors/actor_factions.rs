use super::{long_fid_of, parse_type, records_of, records_of_mut, ChangeReport, Extractor};
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
const ACTOR_TYPES: [Signature; 2] = [Signature::new(b"NPC_"), Signature::new(b"CREA")];
const LIST: &str = "factions";

/// 角色 → 阵营 → 等级
pub type FactionRanks = BTreeMap<LongFid, BTreeMap<LongFid, i64>>;

/// 角色的阵营成员关系
#[derive(Debug)]
pub struct ActorFactions {
    game: Arc<GameDescriptor>,
    /// 角色类型 → 角色 → 阵营 → 等级
    pub factions: BTreeMap<Signature, FactionRanks>,
    /// FormID → 编辑器ID（角色与阵营）
    pub eids: HashMap<LongFid, String>,
}

impl ActorFactions {
    pub fn new(game: Arc<GameDescriptor>) -> Self {
        ActorFactions {
            game,
            factions: BTreeMap::new(),
            eids: HashMap::new(),
        }
    }

    /// 当前游戏中带阵营列表的角色类型
    fn actor_types(&self) -> Vec<Signature> {
        ACTOR_TYPES
            .into_iter()
            .filter(|sig| self.game.schema(*sig).entry_list(LIST).is_some())
            .collect()
    }

    fn eid_of(&self, fid: &LongFid) -> &str {
        self.eids.get(fid).map(String::as_str).unwrap_or("")
    }
}

fn faction_of(value: Option<&AttrValue>) -> Option<LongFid> {
    value?.as_fid()?.long().cloned()
}

impl Extractor for ActorFactions {
    fn game(&self) -> &Arc<GameDescriptor> {
        &self.game
    }

    fn read_types(&self) -> Vec<Signature> {
        let mut types = self.actor_types();
        types.push(FACT);
        types
    }

    fn write_types(&self) -> Vec<Signature> {
        self.actor_types()
    }

    fn read_plugin(&mut self, plugin: &Plugin) -> Result<()> {
        for record in records_of(plugin, FACT) {
            if let Some(eid) = record.get_editor_id() {
                self.eids.insert(long_fid_of(record)?, eid);
            }
        }
        for sig in self.actor_types() {
            for record in records_of(plugin, sig) {
                let fid = long_fid_of(record)?;
                if let Some(eid) = record.get_editor_id() {
                    self.eids.insert(fid.clone(), eid);
                }
                let entries = record.entries(LIST)?;
                if entries.is_empty() {
                    continue;
                }
                let ranks = self.factions.entry(sig).or_default().entry(fid).or_default();
                for entry in entries {
                    let Some(faction) = faction_of(entry.get("faction")) else { continue };
                    let rank = entry.get("rank").and_then(AttrValue::as_int).unwrap_or(0);
                    ranks.insert(faction, rank);
                }
            }
        }
        Ok(())
    }

    fn apply_to_plugin(&self, plugin: &mut Plugin, report: &mut ChangeReport, _progress: &dyn Progress) -> Result<()> {
        let masters = plugin.masters().to_vec();
        let own = plugin.name().clone();

        for (sig, table) in &self.factions {
            for record in records_of_mut(plugin, *sig) {
                let fid = long_fid_of(record)?;
                let Some(ranks) = table.get(&fid) else { continue };

                let current: Vec<(Option<LongFid>, i64)> = record
                    .entries(LIST)?
                    .iter()
                    .map(|entry| {
                        let rank = entry.get("rank").and_then(AttrValue::as_int).unwrap_or(0);
                        (faction_of(entry.get("faction")), rank)
                    })
                    .collect();

                let mut changed = false;
                for (faction, rank) in ranks {
                    if faction.master != own && !masters.contains(&faction.master) {
                        warn!("{}: 阵营 {} 的所属文件不是 {} 的主文件，跳过", fid, faction, own);
                        continue;
                    }
                    match current.iter().position(|(f, _)| f.as_ref() == Some(faction)) {
                        Some(index) if current[index].1 == *rank => {}
                        Some(index) => {
                            changed |= record.set_entry_field(LIST, index, "rank", &AttrValue::Int(*rank))?;
                        }
                        None => {
                            record.push_entry(
                                LIST,
                                &[
                                    ("faction", AttrValue::Fid(FormId::Long(faction.clone()))),
                                    ("rank", AttrValue::Int(*rank)),
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
        }
        Ok(())
    }

    fn read_from_interchange(&mut self, path: &Path, aliases: &Aliases) -> Result<Vec<BadRow>> {
        let mut bad = Vec::new();
        for row in read_table(path)? {
            if !row.is_data(3) {
                continue;
            }
            let parsed = (
                parse_type(row.get(0)),
                row.long_fid(2, 3, aliases),
                row.long_fid(5, 6, aliases),
                row.get(7).trim().parse::<i64>().ok(),
            );
            let (Some(sig), Some(actor), Some(faction), Some(rank)) = parsed else {
                bad.push(row.bad("类型、FormID或等级无效"));
                continue;
            };
            for (fid, eid) in [(&actor, row.get(1)), (&faction, row.get(4))] {
                if !eid.is_empty() {
                    self.eids.insert(fid.clone(), eid.to_string());
                }
            }
            self.factions
                .entry(sig)
                .or_default()
                .entry(actor)
                .or_default()
                .insert(faction, rank);
        }
        Ok(bad)
    }

    fn write_to_interchange(&self, path: &Path) -> Result<()> {
        let mut writer = TableWriter::create(path)?;
        writer.write_row([
            "Type",
            "Actor Eid",
            "Actor Mod",
            "Actor Object",
            "Faction Eid",
            "Faction Mod",
            "Faction Object",
            "Rank",
        ])?;
        for (sig, table) in &self.factions {
            let sig = sig.to_string();
            for (actor, ranks) in table {
                for (faction, rank) in ranks {
                    writer.write_row([
                        sig.as_str(),
                        self.eid_of(actor),
                        actor.master.as_str(),
                        &format_object(actor.object),
                        self.eid_of(faction),
                        faction.master.as_str(),
                        &format_object(faction.object),
                        &rank.to_string(),
                    ])?;
                }
            }
        }
        writer.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oblivion() -> Arc<GameDescriptor> {
        Arc::new(GameDescriptor::builtin("oblivion").unwrap())
    }

    #[test]
    fn test_interchange_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("factions.csv");

        let npc = LongFid::new("X.esp", 0x01);
        let faction = LongFid::new("X.esp", 0x02);
        let mut source = ActorFactions::new(oblivion());
        source
            .factions
            .entry(Signature::new(b"NPC_"))
            .or_default()
            .entry(npc.clone())
            .or_default()
            .insert(faction.clone(), 3);
        source.eids.insert(faction.clone(), "FighterGuild".to_string());
        source.write_to_interchange(&path).unwrap();

        let mut fresh = ActorFactions::new(oblivion());
        let bad = fresh.read_from_interchange(&path, &Aliases::new()).unwrap();
        assert!(bad.is_empty());
        assert_eq!(fresh.factions, source.factions);
        assert_eq!(fresh.eid_of(&faction), "FighterGuild");
    }

    #[test]
    fn test_bad_rank_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("factions.csv");
        std::fs::write(
            &path,
            "\"Type\",\"Actor Eid\",\"Actor Mod\",\"Actor Object\",\"Faction Eid\",\"Faction Mod\",\"Faction Object\",\"Rank\"\r\n\
             \"NPC_\",\"\",\"X.esp\",\"0x000001\",\"\",\"X.esp\",\"0x000002\",\"high\"\r\n",
        )
        .unwrap();
        let mut factions = ActorFactions::new(oblivion());
        let bad = factions.read_from_interchange(&path, &Aliases::new()).unwrap();
        assert_eq!(bad.len(), 1);
        assert!(factions.factions.is_empty());
    }

    #[test]
    fn test_actor_types_follow_descriptor() {
        let factions = ActorFactions::new(oblivion());
        assert_eq!(factions.actor_types(), ACTOR_TYPES.to_vec());
        let skyrim = ActorFactions::new(Arc::new(GameDescriptor::builtin("skyrim").unwrap()));
        assert_eq!(skyrim.actor_types(), vec![Signature::new(b"NPC_")]);
    }
}
