use super::{long_fid_of, parse_type, records_of, records_of_mut, ChangeReport, Extractor};
use crate::datatypes::Signature;
use crate::form_id::LongFid;
use crate::game::GameDescriptor;
use crate::interchange::{format_object, read_table, Aliases, BadRow, TableWriter};
use crate::plugin::Plugin;
use crate::progress::Progress;
use crate::utils::Result;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

/// 没有名称的灯光的占位名
pub const NO_NAME: &str = "NO NAME";

const LIGH: Signature = Signature::new(b"LIGH");

/// 显示名称（FULL）
#[derive(Debug)]
pub struct FullNames {
    game: Arc<GameDescriptor>,
    /// 类型 → FormID → (编辑器ID, 名称)
    pub names: BTreeMap<Signature, BTreeMap<LongFid, (String, String)>>,
}

impl FullNames {
    pub fn new(game: Arc<GameDescriptor>) -> Self {
        FullNames {
            game,
            names: BTreeMap::new(),
        }
    }
}

impl Extractor for FullNames {
    fn game(&self) -> &Arc<GameDescriptor> {
        &self.game
    }

    fn read_types(&self) -> Vec<Signature> {
        self.game.names_types.clone()
    }

    fn read_plugin(&mut self, plugin: &Plugin) -> Result<()> {
        if plugin.is_localized() {
            warn!("{} 为本地化插件，跳过名称", plugin.name());
            return Ok(());
        }
        for sig in self.read_types() {
            let table = self.names.entry(sig).or_default();
            for record in records_of(plugin, sig) {
                let mut name = record.full_name()?.unwrap_or_default();
                if name.is_empty() && sig == LIGH {
                    name = NO_NAME.to_string();
                }
                let eid = record.get_editor_id().unwrap_or_default();
                table.insert(long_fid_of(record)?, (eid, name));
            }
        }
        Ok(())
    }

    fn apply_to_plugin(&self, plugin: &mut Plugin, report: &mut ChangeReport, _progress: &dyn Progress) -> Result<()> {
        if plugin.is_localized() {
            warn!("{} 为本地化插件，不写回名称", plugin.name());
            return Ok(());
        }
        for (sig, table) in &self.names {
            for record in records_of_mut(plugin, *sig) {
                let fid = long_fid_of(record)?;
                let Some((_, name)) = table.get(&fid) else { continue };
                if *sig == LIGH && name == NO_NAME {
                    continue;
                }
                if record.set_full_name(name)? {
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
            let (Some(sig), Some(fid)) = (parse_type(row.get(0)), row.long_fid(1, 2, aliases)) else {
                bad.push(row.bad("类型或FormID无效"));
                continue;
            };
            self.names
                .entry(sig)
                .or_default()
                .insert(fid, (row.get(3).to_string(), row.get(4).to_string()));
        }
        Ok(bad)
    }

    fn write_to_interchange(&self, path: &Path) -> Result<()> {
        let mut writer = TableWriter::create(path)?;
        writer.write_row(["Type", "Mod Name", "ObjectIndex", "Editor Id", "Name"])?;
        for (sig, table) in &self.names {
            let sig = sig.to_string();
            for (fid, (eid, name)) in table {
                writer.write_row([
                    sig.as_str(),
                    fid.master.as_str(),
                    &format_object(fid.object),
                    eid,
                    name,
                ])?;
            }
        }
        writer.finish()
    }
}
