use super::{long_fid_of, records_of, records_of_mut, ChangeReport, Extractor};
use crate::datatypes::{RawString, RecordFlags, Signature};
use crate::form_id::LongFid;
use crate::game::GameDescriptor;
use crate::interchange::{format_object, read_table, Aliases, BadRow, TableWriter};
use crate::plugin::Plugin;
use crate::progress::{Progress, ProgressScope};
use crate::record::Record;
use crate::subrecord::Subrecord;
use crate::utils::{EspError, Result};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

const SCPT: Signature = Signature::new(b"SCPT");
const SCTX: Signature = Signature::new(b"SCTX");

/// 一段脚本
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptSource {
    pub eid: String,
    pub fid: LongFid,
    pub text: String,
}

/// 脚本源码，按编辑器ID（大小写不敏感）匹配
#[derive(Debug)]
pub struct ScriptText {
    game: Arc<GameDescriptor>,
    /// 小写编辑器ID → 脚本
    pub scripts: BTreeMap<String, ScriptSource>,
    /// 写回时为目标文件中不存在的编辑器ID新建脚本记录
    pub make_new: bool,
}

impl ScriptText {
    pub fn new(game: Arc<GameDescriptor>) -> Self {
        ScriptText {
            game,
            scripts: BTreeMap::new(),
            make_new: false,
        }
    }

    pub fn with_make_new(mut self, make_new: bool) -> Self {
        self.make_new = make_new;
        self
    }
}

/// 比较用的形式：忽略大小写和换行符差异
fn normalized(text: &str) -> String {
    text.replace("\r\n", "\n").to_lowercase()
}

/// 记录中的脚本源码
pub fn script_source(record: &Record) -> Result<String> {
    Ok(record
        .find_subrecord(SCTX)?
        .map(|sr| RawString::parse_zstring(&sr.data).content)
        .unwrap_or_default())
}

/// 替换脚本源码，返回是否有变化
pub fn set_script_source(record: &mut Record, text: &str) -> Result<bool> {
    let bytes = RawString::encode(text);
    let subrecords = record.subrecords_mut()?;
    let changed = match subrecords.iter_mut().find(|sr| sr.record_type == SCTX) {
        Some(sr) if sr.data == bytes => false,
        Some(sr) => {
            sr.data = bytes;
            true
        }
        None => {
            subrecords.push(Subrecord::new(SCTX, bytes));
            true
        }
    };
    if changed {
        record.mark_modified();
    }
    Ok(changed)
}

impl Extractor for ScriptText {
    fn game(&self) -> &Arc<GameDescriptor> {
        &self.game
    }

    fn read_types(&self) -> Vec<Signature> {
        vec![SCPT]
    }

    fn read_plugin(&mut self, plugin: &Plugin) -> Result<()> {
        for record in records_of(plugin, SCPT) {
            let Some(eid) = record.get_editor_id().filter(|eid| !eid.is_empty()) else { continue };
            let source = ScriptSource {
                eid: eid.clone(),
                fid: long_fid_of(record)?,
                text: script_source(record)?,
            };
            self.scripts.insert(eid.to_lowercase(), source);
        }
        Ok(())
    }

    fn apply_to_plugin(&self, plugin: &mut Plugin, report: &mut ChangeReport, progress: &dyn Progress) -> Result<()> {
        let mut found: HashSet<String> = HashSet::new();
        {
            let records = records_of_mut(plugin, SCPT);
            let scope = ProgressScope::new(progress, records.len());
            for (index, record) in records.into_iter().enumerate() {
                let Some(eid) = record.get_editor_id() else { continue };
                scope.step(index, &eid);
                let key = eid.to_lowercase();
                let Some(source) = self.scripts.get(&key) else { continue };
                found.insert(key);
                if normalized(&script_source(record)?) == normalized(&source.text) {
                    continue;
                }
                if set_script_source(record, &source.text)? {
                    report.count(&long_fid_of(record)?);
                }
            }
        }

        if !self.make_new {
            return Ok(());
        }
        let schema = plugin.game().schema(SCPT);
        for (key, source) in &self.scripts {
            if found.contains(key) {
                continue;
            }
            let form_id = plugin.next_object_fid()?;
            let fid = form_id.expect_long()?.clone();
            let mut record = Record::new(form_id, RecordFlags::COMPRESSED.bits(), Arc::clone(&schema));
            record.set_editor_id(&source.eid)?;
            set_script_source(&mut record, &source.text)?;

            plugin
                .top_mut(SCPT)?
                .as_flat_mut()
                .ok_or_else(|| EspError::state("SCPT 顶层组未解码"))?
                .set_record(record);
            debug!("新建脚本 {} ({})", source.eid, fid);
            report.added.push(fid);
        }
        if !report.added.is_empty() {
            info!("{}: 新建 {} 个脚本", plugin.name(), report.added.len());
        }
        Ok(())
    }

    fn read_from_interchange(&mut self, path: &Path, aliases: &Aliases) -> Result<Vec<BadRow>> {
        let mut bad = Vec::new();
        for row in read_table(path)? {
            if !row.is_data(1) {
                continue;
            }
            let eid = row.get(2).trim();
            let Some(fid) = row.long_fid(0, 1, aliases).filter(|_| !eid.is_empty()) else {
                bad.push(row.bad("FormID或编辑器ID无效"));
                continue;
            };
            let source = ScriptSource {
                eid: eid.to_string(),
                fid,
                text: row.get(3).to_string(),
            };
            self.scripts.insert(eid.to_lowercase(), source);
        }
        Ok(bad)
    }

    fn write_to_interchange(&self, path: &Path) -> Result<()> {
        let mut writer = TableWriter::create(path)?;
        writer.write_row(["Mod Name", "ObjectIndex", "Editor Id", "Script Text"])?;
        for source in self.scripts.values() {
            writer.write_row([
                source.fid.master.as_str(),
                &format_object(source.fid.object),
                &source.eid,
                &source.text,
            ])?;
        }
        writer.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::form_id::FormId;

    #[test]
    fn test_comparison_ignores_case_and_line_endings() {
        assert_eq!(normalized("Begin GameMode\r\nEnd"), normalized("begin gamemode\nEND"));
        assert_ne!(normalized("set x to 1"), normalized("set x to 2"));
    }

    #[test]
    fn test_set_script_source() {
        let game = GameDescriptor::builtin("oblivion").unwrap();
        let mut record = Record::new(FormId::Short(0x800), 0, game.schema(SCPT));
        assert!(set_script_source(&mut record, "scn Test\r\n").unwrap());
        assert!(!set_script_source(&mut record, "scn Test\r\n").unwrap());
        assert_eq!(script_source(&record).unwrap(), "scn Test\r\n");
        assert!(record.is_modified());
    }

    #[test]
    fn test_multiline_text_survives_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scripts.csv");
        let mut scripts = ScriptText::new(Arc::new(GameDescriptor::builtin("oblivion").unwrap()));
        scripts.scripts.insert(
            "myscript".into(),
            ScriptSource {
                eid: "MyScript".into(),
                fid: LongFid::new("Mod.esp", 0x801),
                text: "scn MyScript\r\n\r\nbegin OnAdd player\r\n  message \"hi, \"\"you\"\"\"\r\nend\r\n".into(),
            },
        );
        scripts.write_to_interchange(&path).unwrap();

        let mut fresh = ScriptText::new(Arc::clone(&scripts.game));
        assert!(fresh.read_from_interchange(&path, &Aliases::new()).unwrap().is_empty());
        assert_eq!(fresh.scripts, scripts.scripts);
    }
}
