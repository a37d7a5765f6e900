use super::{long_fid_of, parse_type, records_of, records_of_mut, ChangeReport, Extractor};
use crate::datatypes::Signature;
use crate::form_id::LongFid;
use crate::game::GameDescriptor;
use crate::interchange::{format_object, read_table, Aliases, BadRow, TableWriter};
use crate::plugin::Plugin;
use crate::progress::Progress;
use crate::utils::{is_questionable_editor_id, is_valid_editor_id, Result};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

const SCPT: Signature = Signature::new(b"SCPT");
const QUST: Signature = Signature::new(b"QUST");
const INFO: Signature = Signature::new(b"INFO");

/// 带有脚本文本、需要跟随编辑器ID改名的类型
const TEXT_TYPES: [Signature; 3] = [SCPT, QUST, INFO];

/// 编辑器ID
///
/// 写回时先改名，再把脚本、任务和对话文本中作为完整单词出现的旧名替换为新名。
#[derive(Debug)]
pub struct EditorIds {
    game: Arc<GameDescriptor>,
    /// 类型 → FormID → 编辑器ID
    pub ids: BTreeMap<Signature, BTreeMap<LongFid, String>>,
    /// 表格第五列：改名前的编辑器ID，与插件中的当前值不符时不改名
    pub expected: HashMap<LongFid, String>,
    /// 不以字母开头的编辑器ID
    pub questionable: BTreeSet<String>,
}

impl EditorIds {
    pub fn new(game: Arc<GameDescriptor>) -> Self {
        EditorIds {
            game,
            ids: BTreeMap::new(),
            expected: HashMap::new(),
            questionable: BTreeSet::new(),
        }
    }
}

/// 把文本中完整匹配旧名（大小写不敏感）的单词替换为新名
pub fn replace_words(pattern: &Regex, renames: &HashMap<String, String>, text: &str) -> String {
    pattern
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let word = &caps[0];
            renames
                .get(&word.to_lowercase())
                .cloned()
                .unwrap_or_else(|| word.to_string())
        })
        .into_owned()
}

impl Extractor for EditorIds {
    fn game(&self) -> &Arc<GameDescriptor> {
        &self.game
    }

    fn read_types(&self) -> Vec<Signature> {
        let mut types = self.game.names_types.clone();
        if !types.contains(&SCPT) {
            types.push(SCPT);
        }
        types
    }

    fn write_types(&self) -> Vec<Signature> {
        let mut types = self.read_types();
        for sig in TEXT_TYPES {
            if !types.contains(&sig) {
                types.push(sig);
            }
        }
        types
    }

    fn read_plugin(&mut self, plugin: &Plugin) -> Result<()> {
        for sig in self.read_types() {
            let table = self.ids.entry(sig).or_default();
            for record in records_of(plugin, sig) {
                if let Some(eid) = record.get_editor_id().filter(|eid| !eid.is_empty()) {
                    table.insert(long_fid_of(record)?, eid);
                }
            }
        }
        Ok(())
    }

    fn apply_to_plugin(&self, plugin: &mut Plugin, report: &mut ChangeReport, _progress: &dyn Progress) -> Result<()> {
        let mut renames: HashMap<String, String> = HashMap::new();

        for (sig, table) in &self.ids {
            for record in records_of_mut(plugin, *sig) {
                let fid = long_fid_of(record)?;
                let Some(new_eid) = table.get(&fid) else { continue };
                let old_eid = record.get_editor_id().unwrap_or_default();
                if &old_eid == new_eid {
                    continue;
                }
                if let Some(expected) = self.expected.get(&fid) {
                    if !expected.eq_ignore_ascii_case(&old_eid) {
                        warn!("{}: 当前编辑器ID {:?} 与表格中的旧值 {:?} 不符，跳过", fid, old_eid, expected);
                        continue;
                    }
                }
                if record.set_editor_id(new_eid)? {
                    report.count(&fid);
                    report.renamed.push((old_eid.clone(), new_eid.clone()));
                    if !old_eid.is_empty() {
                        renames.insert(old_eid.to_lowercase(), new_eid.clone());
                    }
                }
            }
        }

        if renames.is_empty() {
            return Ok(());
        }
        debug!("{} 个编辑器ID改名，替换脚本文本", renames.len());
        let pattern = Regex::new(r"\w+")?;
        for sig in TEXT_TYPES {
            for record in records_of_mut(plugin, sig) {
                let mut rewrite = |text: &str| replace_words(&pattern, &renames, text);
                if record.rewrite_text_fields(&mut rewrite)? {
                    report.count_propagated(&long_fid_of(record)?);
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
            let eid = row.get(3).trim();
            if !is_valid_editor_id(eid) {
                bad.push(row.bad("编辑器ID只能包含字母和数字"));
                continue;
            }
            if is_questionable_editor_id(eid) {
                self.questionable.insert(eid.to_string());
            }
            let old = row.get(4).trim();
            if !old.is_empty() {
                self.expected.insert(fid.clone(), old.to_string());
            }
            self.ids.entry(sig).or_default().insert(fid, eid.to_string());
        }
        Ok(bad)
    }

    fn write_to_interchange(&self, path: &Path) -> Result<()> {
        let mut writer = TableWriter::create(path)?;
        writer.write_row(["Type", "Mod Name", "ObjectIndex", "Editor Id"])?;
        for (sig, table) in &self.ids {
            let sig = sig.to_string();
            for (fid, eid) in table {
                writer.write_row([sig.as_str(), fid.master.as_str(), &format_object(fid.object), eid])?;
            }
        }
        writer.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn renames(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(old, new)| (old.to_lowercase(), new.to_string()))
            .collect()
    }

    #[test]
    fn test_replace_whole_words_only() {
        let pattern = Regex::new(r"\w+").unwrap();
        let map = renames(&[("OldSpell", "NewSpell")]);
        let text = "player.addspell OldSpell; if (oldspell) OldSpellX";
        assert_eq!(
            replace_words(&pattern, &map, text),
            "player.addspell NewSpell; if (NewSpell) OldSpellX"
        );
    }

    #[test]
    fn test_replace_keeps_other_text() {
        let pattern = Regex::new(r"\w+").unwrap();
        let map = renames(&[("A", "B")]);
        assert_eq!(replace_words(&pattern, &map, "set x to 1\r\n; A\r\n"), "set x to 1\r\n; B\r\n");
        assert_eq!(replace_words(&pattern, &map, ""), "");
    }
}
