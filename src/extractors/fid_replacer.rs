use super::{open_long, records_of_mut};
use crate::datatypes::Signature;
use crate::form_id::{FormId, LongFid, MapFid, ModName};
use crate::game::GameDescriptor;
use crate::interchange::{read_table, Aliases, BadRow};
use crate::mod_dir::ModDirectory;
use crate::utils::Result;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 一次替换的统计
#[derive(Debug, Clone, PartialEq)]
pub struct SwapCount {
    pub old: LongFid,
    pub new: LongFid,
    pub count: usize,
    pub old_eid: String,
    pub new_eid: String,
}

impl fmt::Display for SwapCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:3} {} >> {}", self.count, self.old_eid, self.new_eid)
    }
}

/// 把一组FormID替换为另一组
#[derive(Debug)]
pub struct FidReplacer {
    game: Arc<GameDescriptor>,
    pub old_new: BTreeMap<LongFid, LongFid>,
    pub old_eid: HashMap<LongFid, String>,
    pub new_eid: HashMap<LongFid, String>,
}

/// 按表替换长格式FormID并计数
struct Swapper<'a> {
    old_new: &'a BTreeMap<LongFid, LongFid>,
    counts: RefCell<BTreeMap<LongFid, usize>>,
}

impl Swapper<'_> {
    fn hits(&self) -> usize {
        self.counts.borrow().values().sum()
    }
}

impl MapFid for Swapper<'_> {
    fn map_fid(&self, fid: &FormId) -> Result<FormId> {
        let Some((old, new)) = fid.long().and_then(|long| self.old_new.get_key_value(long)) else {
            return Ok(fid.clone());
        };
        *self.counts.borrow_mut().entry(old.clone()).or_insert(0) += 1;
        Ok(FormId::Long(new.clone()))
    }
}

impl FidReplacer {
    pub fn new(game: Arc<GameDescriptor>) -> Self {
        FidReplacer {
            game,
            old_new: BTreeMap::new(),
            old_eid: HashMap::new(),
            new_eid: HashMap::new(),
        }
    }

    /// 读取替换表：旧所属文件、旧对象、旧编辑器ID、新编辑器ID、新所属文件、新对象
    pub fn read_from_interchange(&mut self, path: &Path, aliases: &Aliases) -> Result<Vec<BadRow>> {
        let mut bad = Vec::new();
        for row in read_table(path)? {
            if !row.is_data(1) {
                continue;
            }
            if !row.is_data(5) {
                bad.push(row.bad("新对象列不是十六进制"));
                continue;
            }
            let (Some(old), Some(new)) = (row.long_fid(0, 1, aliases), row.long_fid(4, 5, aliases)) else {
                bad.push(row.bad("FormID无效"));
                continue;
            };
            self.old_eid.insert(old.clone(), row.get(2).to_string());
            self.new_eid.insert(new.clone(), row.get(3).to_string());
            self.old_new.insert(old, new);
        }
        Ok(bad)
    }

    /// 替换插件中指定类型记录引用的FormID
    ///
    /// `change_record_ids` 为 true 时也替换记录自身的FormID。
    /// 只处理新旧所属文件都在插件主文件列表中（或为插件自身）的条目；
    /// 有替换时保存文件，返回按旧编辑器ID排序的统计。
    pub fn update_file(
        &self,
        dir: &ModDirectory,
        name: &ModName,
        types: &[Signature],
        change_record_ids: bool,
    ) -> Result<Vec<SwapCount>> {
        let mut plugin = open_long(dir, name, &self.game, true, types)?;

        let known = |fid: &LongFid| fid.master == *name || plugin.masters().contains(&fid.master);
        let mut old_new = BTreeMap::new();
        for (old, new) in &self.old_new {
            if known(old) && known(new) {
                old_new.insert(old.clone(), new.clone());
            } else {
                warn!("{}: {} >> {} 的所属文件不是主文件，跳过", name, old, new);
            }
        }
        if old_new.is_empty() {
            debug!("{}: 没有可替换的FormID", name);
            return Ok(Vec::new());
        }

        let swapper = Swapper {
            old_new: &old_new,
            counts: RefCell::new(BTreeMap::new()),
        };
        for sig in types {
            for record in records_of_mut(&mut plugin, *sig) {
                let before = swapper.hits();
                if change_record_ids {
                    record.form_id = swapper.map_fid(&record.form_id)?;
                }
                record.map_payload_fids(&swapper)?;
                if swapper.hits() != before {
                    record.mark_modified();
                }
            }
        }

        let counts = swapper.counts.into_inner();
        if counts.is_empty() {
            return Ok(Vec::new());
        }
        plugin.convert_to_short_fids()?;
        plugin.safe_save()?;

        let eid = |map: &HashMap<LongFid, String>, fid: &LongFid| map.get(fid).cloned().unwrap_or_default();
        let mut summary: Vec<SwapCount> = counts
            .into_iter()
            .filter_map(|(old, count)| {
                let new = old_new.get(&old)?.clone();
                Some(SwapCount {
                    old_eid: eid(&self.old_eid, &old),
                    new_eid: eid(&self.new_eid, &new),
                    old,
                    new,
                    count,
                })
            })
            .collect();
        summary.sort_by(|a, b| a.old_eid.cmp(&b.old_eid));
        info!("{}: 替换 {} 处FormID", name, summary.iter().map(|s| s.count).sum::<usize>());
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_pairs_with_aliases() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replace.csv");
        std::fs::write(
            &path,
            "\"Old Mod\",\"Old Object\",\"Old Eid\",\"New Eid\",\"New Mod\",\"New Object\"\r\n\
             \"Old.esp\",\"0x000801\",\"OldSword\",\"NewSword\",\"New.esp\",\"0x000900\"\r\n\
             \"Old.esp\",\"0x000802\",\"OldShield\",\"NewShield\",\"New.esp\",\"shield\"\r\n",
        )
        .unwrap();

        let mut aliases = Aliases::new();
        aliases.insert("Old.esp", "Renamed.esp");
        let mut replacer = FidReplacer::new(Arc::new(GameDescriptor::builtin("oblivion").unwrap()));
        let bad = replacer.read_from_interchange(&path, &aliases).unwrap();

        assert_eq!(bad.len(), 1);
        let old = LongFid::new("Renamed.esp", 0x801);
        let new = LongFid::new("New.esp", 0x900);
        assert_eq!(replacer.old_new.get(&old), Some(&new));
        assert_eq!(replacer.old_eid[&old], "OldSword");
        assert_eq!(replacer.new_eid[&new], "NewSword");
    }

    #[test]
    fn test_swapper_counts_only_known_ids() {
        let mut table = BTreeMap::new();
        table.insert(LongFid::new("A.esm", 0x10), LongFid::new("B.esp", 0x20));
        let swapper = Swapper {
            old_new: &table,
            counts: RefCell::new(BTreeMap::new()),
        };

        let mapped = swapper.map_fid(&FormId::Long(LongFid::new("a.esm", 0x10))).unwrap();
        assert_eq!(mapped, FormId::Long(LongFid::new("B.esp", 0x20)));
        let untouched = swapper.map_fid(&FormId::Long(LongFid::new("A.esm", 0x11))).unwrap();
        assert_eq!(untouched, FormId::Long(LongFid::new("A.esm", 0x11)));
        assert_eq!(swapper.map_fid(&FormId::Short(0x10)).unwrap(), FormId::Short(0x10));
        assert_eq!(swapper.hits(), 1);
    }
}
