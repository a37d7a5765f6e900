use super::Plugin;
use crate::datatypes::Signature;
use crate::form_id::{FidForm, FormId, LongFid, MapFid, MasterMap, MasterSet, ModName, RESERVED_OBJECT_LIMIT};
use crate::group::{GroupChild, RecordGroup, TopGroup};
use crate::mod_dir::ModDirectory;
use crate::utils::{EspError, Result};
use tracing::{debug, warn};

impl Plugin {
    /// 转换为长格式FormID
    ///
    /// `types` 为 None 时转换全部顶层组；指定类型时，其余含记录的已加载组
    /// 必须为空，否则返回状态错误（不允许混合编码）。
    pub fn convert_to_long_fids(&mut self, types: Option<&[Signature]>) -> Result<()> {
        self.require_form(FidForm::Short)?;
        if let Some(types) = types {
            let left_out: Vec<String> = self
                .tops
                .iter()
                .filter(|top| !types.contains(&top.label()) && !top.all_records().is_empty())
                .map(|top| top.label().to_string())
                .collect();
            if !left_out.is_empty() {
                return Err(EspError::state(format!(
                    "部分转换会使 {} 保持短格式",
                    left_out.join(", ")
                )));
            }
        }

        let mapper = self.long_mapper();
        for top in &mut self.tops {
            top.convert_fids(&mapper, true)?;
        }
        let unparsed = self.unparsed_tops();
        if !unparsed.is_empty() {
            debug!("{}: {} 个原始组保持短格式，主文件列表不可修改", self.name, unparsed.len());
        }
        self.fid_repairs += mapper.repairs();
        if mapper.repairs() > 0 {
            warn!("{}: {} 个FormID的主文件槽位越界，已按自身文件处理", self.name, mapper.repairs());
        }
        self.fid_form = FidForm::Long;
        Ok(())
    }

    /// 转换回短格式FormID
    ///
    /// 先检查所有所属文件都在主文件列表中，失败时不修改任何记录。
    pub fn convert_to_short_fids(&mut self) -> Result<()> {
        self.require_form(FidForm::Long)?;
        let mapper = self.short_mapper();
        for top in &self.tops {
            for record in top.all_records() {
                mapper.map_fid(&record.form_id)?;
                if !record.is_unpacked() {
                    continue;
                }
                for sub in record.subrecords()?.iter() {
                    for fid in sub.long_fids() {
                        mapper.map_long(fid)?;
                    }
                }
            }
        }
        for top in &mut self.tops {
            top.convert_fids(&mapper, false)?;
        }
        self.fid_form = FidForm::Short;
        Ok(())
    }

    /// 设置主文件列表
    ///
    /// 需处于长格式且没有未解析的组：原始字节中的短格式FormID
    /// 会随主文件列表的变化指向错误的文件。
    pub fn set_masters(&mut self, masters: Vec<ModName>) -> Result<()> {
        self.require_form(FidForm::Long)?;
        self.require_fully_parsed("修改主文件列表")?;
        self.header.masters = masters;
        Ok(())
    }

    /// 添加主文件；已存在时返回 false
    pub fn add_master(&mut self, name: ModName, position: Option<usize>) -> Result<bool> {
        self.require_form(FidForm::Long)?;
        if name == self.name || self.header.masters.contains(&name) {
            return Ok(false);
        }
        let mut masters = self.header.masters.clone();
        let index = position.unwrap_or(masters.len()).min(masters.len());
        masters.insert(index, name);
        self.set_masters(masters)?;
        Ok(true)
    }

    /// 实际被引用的主文件（按加载顺序）
    ///
    /// 总会包含数据目录中第一个存在的游戏主文件。
    /// 原始组中的引用无法统计，存在时返回状态错误。
    pub fn masters_used(&self, dir: &ModDirectory) -> Result<Vec<ModName>> {
        self.require_form(FidForm::Long)?;
        self.require_fully_parsed("统计实际使用的主文件")?;
        let mut used = MasterSet::new();
        if let Some(game_master) = self.game.master_names().into_iter().find(|m| dir.exists(m)) {
            used.add(&game_master);
        }
        for top in &self.tops {
            top.update_masters(&mut used);
        }
        let ordered = used.ordered(dir.load_order());
        Ok(ordered.into_iter().filter(|m| *m != self.name).collect())
    }

    /// 从另一个短格式文件导入记录，按FormID替换或追加
    ///
    /// 返回导入的记录数。所有记录先完成映射再写入，映射失败时不做任何修改。
    pub fn import_records(&mut self, other: &Plugin, types: &[Signature]) -> Result<usize> {
        self.require_form(FidForm::Short)?;
        other.require_form(FidForm::Short)?;

        let mut in_masters = other.masters().to_vec();
        in_masters.push(other.name().clone());
        let mut out_masters = self.masters().to_vec();
        out_masters.push(self.name.clone());
        let map = MasterMap::new(&in_masters, &out_masters);

        let mut imported = Vec::new();
        for sig in types {
            let Some(top) = other.top(*sig) else { continue };
            let group = match top {
                TopGroup::Flat(flat) => flat.group(),
                _ => return Err(EspError::state(format!("只能导入平铺的顶层组，{} 不是", sig))),
            };
            for child in &group.children {
                if let GroupChild::Record(record) = child {
                    let mut record = record.clone();
                    record.unpack()?;
                    record.convert_fids(&map, false)?;
                    imported.push((*sig, record));
                }
            }
        }

        let count = imported.len();
        for (sig, record) in imported {
            match self.top_mut(sig)? {
                TopGroup::Flat(flat) => flat.set_record(record),
                _ => return Err(EspError::state(format!("{} 不是平铺的顶层组", sig))),
            }
        }
        debug!("{}: 从 {} 导入 {} 条记录", self.name, other.name(), count);
        Ok(count)
    }

    /// 分配一个新的自身FormID并推进文件头计数
    pub fn next_object_fid(&mut self) -> Result<FormId> {
        self.require_loaded()?;
        let object = self.header.next_object.max(RESERVED_OBJECT_LIMIT);
        self.header.next_object = object + 1;
        Ok(match self.fid_form {
            FidForm::Short => FormId::Short(((self.header.masters.len() as u32) << 24) | object),
            FidForm::Long => FormId::Long(LongFid::new(self.name.clone(), object)),
        })
    }
}
