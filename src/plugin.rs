use crate::datatypes::{RecordFlags, Signature};
use crate::factory::LoadFactory;
use crate::form_id::{FidForm, LongMapper, ModName, ShortMapper};
use crate::game::GameDescriptor;
use crate::group::{LoadContext, RecordGroup, TopGroup};
use crate::record::Record;
use crate::utils::{EspError, Result};
use std::cell::OnceCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

mod fids;
mod parser;
mod stats;
mod writer;

pub use parser::FileHeader;
pub use stats::PluginStats;

/// 加载状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Unloaded,
    Loading,
    Loaded,
}

impl fmt::Display for LoadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadState::Unloaded => f.write_str("unloaded"),
            LoadState::Loading => f.write_str("loading"),
            LoadState::Loaded => f.write_str("loaded"),
        }
    }
}

/// 插件文件
///
/// 依照加载工厂读取文件头和感兴趣的顶层组，提供FormID长短格式转换、
/// 主文件列表编辑以及按原始字节回写未修改内容的保存。
#[derive(Debug)]
pub struct Plugin {
    path: PathBuf,
    name: ModName,
    game: Arc<GameDescriptor>,
    factory: LoadFactory,
    state: LoadState,
    fid_form: FidForm,
    header_record: Option<Record>,
    header: FileHeader,
    /// 顶层组（保持读取顺序）
    tops: Vec<TopGroup>,
    skipped: BTreeSet<Signature>,
    fid_repairs: usize,
    mgef_school: OnceCell<BTreeMap<String, u32>>,
    mgef_names: OnceCell<BTreeMap<String, String>>,
    hostile_effects: OnceCell<BTreeSet<String>>,
}

impl Plugin {
    /// 创建未加载的插件
    pub fn new(path: impl Into<PathBuf>, game: Arc<GameDescriptor>, factory: LoadFactory) -> Self {
        let path = path.into();
        let name = ModName::new(
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        );
        Plugin {
            path,
            name,
            game,
            factory,
            state: LoadState::Unloaded,
            fid_form: FidForm::Short,
            header_record: None,
            header: FileHeader::default(),
            tops: Vec::new(),
            skipped: BTreeSet::new(),
            fid_repairs: 0,
            mgef_school: OnceCell::new(),
            mgef_names: OnceCell::new(),
            hostile_effects: OnceCell::new(),
        }
    }

    /// 创建并加载
    ///
    /// `keep_all` 为 true 时保留全部内容以便保存，`types` 为需要解码的记录签名。
    pub fn open(
        path: impl Into<PathBuf>,
        game: Arc<GameDescriptor>,
        keep_all: bool,
        types: &[Signature],
    ) -> Result<Self> {
        let factory = game.factory(keep_all, types);
        let mut plugin = Plugin::new(path, game, factory);
        plugin.load(true)?;
        Ok(plugin)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> &ModName {
        &self.name
    }

    pub fn game(&self) -> &GameDescriptor {
        &self.game
    }

    pub fn factory(&self) -> &LoadFactory {
        &self.factory
    }

    pub fn state(&self) -> LoadState {
        self.state
    }

    pub fn is_loaded(&self) -> bool {
        self.state == LoadState::Loaded
    }

    /// 当前FormID编码
    pub fn fid_form(&self) -> FidForm {
        self.fid_form
    }

    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    /// 主文件列表
    pub fn masters(&self) -> &[ModName] {
        &self.header.masters
    }

    pub fn is_master(&self) -> bool {
        self.header.flags & RecordFlags::MASTER_FILE.bits() != 0
    }

    pub fn is_localized(&self) -> bool {
        self.header.flags & RecordFlags::LOCALIZED.bits() != 0
    }

    /// 选择模式下跳过的记录签名
    pub fn skipped(&self) -> &BTreeSet<Signature> {
        &self.skipped
    }

    /// 短格式→长格式转换中发生的越界槽位修复次数
    pub fn fid_repairs(&self) -> usize {
        self.fid_repairs
    }

    pub(crate) fn require_loaded(&self) -> Result<()> {
        if self.state != LoadState::Loaded {
            return Err(EspError::state(format!("{} 当前状态为 {}，需要 loaded", self.name, self.state)));
        }
        Ok(())
    }

    pub(crate) fn require_form(&self, form: FidForm) -> Result<()> {
        self.require_loaded()?;
        if self.fid_form != form {
            return Err(EspError::state(format!(
                "{} 的FormID为{}格式，需要{}格式",
                self.name, self.fid_form, form
            )));
        }
        Ok(())
    }

    /// 含未解析内容的顶层组
    pub fn unparsed_tops(&self) -> Vec<Signature> {
        self.tops
            .iter()
            .filter(|top| top.has_unparsed())
            .map(|top| top.label())
            .collect()
    }

    /// 未解析的字节无法重新映射，也无法统计引用
    pub(crate) fn require_fully_parsed(&self, operation: &str) -> Result<()> {
        let unparsed = self.unparsed_tops();
        if unparsed.is_empty() {
            return Ok(());
        }
        let labels: Vec<String> = unparsed.iter().map(Signature::to_string).collect();
        Err(EspError::state(format!(
            "{}: {} 需要完整解析，{} 仍为原始数据",
            self.name,
            operation,
            labels.join(", ")
        )))
    }

    /// 短格式→长格式的映射器
    pub fn long_mapper(&self) -> LongMapper {
        LongMapper::new(&self.header.masters, &self.name)
    }

    /// 长格式→短格式的映射器
    pub fn short_mapper(&self) -> ShortMapper {
        ShortMapper::new(&self.header.masters, &self.name, self.game.expanded_plugin_range)
    }

    /// 已加载的顶层组（读取顺序）
    pub fn tops(&self) -> impl Iterator<Item = &TopGroup> {
        self.tops.iter()
    }

    pub fn top(&self, sig: Signature) -> Option<&TopGroup> {
        self.tops.iter().find(|top| top.label() == sig)
    }

    /// 可变访问顶层组；不存在时为游戏的顶层类型新建空组
    pub fn top_mut(&mut self, sig: Signature) -> Result<&mut TopGroup> {
        self.require_loaded()?;
        let index = match self.tops.iter().position(|top| top.label() == sig) {
            Some(index) => index,
            None => {
                if !self.game.is_top_type(sig) {
                    return Err(EspError::InvalidTopType(sig.to_string()));
                }
                self.tops.push(TopGroup::empty(sig));
                self.tops.len() - 1
            }
        };
        Ok(&mut self.tops[index])
    }

    /// 某顶层组中的有效记录
    pub fn records(&self, sig: Signature) -> Vec<&Record> {
        self.top(sig).map(|top| top.records()).unwrap_or_default()
    }

    /// 某顶层组中某类型的全部记录（可变）
    pub fn records_mut(&mut self, top: Signature, record_type: Signature) -> Vec<&mut Record> {
        match self.tops.iter_mut().find(|t| t.label() == top) {
            Some(group) => group
                .all_records_mut()
                .into_iter()
                .filter(|r| r.record_type == record_type)
                .collect(),
            None => Vec::new(),
        }
    }

    /// 解析延迟的单元格块（需处于短格式，新解析的记录与其余记录编码一致）
    pub fn unpack_cell_blocks(&mut self) -> Result<usize> {
        self.require_form(FidForm::Short)?;
        let header_size = self.game.header_size;
        let mut ctx = LoadContext {
            factory: &self.factory,
            unpack: true,
            skipped: &mut self.skipped,
        };
        let mut loaded = 0;
        for top in &mut self.tops {
            if let TopGroup::Hierarchical(tree) = top {
                loaded += tree.unpack_blocks(header_size, &mut ctx)?;
            }
        }
        Ok(loaded)
    }

    /// 卸载内容并清除缓存
    pub fn unload(&mut self) {
        self.tops.clear();
        self.header_record = None;
        self.header = FileHeader::default();
        self.skipped.clear();
        self.fid_form = FidForm::Short;
        self.fid_repairs = 0;
        self.mgef_school.take();
        self.mgef_names.take();
        self.hostile_effects.take();
        self.state = LoadState::Unloaded;
    }

    fn mgef_records(&self) -> Vec<&Record> {
        self.records(Signature::new(b"MGEF"))
    }

    /// 魔法效果代码 → 学派（游戏默认值叠加本文件的 MGEF 记录）
    pub fn mgef_school(&self) -> &BTreeMap<String, u32> {
        self.mgef_school.get_or_init(|| {
            let mut schools = self.game.mgef_school.clone();
            for record in self.mgef_records() {
                let Some(code) = record.get_editor_id() else { continue };
                match record.attr("school") {
                    Ok(Some(value)) => {
                        if let Some(school) = value.as_int() {
                            schools.insert(code, school as u32);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!("读取魔法效果 {} 的学派失败: {}", code, e),
                }
            }
            schools
        })
    }

    /// 魔法效果代码 → 显示名称
    pub fn mgef_names(&self) -> &BTreeMap<String, String> {
        self.mgef_names.get_or_init(|| {
            let mut names = self.game.mgef_names.clone();
            for record in self.mgef_records() {
                let Some(code) = record.get_editor_id() else { continue };
                match record.full_name() {
                    Ok(Some(name)) => {
                        names.insert(code, name);
                    }
                    Ok(None) => {}
                    Err(e) => warn!("读取魔法效果 {} 的名称失败: {}", code, e),
                }
            }
            names
        })
    }

    /// 敌对效果代码
    pub fn hostile_effects(&self) -> &BTreeSet<String> {
        self.hostile_effects.get_or_init(|| {
            let mut hostile: BTreeSet<String> = self.game.hostile_effects.iter().cloned().collect();
            for record in self.mgef_records() {
                let Some(code) = record.get_editor_id() else { continue };
                match record.attr("hostile") {
                    Ok(Some(value)) if value.as_bool() == Some(true) => {
                        hostile.insert(code);
                    }
                    Ok(Some(_)) => {
                        hostile.remove(&code);
                    }
                    Ok(None) => {}
                    Err(e) => warn!("读取魔法效果 {} 的敌对标志失败: {}", code, e),
                }
            }
            hostile
        })
    }
}
