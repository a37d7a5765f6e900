use crate::datatypes::Signature;
use crate::factory::{LoadFactory, TopKind};
use crate::form_id::{FormId, MapFid, MasterSet};
use crate::reader::{ChunkHeader, ModReader};
use crate::record::Record;
use crate::utils::Result;
use std::collections::BTreeSet;
use tracing::{debug, warn};

/// 组类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupType {
    /// 顶层组
    Top,
    /// 世界子组
    WorldChildren,
    /// 室内单元格块
    InteriorBlock,
    /// 室内单元格子块
    InteriorSubBlock,
    /// 室外单元格块
    ExteriorBlock,
    /// 室外单元格子块
    ExteriorSubBlock,
    /// 单元格子组
    CellChildren,
    /// 话题子组
    TopicChildren,
    /// 单元格持久引用
    CellPersistent,
    /// 单元格临时引用
    CellTemporary,
    /// 单元格远距离可见引用
    CellVisibleDistant,
    /// 未知类型
    Unknown(i32),
}

impl GroupType {
    /// 转换为i32值
    pub fn to_i32(&self) -> i32 {
        match self {
            GroupType::Top => 0,
            GroupType::WorldChildren => 1,
            GroupType::InteriorBlock => 2,
            GroupType::InteriorSubBlock => 3,
            GroupType::ExteriorBlock => 4,
            GroupType::ExteriorSubBlock => 5,
            GroupType::CellChildren => 6,
            GroupType::TopicChildren => 7,
            GroupType::CellPersistent => 8,
            GroupType::CellTemporary => 9,
            GroupType::CellVisibleDistant => 10,
            GroupType::Unknown(value) => *value,
        }
    }

    /// 单元格内引用所在的组
    pub fn holds_references(&self) -> bool {
        matches!(
            self,
            GroupType::CellPersistent | GroupType::CellTemporary | GroupType::CellVisibleDistant
        )
    }
}

impl From<i32> for GroupType {
    fn from(value: i32) -> Self {
        match value {
            0 => GroupType::Top,
            1 => GroupType::WorldChildren,
            2 => GroupType::InteriorBlock,
            3 => GroupType::InteriorSubBlock,
            4 => GroupType::ExteriorBlock,
            5 => GroupType::ExteriorSubBlock,
            6 => GroupType::CellChildren,
            7 => GroupType::TopicChildren,
            8 => GroupType::CellPersistent,
            9 => GroupType::CellTemporary,
            10 => GroupType::CellVisibleDistant,
            _ => GroupType::Unknown(value),
        }
    }
}

/// 子组类型是否可以出现在父组中
fn allowed_child(parent: GroupType, child: GroupType) -> bool {
    use GroupType::*;
    match (parent, child) {
        (_, Top) => false,
        (_, Unknown(_)) | (Unknown(_), _) => true,
        (Top, TopicChildren | InteriorBlock | WorldChildren) => true,
        (WorldChildren, CellChildren | ExteriorBlock) => true,
        (InteriorBlock, InteriorSubBlock) => true,
        (ExteriorBlock, ExteriorSubBlock) => true,
        (InteriorSubBlock | ExteriorSubBlock, CellChildren) => true,
        (CellChildren, CellPersistent | CellTemporary | CellVisibleDistant) => true,
        _ => false,
    }
}

/// 组头部
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupHeader {
    /// 组大小(包含头部)
    pub size: u32,
    /// 标签
    pub label: [u8; 4],
    /// 组类型
    pub group_type: GroupType,
    /// 版本控制信息
    pub version_control_info: u32,
    /// 内部版本（仅24字节头部）
    pub internal_version: u32,
}

impl GroupHeader {
    /// 新建顶层组头部（大小为 0 表示尚未写入磁盘）
    pub fn top(label: Signature) -> Self {
        GroupHeader {
            size: 0,
            label: label.0,
            group_type: GroupType::Top,
            version_control_info: 0,
            internal_version: 0,
        }
    }

    /// 获取组标签
    pub fn label_signature(&self) -> Signature {
        Signature(self.label)
    }
}

/// 加载时的共享状态
pub struct LoadContext<'a> {
    pub factory: &'a LoadFactory,
    /// 是否立即解包记录
    pub unpack: bool,
    /// 选择模式下跳过的签名
    pub skipped: &'a mut BTreeSet<Signature>,
}

/// 组的公共能力
pub trait RecordGroup {
    fn label(&self) -> Signature;

    /// 全部记录（包括已删除/被忽略的）
    fn all_records(&self) -> Vec<&Record>;

    fn all_records_mut(&mut self) -> Vec<&mut Record>;

    /// 有效记录：未删除且未被忽略
    fn records(&self) -> Vec<&Record> {
        self.all_records()
            .into_iter()
            .filter(|record| record.is_active())
            .collect()
    }

    /// 把每个标识的所属文件加入集合（需处于长格式）
    fn update_masters(&self, masters: &mut MasterSet) {
        for record in self.all_records() {
            record.update_masters(masters);
        }
    }

    /// 对每个标识字段应用转换函数
    fn convert_fids(&mut self, mapper: &dyn MapFid, to_long: bool) -> Result<()>;

    /// 写入文件头的计数：每条记录和每个组各计 1
    fn num_records(&self, header_size: usize) -> Result<usize>;

    /// 磁盘上的字节数（含头部）
    fn data_size(&self, header_size: usize) -> Result<usize>;
}

/// 只保留字节范围的组
#[derive(Debug, Clone)]
pub struct RawGroup {
    pub header: GroupHeader,
    data: Vec<u8>,
}

impl RawGroup {
    /// 读取组负载（不解析）
    pub(crate) fn read(reader: &mut ModReader<'_>, header: GroupHeader) -> Result<Self> {
        let payload = header.size as usize - reader.header_size();
        let data = reader.read_exact(payload)?.to_vec();
        Ok(RawGroup { header, data })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// 解析为已加载的组
    pub fn load(&self, header_size: usize, ctx: &mut LoadContext<'_>) -> Result<Group> {
        let name = self.header.label_signature().to_string();
        let mut reader = ModReader::new(name, &self.data, header_size);
        Group::load(&mut reader, self.header.clone(), ctx, false)
    }
}

impl RecordGroup for RawGroup {
    fn label(&self) -> Signature {
        self.header.label_signature()
    }

    fn all_records(&self) -> Vec<&Record> {
        Vec::new()
    }

    fn all_records_mut(&mut self) -> Vec<&mut Record> {
        Vec::new()
    }

    fn convert_fids(&mut self, _mapper: &dyn MapFid, _to_long: bool) -> Result<()> {
        debug!("原始组 {} 不参与FormID转换", self.label());
        Ok(())
    }

    fn num_records(&self, header_size: usize) -> Result<usize> {
        let name = self.label().to_string();
        let mut reader = ModReader::new(name, &self.data, header_size);
        let mut count = 1;
        while !reader.at_end() {
            match reader.next_header()? {
                ChunkHeader::Group(_) => count += 1,
                ChunkHeader::Record(header) => {
                    count += 1;
                    reader.skip(header.size as u64)?;
                }
            }
        }
        Ok(count)
    }

    fn data_size(&self, header_size: usize) -> Result<usize> {
        Ok(header_size + self.data.len())
    }
}

/// 组子元素
#[derive(Debug, Clone)]
pub enum GroupChild {
    /// 记录
    Record(Record),
    /// 子组
    Group(Box<Group>),
    /// 延迟解析的子组
    Raw(RawGroup),
}

/// 组结构
#[derive(Debug, Clone)]
pub struct Group {
    pub header: GroupHeader,
    /// 子元素（保持读取顺序）
    pub children: Vec<GroupChild>,
}

impl Group {
    pub fn new(header: GroupHeader) -> Self {
        Group {
            header,
            children: Vec::new(),
        }
    }

    /// 解析组负载
    ///
    /// `defer_nested` 为 true 时子组只保留字节范围。
    pub(crate) fn load(
        reader: &mut ModReader<'_>,
        header: GroupHeader,
        ctx: &mut LoadContext<'_>,
        defer_nested: bool,
    ) -> Result<Self> {
        let header_size = reader.header_size() as u64;
        let end = reader.position() + (header.size as u64 - header_size);
        let mut children = Vec::new();

        while reader.position() < end {
            match reader.next_header()? {
                ChunkHeader::Group(child) => {
                    if !allowed_child(header.group_type, child.group_type) {
                        return Err(reader.format_error(format!(
                            "组类型 {:?} 不能嵌套在 {:?}（{}）中",
                            child.group_type,
                            header.group_type,
                            header.label_signature()
                        )));
                    }
                    if reader.position() + (child.size as u64 - header_size) > end {
                        return Err(reader.format_error("子组超出父组范围"));
                    }
                    if defer_nested {
                        children.push(GroupChild::Raw(RawGroup::read(reader, child)?));
                    } else {
                        let group = Group::load(reader, child, ctx, false)?;
                        children.push(GroupChild::Group(Box::new(group)));
                    }
                }
                ChunkHeader::Record(record_header) => {
                    if reader.position() + record_header.size as u64 > end {
                        return Err(reader.format_error(format!(
                            "记录 {} 超出组范围",
                            record_header.signature
                        )));
                    }
                    match ctx.factory.class_for(record_header.signature) {
                        Some(schema) => {
                            let payload = reader.read_exact(record_header.size as usize)?;
                            let mut record = Record::from_header(&record_header, payload.to_vec(), schema);
                            if ctx.unpack {
                                if let Err(e) = record.unpack() {
                                    warn!(
                                        "记录 {} 0x{:08X} 解包失败，保留原始数据: {}",
                                        record_header.signature, record_header.form_id, e
                                    );
                                }
                            }
                            children.push(GroupChild::Record(record));
                        }
                        None => {
                            reader.skip(record_header.size as u64)?;
                            ctx.skipped.insert(record_header.signature);
                        }
                    }
                }
            }
        }

        if reader.position() != end {
            return Err(reader.format_error("组内容与声明大小不一致"));
        }

        Ok(Group { header, children })
    }

    /// 获取组标签
    pub fn label_signature(&self) -> Signature {
        self.header.label_signature()
    }

    /// 获取组类型
    pub fn get_type(&self) -> GroupType {
        self.header.group_type
    }

    /// 新建且为空的组不写入文件
    pub fn is_empty_new(&self) -> bool {
        self.header.size == 0 && self.children.is_empty()
    }

    /// 递归收集所有记录
    fn collect_records<'a>(&'a self, records: &mut Vec<&'a Record>) {
        for child in &self.children {
            match child {
                GroupChild::Group(group) => group.collect_records(records),
                GroupChild::Record(record) => records.push(record),
                GroupChild::Raw(_) => {}
            }
        }
    }

    fn collect_records_mut<'a>(&'a mut self, records: &mut Vec<&'a mut Record>) {
        for child in &mut self.children {
            match child {
                GroupChild::Group(group) => group.collect_records_mut(records),
                GroupChild::Record(record) => records.push(record),
                GroupChild::Raw(_) => {}
            }
        }
    }

    /// 收集满足条件的子组中的记录
    fn collect_in_groups<'a>(&'a self, pred: &dyn Fn(GroupType) -> bool, records: &mut Vec<&'a Record>) {
        for child in &self.children {
            if let GroupChild::Group(group) = child {
                if pred(group.get_type()) {
                    group.collect_records(records);
                } else {
                    group.collect_in_groups(pred, records);
                }
            }
        }
    }

    /// 延迟解析的子组数量（递归）
    pub fn deferred_count(&self) -> usize {
        self.children
            .iter()
            .map(|child| match child {
                GroupChild::Raw(_) => 1,
                GroupChild::Group(group) => group.deferred_count(),
                GroupChild::Record(_) => 0,
            })
            .sum()
    }

    /// 解析所有延迟的子组
    pub fn load_deferred(&mut self, header_size: usize, ctx: &mut LoadContext<'_>) -> Result<usize> {
        let mut loaded = 0;
        for child in &mut self.children {
            match child {
                GroupChild::Raw(raw) => {
                    let group = raw.load(header_size, ctx)?;
                    *child = GroupChild::Group(Box::new(group));
                    loaded += 1;
                }
                GroupChild::Group(group) => loaded += group.load_deferred(header_size, ctx)?,
                GroupChild::Record(_) => {}
            }
        }
        Ok(loaded)
    }
}

impl RecordGroup for Group {
    fn label(&self) -> Signature {
        self.label_signature()
    }

    fn all_records(&self) -> Vec<&Record> {
        let mut records = Vec::new();
        self.collect_records(&mut records);
        records
    }

    fn all_records_mut(&mut self) -> Vec<&mut Record> {
        let mut records = Vec::new();
        self.collect_records_mut(&mut records);
        records
    }

    fn convert_fids(&mut self, mapper: &dyn MapFid, to_long: bool) -> Result<()> {
        for child in &mut self.children {
            match child {
                GroupChild::Record(record) => record.convert_fids(mapper, to_long)?,
                GroupChild::Group(group) => group.convert_fids(mapper, to_long)?,
                GroupChild::Raw(raw) => raw.convert_fids(mapper, to_long)?,
            }
        }
        Ok(())
    }

    fn num_records(&self, header_size: usize) -> Result<usize> {
        if self.is_empty_new() {
            return Ok(0);
        }
        let mut count = 1;
        for child in &self.children {
            count += match child {
                GroupChild::Record(_) => 1,
                GroupChild::Group(group) => group.num_records(header_size)?,
                GroupChild::Raw(raw) => raw.num_records(header_size)?,
            };
        }
        Ok(count)
    }

    fn data_size(&self, header_size: usize) -> Result<usize> {
        let mut size = header_size;
        for child in &self.children {
            size += match child {
                GroupChild::Record(record) => header_size + record.payload_for_write()?.len(),
                GroupChild::Group(group) => group.data_size(header_size)?,
                GroupChild::Raw(raw) => raw.data_size(header_size)?,
            };
        }
        Ok(size)
    }
}

/// 平铺的顶层组
#[derive(Debug, Clone)]
pub struct FlatGroup {
    group: Group,
}

impl FlatGroup {
    pub fn new(group: Group) -> Self {
        FlatGroup { group }
    }

    pub fn group(&self) -> &Group {
        &self.group
    }

    pub fn group_mut(&mut self) -> &mut Group {
        &mut self.group
    }

    /// 按FormID查找直接子记录
    pub fn record(&self, form_id: &FormId) -> Option<&Record> {
        self.group.children.iter().find_map(|child| match child {
            GroupChild::Record(record) if &record.form_id == form_id => Some(record),
            _ => None,
        })
    }

    pub fn record_mut(&mut self, form_id: &FormId) -> Option<&mut Record> {
        self.group.children.iter_mut().find_map(|child| match child {
            GroupChild::Record(record) if &record.form_id == form_id => Some(record),
            _ => None,
        })
    }

    /// 替换同FormID的记录，不存在时追加到末尾
    pub fn set_record(&mut self, record: Record) {
        match self.record_mut(&record.form_id) {
            Some(existing) => *existing = record,
            None => self.group.children.push(GroupChild::Record(record)),
        }
    }
}

/// 世界/单元格层级的顶层组
#[derive(Debug, Clone)]
pub struct HierarchicalGroup {
    group: Group,
}

impl HierarchicalGroup {
    pub fn new(group: Group) -> Self {
        HierarchicalGroup { group }
    }

    pub fn group(&self) -> &Group {
        &self.group
    }

    pub fn group_mut(&mut self) -> &mut Group {
        &mut self.group
    }

    fn records_of(&self, sig: Signature) -> Vec<&Record> {
        self.group
            .all_records()
            .into_iter()
            .filter(|record| record.record_type == sig)
            .collect()
    }

    /// 已加载的单元格记录
    pub fn cells(&self) -> Vec<&Record> {
        self.records_of(Signature::new(b"CELL"))
    }

    /// 已加载的世界记录
    pub fn worlds(&self) -> Vec<&Record> {
        self.records_of(Signature::new(b"WRLD"))
    }

    /// 单元格内的引用（持久、临时、远距离可见）
    pub fn references(&self) -> Vec<&Record> {
        let mut records = Vec::new();
        self.group.collect_in_groups(&|t| t.holds_references(), &mut records);
        records
    }

    pub fn deferred_blocks(&self) -> usize {
        self.group.deferred_count()
    }

    /// 解析延迟的单元格块
    pub fn unpack_blocks(&mut self, header_size: usize, ctx: &mut LoadContext<'_>) -> Result<usize> {
        self.group.load_deferred(header_size, ctx)
    }
}

/// 顶层组
#[derive(Debug, Clone)]
pub enum TopGroup {
    Raw(RawGroup),
    Flat(FlatGroup),
    Hierarchical(HierarchicalGroup),
}

impl TopGroup {
    pub fn from_group(kind: TopKind, group: Group) -> Self {
        match kind {
            TopKind::Hierarchical => TopGroup::Hierarchical(HierarchicalGroup::new(group)),
            _ => TopGroup::Flat(FlatGroup::new(group)),
        }
    }

    /// 新建空的顶层组
    pub fn empty(label: Signature) -> Self {
        let group = Group::new(GroupHeader::top(label));
        if label == Signature::new(b"CELL") || label == Signature::new(b"WRLD") {
            TopGroup::Hierarchical(HierarchicalGroup::new(group))
        } else {
            TopGroup::Flat(FlatGroup::new(group))
        }
    }

    pub fn is_raw(&self) -> bool {
        matches!(self, TopGroup::Raw(_))
    }

    /// 是否含有未解析的字节（原始顶层组或延迟的子组）
    ///
    /// 这些字节中的FormID始终是读取时的短格式。
    pub fn has_unparsed(&self) -> bool {
        match self {
            TopGroup::Raw(raw) => !raw.data().is_empty(),
            TopGroup::Flat(flat) => flat.group().deferred_count() > 0,
            TopGroup::Hierarchical(tree) => tree.deferred_blocks() > 0,
        }
    }

    pub fn as_group(&self) -> Option<&Group> {
        match self {
            TopGroup::Raw(_) => None,
            TopGroup::Flat(flat) => Some(flat.group()),
            TopGroup::Hierarchical(tree) => Some(tree.group()),
        }
    }

    pub fn as_group_mut(&mut self) -> Option<&mut Group> {
        match self {
            TopGroup::Raw(_) => None,
            TopGroup::Flat(flat) => Some(flat.group_mut()),
            TopGroup::Hierarchical(tree) => Some(tree.group_mut()),
        }
    }

    pub fn as_flat(&self) -> Option<&FlatGroup> {
        match self {
            TopGroup::Flat(flat) => Some(flat),
            _ => None,
        }
    }

    pub fn as_flat_mut(&mut self) -> Option<&mut FlatGroup> {
        match self {
            TopGroup::Flat(flat) => Some(flat),
            _ => None,
        }
    }

    pub fn as_hierarchical(&self) -> Option<&HierarchicalGroup> {
        match self {
            TopGroup::Hierarchical(tree) => Some(tree),
            _ => None,
        }
    }

    fn as_dyn(&self) -> &dyn RecordGroup {
        match self {
            TopGroup::Raw(raw) => raw,
            TopGroup::Flat(flat) => flat.group(),
            TopGroup::Hierarchical(tree) => tree.group(),
        }
    }

    fn as_dyn_mut(&mut self) -> &mut dyn RecordGroup {
        match self {
            TopGroup::Raw(raw) => raw,
            TopGroup::Flat(flat) => flat.group_mut(),
            TopGroup::Hierarchical(tree) => tree.group_mut(),
        }
    }
}

impl RecordGroup for TopGroup {
    fn label(&self) -> Signature {
        self.as_dyn().label()
    }

    fn all_records(&self) -> Vec<&Record> {
        self.as_dyn().all_records()
    }

    fn all_records_mut(&mut self) -> Vec<&mut Record> {
        self.as_dyn_mut().all_records_mut()
    }

    fn convert_fids(&mut self, mapper: &dyn MapFid, to_long: bool) -> Result<()> {
        self.as_dyn_mut().convert_fids(mapper, to_long)
    }

    fn num_records(&self, header_size: usize) -> Result<usize> {
        self.as_dyn().num_records(header_size)
    }

    fn data_size(&self, header_size: usize) -> Result<usize> {
        self.as_dyn().data_size(header_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::EspError;

    const HS: usize = 20;

    fn record_bytes(sig: &[u8; 4], flags: u32, form_id: u32, payload: &[u8]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(sig);
        data.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        data.extend_from_slice(&flags.to_le_bytes());
        data.extend_from_slice(&form_id.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(payload);
        data
    }

    fn group_bytes(label: [u8; 4], group_type: i32, children: &[Vec<u8>]) -> Vec<u8> {
        let body: Vec<u8> = children.concat();
        let mut data = Vec::new();
        data.extend_from_slice(b"GRUP");
        data.extend_from_slice(&((body.len() + HS) as u32).to_le_bytes());
        data.extend_from_slice(&label);
        data.extend_from_slice(&group_type.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&body);
        data
    }

    fn edid(name: &str) -> Vec<u8> {
        let mut data = b"EDID".to_vec();
        data.extend_from_slice(&((name.len() + 1) as u16).to_le_bytes());
        data.extend_from_slice(name.as_bytes());
        data.push(0);
        data
    }

    fn load(bytes: &[u8], factory: &LoadFactory, defer: bool) -> Result<(Group, BTreeSet<Signature>)> {
        let mut reader = ModReader::new("Test.esp", bytes, HS);
        let header = match reader.next_header()? {
            ChunkHeader::Group(header) => header,
            ChunkHeader::Record(_) => panic!("expected group"),
        };
        let mut skipped = BTreeSet::new();
        let mut ctx = LoadContext {
            factory,
            unpack: true,
            skipped: &mut skipped,
        };
        let group = Group::load(&mut reader, header, &mut ctx, defer)?;
        Ok((group, skipped))
    }

    #[test]
    fn test_active_and_all_records() {
        let bytes = group_bytes(*b"WEAP", 0, &[
            record_bytes(b"WEAP", 0, 0x801, &edid("Sword")),
            record_bytes(b"WEAP", 0x20, 0x802, &edid("Deleted")),
            record_bytes(b"WEAP", 0x1000, 0x803, &edid("Ignored")),
        ]);
        let (group, _) = load(&bytes, &LoadFactory::new(true), false).unwrap();

        assert_eq!(group.all_records().len(), 3);
        let active = group.records();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].get_editor_id().as_deref(), Some("Sword"));
        assert_eq!(group.num_records(HS).unwrap(), 4);
        assert_eq!(group.data_size(HS).unwrap(), bytes.len());
    }

    #[test]
    fn test_selective_skips_unknown_records() {
        let bytes = group_bytes(*b"WEAP", 0, &[
            record_bytes(b"WEAP", 0, 0x801, &edid("Sword")),
            record_bytes(b"ARMO", 0, 0x802, &edid("Stray")),
        ]);
        let mut factory = LoadFactory::new(false);
        factory.add_type(Signature::new(b"WEAP"));
        let (group, skipped) = load(&bytes, &factory, false).unwrap();

        assert_eq!(group.all_records().len(), 1);
        assert!(skipped.contains(&Signature::new(b"ARMO")));
    }

    fn cell_tree() -> Vec<u8> {
        let refs = group_bytes(0x801u32.to_le_bytes(), 9, &[record_bytes(b"REFR", 0, 0x900, &edid("Chair"))]);
        let children = group_bytes(0x801u32.to_le_bytes(), 6, &[refs]);
        let sub_block = group_bytes(0u32.to_le_bytes(), 3, &[record_bytes(b"CELL", 0, 0x801, &edid("Room")), children]);
        let block = group_bytes(0u32.to_le_bytes(), 2, &[sub_block]);
        group_bytes(*b"CELL", 0, &[block])
    }

    #[test]
    fn test_hierarchy_navigation() {
        let bytes = cell_tree();
        let (group, _) = load(&bytes, &LoadFactory::new(true), false).unwrap();
        let tree = HierarchicalGroup::new(group);

        assert_eq!(tree.cells().len(), 1);
        assert_eq!(tree.references().len(), 1);
        assert_eq!(tree.references()[0].get_editor_id().as_deref(), Some("Chair"));
        // CELL顶层 + 块 + 子块 + CELL + 单元格子组 + 临时组 + REFR
        assert_eq!(tree.group().num_records(HS).unwrap(), 7);
    }

    #[test]
    fn test_deferred_blocks() {
        let bytes = cell_tree();
        let mut factory = LoadFactory::new(false);
        factory.add_type(Signature::new(b"CELL"));
        let (group, _) = load(&bytes, &factory, true).unwrap();
        let mut tree = HierarchicalGroup::new(group);

        assert_eq!(tree.deferred_blocks(), 1);
        assert!(tree.cells().is_empty());
        assert_eq!(tree.group().num_records(HS).unwrap(), 7);
        assert_eq!(tree.group().data_size(HS).unwrap(), bytes.len());

        let mut skipped = BTreeSet::new();
        let mut ctx = LoadContext {
            factory: &factory,
            unpack: true,
            skipped: &mut skipped,
        };
        assert_eq!(tree.unpack_blocks(HS, &mut ctx).unwrap(), 1);
        assert_eq!(tree.cells().len(), 1);
        assert!(skipped.contains(&Signature::new(b"REFR")));
    }

    #[test]
    fn test_inconsistent_nesting() {
        let nested_top = group_bytes(*b"WEAP", 0, &[group_bytes(*b"ARMO", 0, &[])]);
        assert!(matches!(
            load(&nested_top, &LoadFactory::new(true), false),
            Err(EspError::Format(_))
        ));

        let wrong_block = group_bytes(*b"CELL", 0, &[group_bytes(0u32.to_le_bytes(), 5, &[])]);
        assert!(matches!(
            load(&wrong_block, &LoadFactory::new(true), false),
            Err(EspError::Format(_))
        ));
    }

    #[test]
    fn test_child_overruns_parent() {
        let mut bytes = group_bytes(*b"WEAP", 0, &[record_bytes(b"WEAP", 0, 0x801, &edid("Sword"))]);
        // 父组声明比内容少 4 字节，记录越界
        let declared = (bytes.len() - 4) as u32;
        bytes[4..8].copy_from_slice(&declared.to_le_bytes());
        assert!(matches!(
            load(&bytes, &LoadFactory::new(true), false),
            Err(EspError::Format(_))
        ));
    }

    #[test]
    fn test_flat_group_set_record() {
        let bytes = group_bytes(*b"WEAP", 0, &[record_bytes(b"WEAP", 0, 0x801, &edid("Sword"))]);
        let (group, _) = load(&bytes, &LoadFactory::new(true), false).unwrap();
        let mut flat = FlatGroup::new(group);

        let mut replacement = flat.record(&FormId::Short(0x801)).unwrap().clone();
        replacement.set_editor_id("Blade").unwrap();
        flat.set_record(replacement);

        let mut appended = flat.record(&FormId::Short(0x801)).unwrap().clone();
        appended.form_id = FormId::Short(0x802);
        flat.set_record(appended);

        let records = flat.group().all_records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get_editor_id().as_deref(), Some("Blade"));
        assert_eq!(records[1].form_id, FormId::Short(0x802));
    }

    #[test]
    fn test_empty_new_group_not_counted() {
        let top = TopGroup::empty(Signature::new(b"WEAP"));
        assert_eq!(top.num_records(HS).unwrap(), 0);
        assert!(TopGroup::empty(Signature::new(b"WRLD")).as_hierarchical().is_some());
    }
}
