//! FormID 的两种编码以及主文件列表之间的映射。
//!
//! 短格式是文件内部的 32 位整数：高 8 位是主文件列表中的槽位，低 24 位是对象索引。
//! 长格式是 (所属文件名, 对象索引)，不依赖任何一个文件的主文件顺序，
//! 只有长格式可以跨文件比较或持久化。

use crate::utils::{EspError, Result};
use std::cell::Cell;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use tracing::warn;

/// 低位保留区间的上界（引擎硬编码对象）
pub const RESERVED_OBJECT_LIMIT: u32 = 0x800;

const OBJECT_MASK: u32 = 0x00FF_FFFF;

/// 插件文件名（大小写不敏感）
#[derive(Clone, Default)]
pub struct ModName {
    name: String,
    key: String,
}

impl ModName {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let key = name.to_lowercase();
        ModName { name, key }
    }

    pub fn as_str(&self) -> &str {
        &self.name
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
    }

    /// 是否为 .esm 主文件
    pub fn is_esm(&self) -> bool {
        self.key.ends_with(".esm")
    }
}

impl PartialEq for ModName {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for ModName {}

impl Hash for ModName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl PartialOrd for ModName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ModName {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

impl fmt::Display for ModName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl fmt::Debug for ModName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.name)
    }
}

impl From<&str> for ModName {
    fn from(value: &str) -> Self {
        ModName::new(value)
    }
}

impl From<String> for ModName {
    fn from(value: String) -> Self {
        ModName::new(value)
    }
}

/// 长格式 FormID
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct LongFid {
    pub master: ModName,
    pub object: u32,
}

impl LongFid {
    pub fn new(master: impl Into<ModName>, object: u32) -> Self {
        LongFid {
            master: master.into(),
            object: object & OBJECT_MASK,
        }
    }

    /// 空标识：空文件名 + 0
    pub fn null() -> Self {
        LongFid::default()
    }

    pub fn is_null(&self) -> bool {
        self.master.is_empty() && self.object == 0
    }
}

impl fmt::Display for LongFid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:0x{:06X}", self.master, self.object)
    }
}

/// FormID（短格式或长格式）
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum FormId {
    Short(u32),
    Long(LongFid),
}

impl FormId {
    pub fn null_short() -> Self {
        FormId::Short(0)
    }

    pub fn is_null(&self) -> bool {
        match self {
            FormId::Short(value) => *value == 0,
            FormId::Long(fid) => fid.is_null(),
        }
    }

    pub fn short(&self) -> Option<u32> {
        match self {
            FormId::Short(value) => Some(*value),
            FormId::Long(_) => None,
        }
    }

    pub fn long(&self) -> Option<&LongFid> {
        match self {
            FormId::Long(fid) => Some(fid),
            FormId::Short(_) => None,
        }
    }

    pub fn form(&self) -> FidForm {
        match self {
            FormId::Short(_) => FidForm::Short,
            FormId::Long(_) => FidForm::Long,
        }
    }

    /// 要求长格式，否则返回状态错误
    pub fn expect_long(&self) -> Result<&LongFid> {
        self.long()
            .ok_or_else(|| EspError::state(format!("FormID {} 不是长格式", self)))
    }
}

impl fmt::Display for FormId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormId::Short(value) => write!(f, "0x{:08X}", value),
            FormId::Long(fid) => write!(f, "{}", fid),
        }
    }
}

impl From<LongFid> for FormId {
    fn from(value: LongFid) -> Self {
        FormId::Long(value)
    }
}

/// 内存中FormID的当前编码
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FidForm {
    Short,
    Long,
}

impl fmt::Display for FidForm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FidForm::Short => f.write_str("short"),
            FidForm::Long => f.write_str("long"),
        }
    }
}

/// FormID 转换函数
///
/// 记录树中每一个标识字段都会经过同一个实现，
/// 因此长短转换、跨文件映射和批量替换共用一套遍历代码。
pub trait MapFid {
    fn map_fid(&self, fid: &FormId) -> Result<FormId>;
}

/// 短格式 → 长格式
#[derive(Debug)]
pub struct LongMapper {
    masters: Vec<ModName>,
    repairs: Cell<usize>,
}

impl LongMapper {
    /// `masters` 为文件的主文件列表，`own` 为文件自身（隐式追加在末尾）
    pub fn new(masters: &[ModName], own: &ModName) -> Self {
        let mut all = masters.to_vec();
        all.push(own.clone());
        LongMapper {
            masters: all,
            repairs: Cell::new(0),
        }
    }

    pub fn map_short(&self, short: u32) -> LongFid {
        if short == 0 {
            return LongFid::null();
        }
        let slot = (short >> 24) as usize;
        let last = self.masters.len() - 1;
        let index = if slot > last {
            // 槽位越界：按最后一个槽位处理，并记为有损修复
            self.repairs.set(self.repairs.get() + 1);
            warn!(
                "FormID 0x{:08X} 的主文件槽位 {} 超出列表长度 {}，按 {} 处理",
                short,
                slot,
                self.masters.len(),
                self.masters[last]
            );
            last
        } else {
            slot
        };
        LongFid::new(self.masters[index].clone(), short)
    }

    /// 已发生的越界槽位修复次数
    pub fn repairs(&self) -> usize {
        self.repairs.get()
    }
}

impl MapFid for LongMapper {
    fn map_fid(&self, fid: &FormId) -> Result<FormId> {
        Ok(match fid {
            FormId::Short(short) => FormId::Long(self.map_short(*short)),
            FormId::Long(_) => fid.clone(),
        })
    }
}

/// 长格式 → 短格式
#[derive(Debug)]
pub struct ShortMapper {
    indices: HashMap<ModName, u32>,
    pin_reserved_range: bool,
}

impl ShortMapper {
    /// `expanded_range` 为 true 时，保留区间不固定到槽位 0
    pub fn new(masters: &[ModName], own: &ModName, expanded_range: bool) -> Self {
        let mut indices = HashMap::new();
        for (index, name) in masters.iter().chain(std::iter::once(own)).enumerate() {
            indices.insert(name.clone(), index as u32);
        }
        ShortMapper {
            indices,
            pin_reserved_range: !(expanded_range && !masters.is_empty()),
        }
    }

    pub fn map_long(&self, fid: &LongFid) -> Result<u32> {
        if fid.is_null() {
            return Ok(0);
        }
        if self.pin_reserved_range && fid.object < RESERVED_OBJECT_LIMIT {
            return Ok(fid.object);
        }
        let index = self
            .indices
            .get(&fid.master)
            .ok_or_else(|| EspError::MissingMaster(fid.master.to_string()))?;
        Ok((index << 24) | fid.object)
    }
}

impl MapFid for ShortMapper {
    fn map_fid(&self, fid: &FormId) -> Result<FormId> {
        Ok(match fid {
            FormId::Long(long) => FormId::Short(self.map_long(long)?),
            FormId::Short(_) => fid.clone(),
        })
    }
}

/// 两个主文件列表之间的短格式映射表
///
/// 按文件名比较两个列表，得到输入槽位到输出槽位的映射。
#[derive(Debug, Clone)]
pub struct MasterMap {
    map: Vec<Option<u32>>,
}

impl MasterMap {
    pub fn new(in_masters: &[ModName], out_masters: &[ModName]) -> Self {
        let map = in_masters
            .iter()
            .map(|name| {
                out_masters
                    .iter()
                    .position(|out| out == name)
                    .map(|index| index as u32)
            })
            .collect();
        MasterMap { map }
    }

    /// 映射一个短格式FormID；没有对应主文件时返回 `default` 或错误
    pub fn map(&self, fid: u32, default: Option<u32>) -> Result<u32> {
        if fid == 0 {
            return Ok(fid);
        }
        let in_index = (fid >> 24) as usize;
        match self.map.get(in_index).copied().flatten() {
            Some(out_index) => Ok((out_index << 24) | (fid & OBJECT_MASK)),
            None => default.ok_or(EspError::MasterMap(in_index)),
        }
    }

    /// 所有输入槽位都有对应项
    pub fn is_total(&self) -> bool {
        self.map.iter().all(Option::is_some)
    }
}

impl MapFid for MasterMap {
    fn map_fid(&self, fid: &FormId) -> Result<FormId> {
        match fid {
            FormId::Short(short) => Ok(FormId::Short(self.map(*short, None)?)),
            FormId::Long(_) => Ok(fid.clone()),
        }
    }
}

/// 被引用的主文件集合
#[derive(Debug, Clone, Default)]
pub struct MasterSet {
    names: HashSet<ModName>,
}

impl MasterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: &ModName) {
        if !name.is_empty() {
            self.names.insert(name.clone());
        }
    }

    pub fn add_fid(&mut self, fid: &FormId) {
        if let FormId::Long(long) = fid {
            self.add(&long.master);
        }
    }

    pub fn contains(&self, name: &ModName) -> bool {
        self.names.contains(name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// 按加载顺序排列；不在加载顺序中的名称按名称排在最后
    pub fn ordered(&self, load_order: &[ModName]) -> Vec<ModName> {
        let mut result: Vec<ModName> = load_order
            .iter()
            .filter(|name| self.names.contains(*name))
            .cloned()
            .collect();
        let mut rest: Vec<ModName> = self
            .names
            .iter()
            .filter(|name| !load_order.contains(name))
            .cloned()
            .collect();
        rest.sort();
        result.extend(rest);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<ModName> {
        list.iter().map(|n| ModName::new(*n)).collect()
    }

    #[test]
    fn test_mod_name_case_insensitive() {
        assert_eq!(ModName::new("Oblivion.esm"), ModName::new("oblivion.ESM"));
        assert!(ModName::new("A.esm").is_esm());
        assert!(!ModName::new("A.esp").is_esm());
    }

    #[test]
    fn test_long_mapper_slots() {
        let masters = names(&["A.esm", "B.esm"]);
        let own = ModName::new("F.esp");
        let mapper = LongMapper::new(&masters, &own);

        assert_eq!(mapper.map_short(0x0000_1234), LongFid::new("A.esm", 0x1234));
        assert_eq!(mapper.map_short(0x0100_0900), LongFid::new("B.esm", 0x900));
        assert_eq!(mapper.map_short(0x0200_0801), LongFid::new("F.esp", 0x801));
        assert_eq!(mapper.repairs(), 0);
    }

    #[test]
    fn test_long_mapper_clamp_is_counted() {
        let masters = names(&["A.esm"]);
        let own = ModName::new("F.esp");
        let mapper = LongMapper::new(&masters, &own);

        assert_eq!(mapper.map_short(0x0700_0900), LongFid::new("F.esp", 0x900));
        assert_eq!(mapper.repairs(), 1);
    }

    #[test]
    fn test_identity_law() {
        let masters = names(&["A.esm", "B.esm", "C.esp"]);
        let own = ModName::new("F.esp");
        let to_long = LongMapper::new(&masters, &own);

        for expanded in [false, true] {
            let to_short = ShortMapper::new(&masters, &own, expanded);
            for owner in masters.iter().chain(std::iter::once(&own)) {
                for object in [0x800, 0x1234, 0xFF_FFFF] {
                    let fid = LongFid::new(owner.clone(), object);
                    let short = to_short.map_long(&fid).unwrap();
                    assert_eq!(to_long.map_short(short), fid);
                }
            }
        }
    }

    #[test]
    fn test_long_form_survives_master_insertion() {
        let own = ModName::new("F.esp");
        let fid = LongFid::new("A.esm", 0x001234);

        let before = ShortMapper::new(&names(&["A.esm", "B.esm"]), &own, false);
        assert_eq!(before.map_long(&fid).unwrap(), 0x001234);

        let after = ShortMapper::new(&names(&["A.esm", "C.esm", "B.esm"]), &own, false);
        assert_eq!(after.map_long(&fid).unwrap(), 0x001234);
        assert_eq!(
            after.map_long(&LongFid::new("B.esm", 0x001234)).unwrap(),
            0x0200_1234
        );
    }

    #[test]
    fn test_reserved_range_pinned_to_slot_zero() {
        let masters = names(&["A.esm", "B.esm"]);
        let own = ModName::new("F.esp");

        let pinned = ShortMapper::new(&masters, &own, false);
        assert_eq!(pinned.map_long(&LongFid::new("B.esm", 0x14)).unwrap(), 0x14);

        let expanded = ShortMapper::new(&masters, &own, true);
        assert_eq!(
            expanded.map_long(&LongFid::new("B.esm", 0x14)).unwrap(),
            0x0100_0014
        );

        // 没有主文件时扩展区间不生效
        let alone = ShortMapper::new(&[], &own, true);
        assert_eq!(alone.map_long(&LongFid::new("F.esp", 0x14)).unwrap(), 0x14);
    }

    #[test]
    fn test_short_mapper_unknown_owner() {
        let masters = names(&["A.esm"]);
        let mapper = ShortMapper::new(&masters, &ModName::new("F.esp"), false);
        let err = mapper.map_long(&LongFid::new("Z.esm", 0x900)).unwrap_err();
        assert!(matches!(err, EspError::MissingMaster(name) if name == "Z.esm"));
    }

    #[test]
    fn test_null_identity() {
        let masters = names(&["A.esm"]);
        let own = ModName::new("F.esp");
        let to_long = LongMapper::new(&masters, &own);
        let to_short = ShortMapper::new(&masters, &own, false);

        assert_eq!(to_long.map_short(0), LongFid::null());
        assert_eq!(to_short.map_long(&LongFid::null()).unwrap(), 0);

        let map = MasterMap::new(&names(&["X.esm"]), &names(&["Y.esm"]));
        assert_eq!(map.map(0, None).unwrap(), 0);
    }

    #[test]
    fn test_master_map_totality() {
        let a = names(&["A.esm", "B.esm", "F.esp"]);
        let b = names(&["B.esm", "Q.esm", "A.esm", "F.esp", "G.esp"]);
        let map = MasterMap::new(&a, &b);
        assert!(map.is_total());

        for slot in 0..a.len() as u32 {
            for object in [0x1, 0x800, 0xABCDEF] {
                let fid = (slot << 24) | object;
                let mapped = map.map(fid, None).unwrap();
                assert_eq!(b[(mapped >> 24) as usize], a[slot as usize]);
                assert_eq!(mapped & OBJECT_MASK, object);
            }
        }
    }

    #[test]
    fn test_master_map_missing() {
        let map = MasterMap::new(&names(&["A.esm", "B.esm"]), &names(&["A.esm"]));
        assert_eq!(map.map(0x0000_0900, None).unwrap(), 0x0000_0900);
        assert!(matches!(map.map(0x0100_0900, None), Err(EspError::MasterMap(1))));
        assert_eq!(map.map(0x0100_0900, Some(0x7)).unwrap(), 0x7);
    }

    #[test]
    fn test_master_set_ordering() {
        let mut set = MasterSet::new();
        set.add(&ModName::new("b.esp"));
        set.add(&ModName::new("A.esm"));
        set.add(&ModName::new("Unlisted.esp"));
        set.add(&ModName::new(""));

        let order = names(&["A.esm", "C.esm", "B.esp"]);
        assert_eq!(set.ordered(&order), names(&["A.esm", "B.esp", "Unlisted.esp"]));
    }
}
