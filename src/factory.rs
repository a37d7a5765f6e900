use crate::datatypes::Signature;
use crate::schema::{OpaqueSchema, RecordSchema};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// 世界/单元格层级中的记录类型
pub const CELL_TYPES: &[&[u8; 4]] = &[
    b"WRLD", b"ROAD", b"CELL", b"REFR", b"ACHR", b"ACRE", b"PGRD", b"LAND",
    b"PGRE", b"PMIS", b"PHZD", b"PARW", b"PBAR", b"PBEA", b"PCON", b"PFLA", b"NAVM",
];

/// 需要解包单元格块才能访问的类型
const BLOCK_CONTENT_TYPES: &[&[u8; 4]] = &[
    b"REFR", b"ACHR", b"ACRE", b"PGRD", b"LAND",
    b"PGRE", b"PMIS", b"PHZD", b"PARW", b"PBAR", b"PBEA", b"PCON", b"PFLA", b"NAVM",
];

fn is_cell_type(sig: Signature) -> bool {
    CELL_TYPES.iter().any(|t| **t == sig.0)
}

/// 顶层组的加载方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopKind {
    /// 只保留字节范围
    Raw,
    /// 记录平铺（DIAL 下可含话题子组）
    Flat,
    /// 世界/单元格层级
    Hierarchical,
}

/// 记录工厂：签名 → 结构
///
/// 选择模式只解码登记过的签名，其余顶层组整体跳过；
/// 全保留模式下任何签名都至少按不透明记录保存，用于需要重新保存的文件。
#[derive(Debug, Clone)]
pub struct LoadFactory {
    keep_all: bool,
    schemas: HashMap<Signature, Arc<dyn RecordSchema>>,
    rec_types: BTreeSet<Signature>,
    top_types: BTreeSet<Signature>,
}

impl LoadFactory {
    pub fn new(keep_all: bool) -> Self {
        LoadFactory {
            keep_all,
            schemas: HashMap::new(),
            rec_types: BTreeSet::new(),
            top_types: BTreeSet::new(),
        }
    }

    pub fn is_keep_all(&self) -> bool {
        self.keep_all
    }

    /// 登记结构
    ///
    /// 具体结构会替换不透明结构；不透明结构永远不会替换具体结构。
    pub fn add_schema(&mut self, schema: Arc<dyn RecordSchema>) {
        let sig = schema.signature();
        let keep_existing = matches!(
            self.schemas.get(&sig),
            Some(existing) if !existing.is_opaque() && schema.is_opaque()
        );
        if !keep_existing {
            self.schemas.insert(sig, schema);
        }
        self.register_interest(sig);
    }

    /// 按不透明结构登记一个签名
    pub fn add_type(&mut self, sig: Signature) {
        self.add_schema(Arc::new(OpaqueSchema::new(sig)));
    }

    fn register_interest(&mut self, sig: Signature) {
        self.rec_types.insert(sig);
        if is_cell_type(sig) {
            self.top_types.insert(Signature::new(b"CELL"));
            self.top_types.insert(Signature::new(b"WRLD"));
            if self.keep_all {
                for cell_type in CELL_TYPES {
                    let cell_sig = Signature::new(cell_type);
                    self.schemas
                        .entry(cell_sig)
                        .or_insert_with(|| Arc::new(OpaqueSchema::new(cell_sig)));
                }
            }
        } else if sig == Signature::new(b"INFO") {
            self.top_types.insert(Signature::new(b"DIAL"));
        } else {
            self.top_types.insert(sig);
        }
    }

    /// 签名对应的结构；选择模式下未登记的签名返回 None
    pub fn class_for(&self, sig: Signature) -> Option<Arc<dyn RecordSchema>> {
        match self.schemas.get(&sig) {
            Some(schema) => Some(Arc::clone(schema)),
            None if self.keep_all => Some(Arc::new(OpaqueSchema::new(sig))),
            None => None,
        }
    }

    /// 顶层组的加载方式；选择模式下不感兴趣的组返回 None（跳过）
    pub fn top_kind(&self, label: Signature) -> Option<TopKind> {
        if self.top_types.contains(&label) {
            if label == Signature::new(b"CELL") || label == Signature::new(b"WRLD") {
                Some(TopKind::Hierarchical)
            } else {
                Some(TopKind::Flat)
            }
        } else if self.keep_all {
            Some(TopKind::Raw)
        } else {
            None
        }
    }

    /// 是否立即解包单元格块
    pub fn unpack_cell_blocks(&self) -> bool {
        self.keep_all
            || BLOCK_CONTENT_TYPES
                .iter()
                .any(|t| self.rec_types.contains(&Signature::new(t)))
            || (self.rec_types.contains(&Signature::new(b"WRLD"))
                && self.rec_types.contains(&Signature::new(b"LAND")))
    }

    pub fn rec_types(&self) -> &BTreeSet<Signature> {
        &self.rec_types
    }

    pub fn top_types(&self) -> &BTreeSet<Signature> {
        &self.top_types
    }
}
