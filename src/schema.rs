//! 记录结构描述
//!
//! 每个签名对应一个 [`RecordSchema`] 实现：它说明负载中哪些位置是 FormID、
//! 有哪些具名属性、哪些重复子记录构成条目列表，以及效果块的布局。
//! 未知签名使用 [`OpaqueSchema`]，记录以原始字节保留。

use crate::datatypes::Signature;
use serde::Deserialize;
use std::fmt;

/// 字段类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttrKind {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    F32,
    Fid,
    /// 以null结尾的字符串（占满整个子记录）
    Zstring,
    /// 不以null结尾的文本（占满整个子记录）
    Text,
    /// 4字符代码
    Code4,
    /// 单字节中的一个标志位
    Bit,
}

impl AttrKind {
    /// 固定宽度字段的字节数；字符串类型占满子记录返回 None
    pub fn width(&self) -> Option<usize> {
        match self {
            AttrKind::U8 | AttrKind::I8 | AttrKind::Bit => Some(1),
            AttrKind::U16 | AttrKind::I16 => Some(2),
            AttrKind::U32 | AttrKind::I32 | AttrKind::F32 | AttrKind::Fid | AttrKind::Code4 => {
                Some(4)
            }
            AttrKind::Zstring | AttrKind::Text => None,
        }
    }

    pub fn is_string(&self) -> bool {
        matches!(self, AttrKind::Zstring | AttrKind::Text)
    }
}

/// 子记录内的一个字段
#[derive(Debug, Clone, Deserialize)]
pub struct FieldDef {
    pub name: String,
    #[serde(default)]
    pub offset: usize,
    pub kind: AttrKind,
    /// 仅用于 `bit`
    #[serde(default)]
    pub mask: u8,
}

/// 具名属性：某个子记录中的一个字段
#[derive(Debug, Clone, Deserialize)]
pub struct AttrDef {
    pub sub: Signature,
    /// 同签名子记录中的第几个
    #[serde(default)]
    pub occurrence: usize,
    #[serde(flatten)]
    pub field: FieldDef,
}

/// FormID 在负载中的位置
#[derive(Debug, Clone, Deserialize)]
pub struct FidField {
    pub sub: Signature,
    #[serde(default = "default_offsets")]
    pub offsets: Vec<usize>,
    /// 设置时按步长重复直到子记录末尾（FormID 数组）
    #[serde(default)]
    pub stride: Option<usize>,
}

fn default_offsets() -> Vec<usize> {
    vec![0]
}

impl FidField {
    /// 给定子记录长度时的全部偏移
    pub fn offsets_in(&self, len: usize) -> Vec<usize> {
        let mut result = Vec::new();
        for &offset in &self.offsets {
            match self.stride {
                Some(stride) if stride > 0 => {
                    let mut at = offset;
                    while at + 4 <= len {
                        result.push(at);
                        at += stride;
                    }
                }
                _ => {
                    if offset + 4 <= len {
                        result.push(offset);
                    }
                }
            }
        }
        result
    }
}

/// 重复子记录组成的条目列表（如阵营成员、阵营关系）
#[derive(Debug, Clone, Deserialize)]
pub struct EntryListDef {
    pub name: String,
    pub sub: Signature,
    /// 新条目的字节模板（十六进制）
    pub template: String,
    pub fields: Vec<FieldDef>,
}

impl EntryListDef {
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// 效果列表布局
#[derive(Debug, Clone, Deserialize)]
pub struct EffectsDef {
    /// 每个效果的起始子记录（其数据即效果代码）
    pub start: Signature,
    /// 与起始子记录同步写入的代码字段名
    pub code_field: String,
    pub data: Signature,
    pub data_template: String,
    pub data_fields: Vec<FieldDef>,
    pub script: Signature,
    pub script_template: String,
    pub script_fields: Vec<FieldDef>,
    pub script_name: Signature,
}

impl EffectsDef {
    pub fn is_member(&self, sig: Signature) -> bool {
        sig == self.start || sig == self.data || sig == self.script || sig == self.script_name
    }
}

/// 每个记录签名的结构接口
pub trait RecordSchema: fmt::Debug + Send + Sync {
    fn signature(&self) -> Signature;

    /// 未描述的记录：只保留原始字节
    fn is_opaque(&self) -> bool {
        false
    }

    fn fid_fields(&self) -> &[FidField] {
        &[]
    }

    fn attrs(&self) -> &[AttrDef] {
        &[]
    }

    fn attr(&self, name: &str) -> Option<&AttrDef> {
        self.attrs().iter().find(|a| a.field.name == name)
    }

    fn entry_lists(&self) -> &[EntryListDef] {
        &[]
    }

    fn entry_list(&self, name: &str) -> Option<&EntryListDef> {
        self.entry_lists().iter().find(|l| l.name == name)
    }

    fn effects(&self) -> Option<&EffectsDef> {
        None
    }

    /// 参与编辑器ID替换的文本子记录
    fn text_fields(&self) -> &[Signature] {
        &[]
    }
}

/// 默认的不透明结构
#[derive(Debug, Clone)]
pub struct OpaqueSchema {
    signature: Signature,
}

impl OpaqueSchema {
    pub fn new(signature: Signature) -> Self {
        OpaqueSchema { signature }
    }
}

impl RecordSchema for OpaqueSchema {
    fn signature(&self) -> Signature {
        self.signature
    }

    fn is_opaque(&self) -> bool {
        true
    }
}

/// 由游戏描述文件定义的结构
#[derive(Debug, Clone, Deserialize)]
pub struct DescribedSchema {
    pub signature: Signature,
    #[serde(default)]
    pub fids: Vec<FidField>,
    #[serde(default)]
    pub attrs: Vec<AttrDef>,
    #[serde(default)]
    pub lists: Vec<EntryListDef>,
    #[serde(default)]
    pub effects: Option<EffectsDef>,
    #[serde(default)]
    pub text_fields: Vec<Signature>,
}

impl RecordSchema for DescribedSchema {
    fn signature(&self) -> Signature {
        self.signature
    }

    fn fid_fields(&self) -> &[FidField] {
        &self.fids
    }

    fn attrs(&self) -> &[AttrDef] {
        &self.attrs
    }

    fn entry_lists(&self) -> &[EntryListDef] {
        &self.lists
    }

    fn effects(&self) -> Option<&EffectsDef> {
        self.effects.as_ref()
    }

    fn text_fields(&self) -> &[Signature] {
        &self.text_fields
    }
}

/// 解析十六进制模板（允许空格）
pub fn parse_template(template: &str) -> Option<Vec<u8>> {
    let digits: Vec<u8> = template.bytes().filter(|b| !b.is_ascii_whitespace()).collect();
    if digits.len() % 2 != 0 {
        return None;
    }
    digits
        .chunks(2)
        .map(|pair| {
            let text = std::str::from_utf8(pair).ok()?;
            u8::from_str_radix(text, 16).ok()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fid_field_offsets() {
        let single = FidField {
            sub: Signature::new(b"SCRI"),
            offsets: vec![0],
            stride: None,
        };
        assert_eq!(single.offsets_in(4), vec![0]);
        assert!(single.offsets_in(2).is_empty());

        let array = FidField {
            sub: Signature::new(b"SPLO"),
            offsets: vec![0],
            stride: Some(4),
        };
        assert_eq!(array.offsets_in(12), vec![0, 4, 8]);
    }

    #[test]
    fn test_parse_template() {
        assert_eq!(parse_template("00 4F44 42"), Some(vec![0, 0x4F, 0x44, 0x42]));
        assert_eq!(parse_template("0"), None);
        assert_eq!(parse_template("zz"), None);
    }

    #[test]
    fn test_described_schema_json() {
        let json = r#"{
            "signature": "FACT",
            "fids": [{"sub": "XNAM"}],
            "attrs": [{"name": "full", "sub": "FULL", "kind": "zstring"}],
            "lists": [{
                "name": "relations",
                "sub": "XNAM",
                "template": "00000000 00000000",
                "fields": [
                    {"name": "faction", "offset": 0, "kind": "fid"},
                    {"name": "mod", "offset": 4, "kind": "i32"}
                ]
            }]
        }"#;
        let schema: DescribedSchema = serde_json::from_str(json).unwrap();
        assert_eq!(schema.fid_fields()[0].offsets, vec![0]);
        assert_eq!(schema.attr("full").unwrap().field.kind, AttrKind::Zstring);
        assert_eq!(schema.entry_list("relations").unwrap().fields.len(), 2);
        assert!(!schema.is_opaque());
        assert!(OpaqueSchema::new(Signature::new(b"STAT")).is_opaque());
    }
}
