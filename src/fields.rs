//! 按结构描述读写记录字段。

use crate::datatypes::{RawString, Signature};
use crate::form_id::FormId;
use crate::record::Record;
use crate::schema::{parse_template, AttrKind, EffectsDef, EntryListDef, FieldDef, RecordSchema};
use crate::subrecord::Subrecord;
use crate::utils::{EspError, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// 字段值
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Int(i64),
    Float(f32),
    Str(String),
    Fid(FormId),
    Bool(bool),
}

impl AttrValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            AttrValue::Int(v) => Some(*v),
            AttrValue::Bool(v) => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f32> {
        match self {
            AttrValue::Float(v) => Some(*v),
            AttrValue::Int(v) => Some(*v as f32),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_fid(&self) -> Option<&FormId> {
        match self {
            AttrValue::Fid(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttrValue::Bool(v) => Some(*v),
            AttrValue::Int(v) => Some(*v != 0),
            _ => None,
        }
    }

    /// 按字段类型解析文本（表格导入）
    pub fn parse(kind: AttrKind, text: &str) -> Option<AttrValue> {
        let text = text.trim();
        match kind {
            AttrKind::U8
            | AttrKind::I8
            | AttrKind::U16
            | AttrKind::I16
            | AttrKind::U32
            | AttrKind::I32 => text
                .parse::<i64>()
                .ok()
                .or_else(|| text.parse::<f64>().ok().map(|f| f as i64))
                .map(AttrValue::Int),
            AttrKind::F32 => text.parse::<f32>().ok().map(AttrValue::Float),
            AttrKind::Bit => match text.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Some(AttrValue::Bool(true)),
                "false" | "0" | "no" | "" => Some(AttrValue::Bool(false)),
                _ => None,
            },
            AttrKind::Zstring | AttrKind::Text | AttrKind::Code4 => {
                Some(AttrValue::Str(text.to_string()))
            }
            AttrKind::Fid => None,
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Int(v) => write!(f, "{}", v),
            AttrValue::Float(v) => write!(f, "{:.6}", v),
            AttrValue::Str(v) => f.write_str(v),
            AttrValue::Fid(v) => write!(f, "{}", v),
            AttrValue::Bool(true) => f.write_str("True"),
            AttrValue::Bool(false) => f.write_str("False"),
        }
    }
}

/// 条目列表中的一项
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ListEntry {
    pub values: BTreeMap<String, AttrValue>,
}

impl ListEntry {
    pub fn get(&self, field: &str) -> Option<&AttrValue> {
        self.values.get(field)
    }
}

/// 脚本效果附加块
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScriptEffect {
    pub values: BTreeMap<String, AttrValue>,
    pub name: String,
}

/// 一个魔法效果
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Effect {
    pub values: BTreeMap<String, AttrValue>,
    pub script: Option<ScriptEffect>,
}

impl Effect {
    pub fn get(&self, field: &str) -> Option<&AttrValue> {
        self.values.get(field)
    }
}

fn field_bytes<'a>(sub: &'a Subrecord, field: &FieldDef, width: usize) -> Result<&'a [u8]> {
    let at = field.offset;
    sub.data.get(at..at + width).ok_or_else(|| {
        EspError::schema(format!(
            "子记录 {} 字段 {} 越界（偏移 {}，长度 {}）",
            sub.record_type,
            field.name,
            at,
            sub.data.len()
        ))
    })
}

fn read_field(sub: &Subrecord, field: &FieldDef) -> Result<AttrValue> {
    let data = &sub.data;
    let at = field.offset;
    let slice = |width: usize| field_bytes(sub, field, width);

    Ok(match field.kind {
        AttrKind::U8 => AttrValue::Int(slice(1)?[0] as i64),
        AttrKind::I8 => AttrValue::Int(slice(1)?[0] as i8 as i64),
        AttrKind::U16 => {
            let b = slice(2)?;
            AttrValue::Int(u16::from_le_bytes([b[0], b[1]]) as i64)
        }
        AttrKind::I16 => {
            let b = slice(2)?;
            AttrValue::Int(i16::from_le_bytes([b[0], b[1]]) as i64)
        }
        AttrKind::U32 => {
            let b = slice(4)?;
            AttrValue::Int(u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as i64)
        }
        AttrKind::I32 => {
            let b = slice(4)?;
            AttrValue::Int(i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as i64)
        }
        AttrKind::F32 => {
            let b = slice(4)?;
            AttrValue::Float(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        }
        AttrKind::Fid => AttrValue::Fid(sub.fid_at(at)?),
        AttrKind::Code4 => {
            let b = slice(4)?;
            let end = b.iter().position(|&c| c == 0).unwrap_or(4);
            AttrValue::Str(b[..end].iter().map(|&c| c as char).collect())
        }
        AttrKind::Bit => AttrValue::Bool(slice(1)?[0] & field.mask != 0),
        AttrKind::Zstring | AttrKind::Text => {
            AttrValue::Str(RawString::parse_zstring(data.get(at..).unwrap_or(&[])).content)
        }
    })
}

fn int_in_range(field: &FieldDef, value: &AttrValue, min: i64, max: i64) -> Result<i64> {
    let v = value
        .as_int()
        .ok_or_else(|| EspError::schema(format!("字段 {} 需要整数，得到 {:?}", field.name, value)))?;
    if v < min || v > max {
        return Err(EspError::schema(format!(
            "字段 {} 的值 {} 超出范围 [{}, {}]",
            field.name, v, min, max
        )));
    }
    Ok(v)
}

/// 写入字段，返回字节是否变化
fn write_field(sub: &mut Subrecord, field: &FieldDef, value: &AttrValue) -> Result<bool> {
    let at = field.offset;

    let bytes: Vec<u8> = match field.kind {
        AttrKind::Fid => {
            let fid = value
                .as_fid()
                .ok_or_else(|| EspError::schema(format!("字段 {} 需要FormID", field.name)))?;
            return sub.set_fid_at(at, fid.clone());
        }
        AttrKind::U8 => vec![int_in_range(field, value, 0, u8::MAX as i64)? as u8],
        AttrKind::I8 => vec![int_in_range(field, value, i8::MIN as i64, i8::MAX as i64)? as i8 as u8],
        AttrKind::U16 => (int_in_range(field, value, 0, u16::MAX as i64)? as u16).to_le_bytes().to_vec(),
        AttrKind::I16 => (int_in_range(field, value, i16::MIN as i64, i16::MAX as i64)? as i16)
            .to_le_bytes()
            .to_vec(),
        AttrKind::U32 => (int_in_range(field, value, 0, u32::MAX as i64)? as u32).to_le_bytes().to_vec(),
        AttrKind::I32 => (int_in_range(field, value, i32::MIN as i64, i32::MAX as i64)? as i32)
            .to_le_bytes()
            .to_vec(),
        AttrKind::F32 => value
            .as_float()
            .ok_or_else(|| EspError::schema(format!("字段 {} 需要浮点数", field.name)))?
            .to_le_bytes()
            .to_vec(),
        AttrKind::Code4 => {
            let text = value
                .as_str()
                .ok_or_else(|| EspError::schema(format!("字段 {} 需要4字符代码", field.name)))?;
            let mut code = [0u8; 4];
            for (slot, ch) in code.iter_mut().zip(text.chars()) {
                *slot = u8::try_from(ch as u32).unwrap_or(b'?');
            }
            code.to_vec()
        }
        AttrKind::Bit => {
            let on = value
                .as_bool()
                .ok_or_else(|| EspError::schema(format!("字段 {} 需要布尔值", field.name)))?;
            let current = *sub.data.get(at).ok_or_else(|| {
                EspError::schema(format!("子记录 {} 字段 {} 越界", sub.record_type, field.name))
            })?;
            vec![if on { current | field.mask } else { current & !field.mask }]
        }
        AttrKind::Zstring | AttrKind::Text => {
            let text = value
                .as_str()
                .ok_or_else(|| EspError::schema(format!("字段 {} 需要字符串", field.name)))?;
            let mut data = sub.data[..at.min(sub.data.len())].to_vec();
            if field.kind == AttrKind::Zstring {
                data.extend(RawString::encode_zstring(text));
            } else {
                data.extend(RawString::encode(text));
            }
            let changed = data != sub.data;
            sub.data = data;
            return Ok(changed);
        }
    };

    let end = at + bytes.len();
    if end > sub.data.len() {
        return Err(EspError::schema(format!(
            "子记录 {} 字段 {} 越界（偏移 {}，长度 {}）",
            sub.record_type,
            field.name,
            at,
            sub.data.len()
        )));
    }
    let changed = sub.data[at..end] != bytes[..];
    sub.data[at..end].copy_from_slice(&bytes);
    Ok(changed)
}

/// 顶层属性的搜索范围：效果块之前
fn section_end(subrecords: &[Subrecord], schema: &dyn RecordSchema) -> usize {
    match schema.effects() {
        Some(effects) => subrecords
            .iter()
            .position(|sr| sr.record_type == effects.start)
            .unwrap_or(subrecords.len()),
        None => subrecords.len(),
    }
}

/// 新子记录的插入位置
fn insert_position(subrecords: &[Subrecord], schema: &dyn RecordSchema, sig: Signature) -> usize {
    if sig == Signature::EDID {
        return 0;
    }
    if sig == Signature::FULL {
        if let Some(pos) = subrecords.iter().position(|sr| sr.record_type == Signature::EDID) {
            return pos + 1;
        }
        return 0;
    }
    section_end(subrecords, schema)
}

fn template_bytes(template: &str, what: &str) -> Result<Vec<u8>> {
    parse_template(template).ok_or_else(|| EspError::schema(format!("{} 的字节模板无效: {:?}", what, template)))
}

impl Record {
    fn schema_arc(&self) -> Arc<dyn RecordSchema> {
        Arc::clone(self.schema())
    }

    /// 读取具名属性；子记录不存在时返回 None
    pub fn attr(&self, name: &str) -> Result<Option<AttrValue>> {
        let schema = self.schema_arc();
        let def = schema.attr(name).ok_or_else(|| {
            EspError::schema(format!("{} 没有属性 {}", self.record_type, name))
        })?;
        let subrecords = self.subrecords()?;
        let end = section_end(&subrecords, schema.as_ref());
        match subrecords[..end]
            .iter()
            .filter(|sr| sr.record_type == def.sub)
            .nth(def.occurrence)
        {
            Some(sub) => Ok(Some(read_field(sub, &def.field)?)),
            None => Ok(None),
        }
    }

    pub fn has_attr(&self, name: &str) -> bool {
        self.schema().attr(name).is_some()
    }

    /// 设置具名属性，返回是否有变化
    ///
    /// 字符串属性的子记录不存在时会新建；数值属性要求子记录已存在。
    pub fn set_attr(&mut self, name: &str, value: &AttrValue) -> Result<bool> {
        let schema = self.schema_arc();
        let def = schema.attr(name).ok_or_else(|| {
            EspError::schema(format!("{} 没有属性 {}", self.record_type, name))
        })?;
        let record_type = self.record_type;
        let form_id = self.form_id.clone();
        let subrecords = self.subrecords_mut()?;
        let end = section_end(subrecords, schema.as_ref());

        let index = subrecords[..end]
            .iter()
            .enumerate()
            .filter(|(_, sr)| sr.record_type == def.sub)
            .nth(def.occurrence)
            .map(|(i, _)| i);

        let index = match index {
            Some(index) => index,
            None if def.field.kind.is_string() && def.occurrence == 0 => {
                let pos = insert_position(subrecords, schema.as_ref(), def.sub);
                subrecords.insert(pos, Subrecord::new(def.sub, Vec::new()));
                pos
            }
            None => {
                return Err(EspError::schema(format!(
                    "{} {} 缺少子记录 {}",
                    record_type, form_id, def.sub
                )))
            }
        };

        let changed = write_field(&mut subrecords[index], &def.field, value)?;
        if changed {
            self.mark_modified();
        }
        Ok(changed)
    }

    /// 显示名称：优先使用结构中的 `full` 属性，否则取第一个 FULL 子记录
    pub fn full_name(&self) -> Result<Option<String>> {
        if self.has_attr("full") {
            return Ok(self.attr("full")?.and_then(|v| v.as_str().map(str::to_string)));
        }
        Ok(self
            .find_subrecord(Signature::FULL)?
            .map(|sr| RawString::parse_zstring(&sr.data).content))
    }

    pub fn set_full_name(&mut self, name: &str) -> Result<bool> {
        if self.has_attr("full") {
            return self.set_attr("full", &AttrValue::Str(name.to_string()));
        }
        let bytes = RawString::encode_zstring(name);
        let schema = self.schema_arc();
        let subrecords = self.subrecords_mut()?;
        let changed = match subrecords.iter_mut().find(|sr| sr.record_type == Signature::FULL) {
            Some(sr) if sr.data == bytes => false,
            Some(sr) => {
                sr.data = bytes;
                true
            }
            None => {
                let pos = insert_position(subrecords, schema.as_ref(), Signature::FULL);
                subrecords.insert(pos, Subrecord::new(Signature::FULL, bytes));
                true
            }
        };
        if changed {
            self.mark_modified();
        }
        Ok(changed)
    }

    fn list_def(&self, list: &str) -> Result<EntryListDef> {
        self.schema()
            .entry_list(list)
            .cloned()
            .ok_or_else(|| EspError::schema(format!("{} 没有条目列表 {}", self.record_type, list)))
    }

    /// 读取条目列表
    pub fn entries(&self, list: &str) -> Result<Vec<ListEntry>> {
        let def = self.list_def(list)?;
        let subrecords = self.subrecords()?;
        let end = section_end(&subrecords, self.schema().as_ref());
        subrecords[..end]
            .iter()
            .filter(|sr| sr.record_type == def.sub)
            .map(|sr| {
                let mut entry = ListEntry::default();
                for field in &def.fields {
                    entry.values.insert(field.name.clone(), read_field(sr, field)?);
                }
                Ok(entry)
            })
            .collect()
    }

    /// 修改第 `index` 个条目的一个字段
    pub fn set_entry_field(&mut self, list: &str, index: usize, field: &str, value: &AttrValue) -> Result<bool> {
        let def = self.list_def(list)?;
        let field_def = def
            .field(field)
            .cloned()
            .ok_or_else(|| EspError::schema(format!("条目列表 {} 没有字段 {}", list, field)))?;
        let schema = self.schema_arc();
        let subrecords = self.subrecords_mut()?;
        let end = section_end(subrecords, schema.as_ref());
        let sub = subrecords[..end]
            .iter_mut()
            .filter(|sr| sr.record_type == def.sub)
            .nth(index)
            .ok_or_else(|| EspError::schema(format!("条目列表 {} 没有第 {} 项", list, index)))?;
        let changed = write_field(sub, &field_def, value)?;
        if changed {
            self.mark_modified();
        }
        Ok(changed)
    }

    /// 追加条目（按模板新建，插入在同类条目之后）
    pub fn push_entry(&mut self, list: &str, values: &[(&str, AttrValue)]) -> Result<()> {
        let def = self.list_def(list)?;
        let mut sub = Subrecord::new(def.sub, template_bytes(&def.template, list)?);
        for (name, value) in values {
            let field = def
                .field(name)
                .ok_or_else(|| EspError::schema(format!("条目列表 {} 没有字段 {}", list, name)))?;
            write_field(&mut sub, field, value)?;
        }

        let schema = self.schema_arc();
        let subrecords = self.subrecords_mut()?;
        let end = section_end(subrecords, schema.as_ref());
        let pos = subrecords[..end]
            .iter()
            .rposition(|sr| sr.record_type == def.sub)
            .map(|i| i + 1)
            .unwrap_or(end);
        subrecords.insert(pos, sub);
        self.mark_modified();
        Ok(())
    }

    fn effects_def(&self) -> Result<EffectsDef> {
        self.schema()
            .effects()
            .cloned()
            .ok_or_else(|| EspError::schema(format!("{} 没有效果列表", self.record_type)))
    }

    /// 读取效果列表
    pub fn effects(&self) -> Result<Vec<Effect>> {
        let def = self.effects_def()?;
        let subrecords = self.subrecords()?;
        let start = section_end(&subrecords, self.schema().as_ref());

        let mut effects: Vec<Effect> = Vec::new();
        for sub in &subrecords[start..] {
            if sub.record_type == def.start {
                effects.push(Effect::default());
                continue;
            }
            let Some(current) = effects.last_mut() else {
                continue;
            };
            if sub.record_type == def.data {
                for field in &def.data_fields {
                    current.values.insert(field.name.clone(), read_field(sub, field)?);
                }
            } else if sub.record_type == def.script {
                let mut script = ScriptEffect::default();
                for field in &def.script_fields {
                    script.values.insert(field.name.clone(), read_field(sub, field)?);
                }
                current.script = Some(script);
            } else if sub.record_type == def.script_name {
                if let Some(script) = current.script.as_mut() {
                    script.name = RawString::parse_zstring(&sub.data).content;
                }
            }
        }
        Ok(effects)
    }

    /// 替换效果列表，返回是否有变化
    pub fn set_effects(&mut self, effects: &[Effect]) -> Result<bool> {
        if self.effects()? == effects {
            return Ok(false);
        }
        let def = self.effects_def()?;

        let mut encoded = Vec::new();
        for effect in effects {
            let code = effect
                .get(&def.code_field)
                .cloned()
                .unwrap_or_else(|| AttrValue::Str(String::new()));
            let code_field = FieldDef {
                name: def.code_field.clone(),
                offset: 0,
                kind: AttrKind::Code4,
                mask: 0,
            };
            let mut start = Subrecord::new(def.start, vec![0; 4]);
            write_field(&mut start, &code_field, &code)?;
            encoded.push(start);

            let mut data = Subrecord::new(def.data, template_bytes(&def.data_template, "effect")?);
            for field in &def.data_fields {
                if let Some(value) = effect.get(&field.name) {
                    write_field(&mut data, field, value)?;
                }
            }
            encoded.push(data);

            if let Some(script) = &effect.script {
                let mut sub = Subrecord::new(def.script, template_bytes(&def.script_template, "script effect")?);
                for field in &def.script_fields {
                    if let Some(value) = script.values.get(&field.name) {
                        write_field(&mut sub, field, value)?;
                    }
                }
                encoded.push(sub);
                if !script.name.is_empty() {
                    encoded.push(Subrecord::new(def.script_name, RawString::encode_zstring(&script.name)));
                }
            }
        }

        let schema = self.schema_arc();
        let subrecords = self.subrecords_mut()?;
        let start = section_end(subrecords, schema.as_ref());
        let mut end = start;
        while end < subrecords.len() && def.is_member(subrecords[end].record_type) {
            end += 1;
        }
        subrecords.splice(start..end, encoded);
        self.mark_modified();
        Ok(true)
    }

    /// 对文本子记录应用替换，返回是否有变化
    pub fn rewrite_text_fields(&mut self, rewrite: &mut dyn FnMut(&str) -> String) -> Result<bool> {
        let schema = self.schema_arc();
        let text_fields = schema.text_fields();
        if text_fields.is_empty() {
            return Ok(false);
        }
        let mut changed = false;
        for sub in self.subrecords_mut()?.iter_mut() {
            if !text_fields.contains(&sub.record_type) {
                continue;
            }
            let had_null = sub.data.last() == Some(&0);
            let text = RawString::parse_zstring(&sub.data).content;
            let replaced = rewrite(&text);
            if replaced != text {
                sub.data = if had_null {
                    RawString::encode_zstring(&replaced)
                } else {
                    RawString::encode(&replaced)
                };
                changed = true;
            }
        }
        if changed {
            self.mark_modified();
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::form_id::LongFid;
    use crate::reader::RecordHeader;
    use crate::schema::DescribedSchema;

    fn schema(json: &str) -> Arc<dyn RecordSchema> {
        Arc::new(serde_json::from_str::<DescribedSchema>(json).unwrap())
    }

    fn record(sig: &[u8; 4], subs: Vec<Subrecord>, schema: Arc<dyn RecordSchema>) -> Record {
        let mut payload = Vec::new();
        for sub in &subs {
            sub.write_to(&mut payload).unwrap();
        }
        let header = RecordHeader {
            signature: Signature::new(sig),
            size: payload.len() as u32,
            flags: 0,
            form_id: 0x801,
            version_control_info: 0,
            internal_version: 0,
        };
        Record::from_header(&header, payload, schema)
    }

    fn sub(sig: &[u8; 4], data: &[u8]) -> Subrecord {
        Subrecord::new(Signature::new(sig), data.to_vec())
    }

    const NPC: &str = r#"{
        "signature": "NPC_",
        "fids": [{"sub": "SNAM"}],
        "attrs": [
            {"name": "full", "sub": "FULL", "kind": "zstring"},
            {"name": "level", "sub": "ACBS", "offset": 10, "kind": "i16"},
            {"name": "calcMin", "sub": "ACBS", "offset": 12, "kind": "u16"},
            {"name": "pcLevelOffset", "sub": "ACBS", "offset": 0, "kind": "bit", "mask": 128}
        ],
        "lists": [{
            "name": "factions", "sub": "SNAM", "template": "00000000 00 4F4442",
            "fields": [
                {"name": "faction", "offset": 0, "kind": "fid"},
                {"name": "rank", "offset": 4, "kind": "u8"}
            ]
        }]
    }"#;

    #[test]
    fn test_numeric_attrs() {
        let mut acbs = vec![0u8; 16];
        acbs[0] = 0x80;
        acbs[10..12].copy_from_slice(&(-5i16).to_le_bytes());
        let mut npc = record(b"NPC_", vec![sub(b"EDID", b"Guard\0"), sub(b"ACBS", &acbs)], schema(NPC));

        assert_eq!(npc.attr("level").unwrap(), Some(AttrValue::Int(-5)));
        assert_eq!(npc.attr("pcLevelOffset").unwrap(), Some(AttrValue::Bool(true)));
        assert_eq!(npc.attr("full").unwrap(), None);

        assert!(!npc.set_attr("level", &AttrValue::Int(-5)).unwrap());
        assert!(!npc.is_modified());
        assert!(npc.set_attr("level", &AttrValue::Int(3)).unwrap());
        assert!(npc.is_modified());
        assert_eq!(npc.attr("level").unwrap(), Some(AttrValue::Int(3)));

        assert!(npc.set_attr("calcMin", &AttrValue::Int(-1)).is_err());
        assert!(npc.attr("missing").is_err());
    }

    #[test]
    fn test_string_attr_inserted_after_editor_id() {
        let mut npc = record(b"NPC_", vec![sub(b"EDID", b"Guard\0"), sub(b"ACBS", &[0; 16])], schema(NPC));
        assert!(npc.set_full_name("Town Guard").unwrap());
        let subs = npc.subrecords().unwrap();
        assert_eq!(subs[1].record_type, Signature::FULL);
        assert_eq!(npc.full_name().unwrap().as_deref(), Some("Town Guard"));
    }

    #[test]
    fn test_entries_update_and_push() {
        let mut snam = 0x0000_0900u32.to_le_bytes().to_vec();
        snam.extend_from_slice(&[1, 0, 0, 0]);
        let mut npc = record(b"NPC_", vec![sub(b"EDID", b"Guard\0"), sub(b"SNAM", &snam)], schema(NPC));

        let entries = npc.entries("factions").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].get("rank"), Some(&AttrValue::Int(1)));

        assert!(npc.set_entry_field("factions", 0, "rank", &AttrValue::Int(2)).unwrap());
        npc.push_entry(
            "factions",
            &[
                ("faction", AttrValue::Fid(FormId::Long(LongFid::new("A.esm", 0x950)))),
                ("rank", AttrValue::Int(3)),
            ],
        )
        .unwrap();

        let entries = npc.entries("factions").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].get("rank"), Some(&AttrValue::Int(2)));
        assert_eq!(
            entries[1].get("faction"),
            Some(&AttrValue::Fid(FormId::Long(LongFid::new("A.esm", 0x950))))
        );
    }

    const SPEL: &str = r#"{
        "signature": "SPEL",
        "fids": [{"sub": "SCIT"}],
        "attrs": [
            {"name": "full", "sub": "FULL", "kind": "zstring"},
            {"name": "cost", "sub": "SPIT", "offset": 4, "kind": "u32"}
        ],
        "effects": {
            "start": "EFID", "code_field": "name",
            "data": "EFIT", "data_template": "000000000000000000000000000000000000000000000000",
            "data_fields": [
                {"name": "name", "offset": 0, "kind": "code4"},
                {"name": "magnitude", "offset": 4, "kind": "u32"}
            ],
            "script": "SCIT", "script_template": "00000000000000000000000000000000",
            "script_fields": [
                {"name": "script", "offset": 0, "kind": "fid"},
                {"name": "hostile", "offset": 12, "kind": "bit", "mask": 1}
            ],
            "script_name": "FULL"
        }
    }"#;

    #[test]
    fn test_effects_round_trip() {
        let mut spit = vec![0u8; 16];
        spit[4..8].copy_from_slice(&25u32.to_le_bytes());
        let mut efit = vec![0u8; 24];
        efit[..4].copy_from_slice(b"FIDG");
        efit[4..8].copy_from_slice(&10u32.to_le_bytes());
        let mut spell = record(
            b"SPEL",
            vec![
                sub(b"EDID", b"Fire\0"),
                sub(b"FULL", b"Fireball\0"),
                sub(b"SPIT", &spit),
                sub(b"EFID", b"FIDG"),
                sub(b"EFIT", &efit),
            ],
            schema(SPEL),
        );

        // 效果中的 FULL 不会被当作名称
        assert_eq!(spell.full_name().unwrap().as_deref(), Some("Fireball"));
        let mut effects = spell.effects().unwrap();
        assert_eq!(effects.len(), 1);
        assert_eq!(effects[0].get("name"), Some(&AttrValue::Str("FIDG".into())));
        assert!(!spell.set_effects(&effects).unwrap());

        let mut script = ScriptEffect::default();
        script.values.insert("script".into(), AttrValue::Fid(FormId::Short(0x900)));
        script.values.insert("hostile".into(), AttrValue::Bool(true));
        script.name = "Burn".into();
        effects.push(Effect {
            values: [("name".to_string(), AttrValue::Str("SEFF".into()))].into_iter().collect(),
            script: Some(script),
        });
        assert!(spell.set_effects(&effects).unwrap());

        let read_back = spell.effects().unwrap();
        assert_eq!(read_back.len(), 2);
        let script = read_back[1].script.as_ref().unwrap();
        assert_eq!(script.name, "Burn");
        assert_eq!(script.values.get("hostile"), Some(&AttrValue::Bool(true)));
        assert_eq!(spell.full_name().unwrap().as_deref(), Some("Fireball"));
        assert_eq!(spell.attr("cost").unwrap(), Some(AttrValue::Int(25)));
    }

    #[test]
    fn test_rewrite_text_fields() {
        let scpt = schema(r#"{"signature": "SCPT", "text_fields": ["SCTX"]}"#);
        let mut script = record(b"SCPT", vec![sub(b"EDID", b"Test\0"), sub(b"SCTX", b"cast OldSpell")], scpt);
        let changed = script
            .rewrite_text_fields(&mut |text| text.replace("OldSpell", "NewSpell"))
            .unwrap();
        assert!(changed);
        let subs = script.subrecords().unwrap();
        assert_eq!(subs[1].data, b"cast NewSpell");
    }

    #[test]
    fn test_parse_values() {
        assert_eq!(AttrValue::parse(AttrKind::U16, "12"), Some(AttrValue::Int(12)));
        assert_eq!(AttrValue::parse(AttrKind::F32, "1.5"), Some(AttrValue::Float(1.5)));
        assert_eq!(AttrValue::parse(AttrKind::Bit, "True"), Some(AttrValue::Bool(true)));
        assert_eq!(AttrValue::parse(AttrKind::U8, "x"), None);
        assert_eq!(AttrValue::Float(1.5).to_string(), "1.500000");
    }
}
