use crate::datatypes::{read_u32, RawString, RecordFlags, Signature};
use crate::form_id::{FormId, MapFid, MasterSet};
use crate::reader::RecordHeader;
use crate::schema::RecordSchema;
use crate::subrecord::Subrecord;
use crate::utils::{EspError, Result};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::borrow::Cow;
use std::io::{Cursor, Read, Write};
use std::sync::Arc;
use tracing::{debug, warn};

/// 记录结构
///
/// 加载后只保存磁盘上的原始负载（可能是压缩的）；首次访问字段时解包为子记录。
/// 未修改的记录始终按原始字节写回。
#[derive(Debug, Clone)]
pub struct Record {
    /// 记录类型
    pub record_type: Signature,
    /// 标志位（原始32位数据）
    pub flags: u32,
    /// FormID
    pub form_id: FormId,
    /// 版本控制信息
    pub version_control_info: u32,
    /// 内部版本（仅24字节头部）
    pub internal_version: u32,
    /// 磁盘上的原始负载
    raw_data: Vec<u8>,
    /// 解包后的子记录
    subrecords: Option<Vec<Subrecord>>,
    schema: Arc<dyn RecordSchema>,
    /// 是否已被修改
    is_modified: bool,
}

impl Record {
    /// 从块头部和负载构造（不解包）
    pub fn from_header(header: &RecordHeader, payload: Vec<u8>, schema: Arc<dyn RecordSchema>) -> Self {
        Record {
            record_type: header.signature,
            flags: header.flags,
            form_id: FormId::Short(header.form_id),
            version_control_info: header.version_control_info,
            internal_version: header.internal_version,
            raw_data: payload,
            subrecords: None,
            schema,
            is_modified: false,
        }
    }

    /// 新建空记录（视为已修改）
    pub fn new(form_id: FormId, flags: u32, schema: Arc<dyn RecordSchema>) -> Self {
        Record {
            record_type: schema.signature(),
            flags,
            form_id,
            version_control_info: 0,
            internal_version: 0,
            raw_data: Vec::new(),
            subrecords: Some(Vec::new()),
            schema,
            is_modified: true,
        }
    }

    pub fn schema(&self) -> &Arc<dyn RecordSchema> {
        &self.schema
    }

    /// 获取标志位
    pub fn get_flags(&self) -> RecordFlags {
        RecordFlags::from_bits_truncate(self.flags)
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & RecordFlags::COMPRESSED.bits() != 0
    }

    pub fn is_deleted(&self) -> bool {
        self.flags & RecordFlags::DELETED.bits() != 0
    }

    pub fn is_ignored(&self) -> bool {
        self.flags & RecordFlags::IGNORED.bits() != 0
    }

    /// 既未删除也未被忽略
    pub fn is_active(&self) -> bool {
        !self.is_deleted() && !self.is_ignored()
    }

    pub fn is_unpacked(&self) -> bool {
        self.subrecords.is_some()
    }

    pub fn is_modified(&self) -> bool {
        self.is_modified
    }

    /// 标记为已修改
    pub fn mark_modified(&mut self) {
        self.is_modified = true;
    }

    /// 解包负载为子记录
    pub fn unpack(&mut self) -> Result<()> {
        if self.subrecords.is_none() {
            self.subrecords = Some(self.decode_payload()?);
        }
        Ok(())
    }

    fn decode_payload(&self) -> Result<Vec<Subrecord>> {
        let subrecords = if self.is_compressed() {
            let decompressed = Self::decompress_data(&self.raw_data)?;
            debug!(
                "解压记录 {} {}: {} -> {} bytes",
                self.record_type,
                self.form_id,
                self.raw_data.len(),
                decompressed.len()
            );
            Subrecord::parse_all(&decompressed)
        } else {
            Subrecord::parse_all(&self.raw_data)
        };
        subrecords.map_err(|e| {
            EspError::format(format!("记录 {} {}: {}", self.record_type, self.form_id, e))
        })
    }

    /// 只读访问子记录；未解包的记录临时解码
    pub fn subrecords(&self) -> Result<Cow<'_, [Subrecord]>> {
        match &self.subrecords {
            Some(subrecords) => Ok(Cow::Borrowed(subrecords.as_slice())),
            None => Ok(Cow::Owned(self.decode_payload()?)),
        }
    }

    /// 可变访问子记录（按需解包）
    ///
    /// 调用者修改内容后负责调用 [`Record::mark_modified`]。
    pub fn subrecords_mut(&mut self) -> Result<&mut Vec<Subrecord>> {
        self.unpack()?;
        self.subrecords
            .as_mut()
            .ok_or_else(|| EspError::state("记录解包失败"))
    }

    /// 查找子记录
    pub fn find_subrecord(&self, record_type: Signature) -> Result<Option<Subrecord>> {
        Ok(self
            .subrecords()?
            .iter()
            .find(|sr| sr.record_type == record_type)
            .cloned())
    }

    /// 获取编辑器ID
    pub fn get_editor_id(&self) -> Option<String> {
        match self.find_subrecord(Signature::EDID) {
            Ok(found) => found.map(|sr| RawString::parse_zstring(&sr.data).content),
            Err(e) => {
                warn!("读取 {} 的编辑器ID失败: {}", self.form_id, e);
                None
            }
        }
    }

    /// 设置编辑器ID，返回是否有变化
    pub fn set_editor_id(&mut self, editor_id: &str) -> Result<bool> {
        let bytes = RawString::encode_zstring(editor_id);
        let subrecords = self.subrecords_mut()?;
        let changed = match subrecords.iter_mut().find(|sr| sr.record_type == Signature::EDID) {
            Some(sr) if sr.data == bytes => false,
            Some(sr) => {
                sr.data = bytes;
                true
            }
            None => {
                subrecords.insert(0, Subrecord::new(Signature::EDID, bytes));
                true
            }
        };
        if changed {
            self.mark_modified();
        }
        Ok(changed)
    }

    /// 对所有FormID字段应用转换函数
    ///
    /// 记录头的FormID总会转换；负载只在结构描述了FormID位置时才会解包转换。
    /// 转回短格式后字节有变化的记录标记为已修改。
    pub fn convert_fids(&mut self, mapper: &dyn MapFid, to_long: bool) -> Result<()> {
        self.form_id = mapper.map_fid(&self.form_id)?;
        if !to_long && !self.is_unpacked() {
            return Ok(());
        }
        self.map_payload_fids(mapper)
    }

    /// 只对负载中的FormID字段应用转换函数（必要时解包）
    pub fn map_payload_fids(&mut self, mapper: &dyn MapFid) -> Result<()> {
        let schema = Arc::clone(&self.schema);
        let fields = schema.fid_fields();
        if fields.is_empty() {
            return Ok(());
        }
        if let Err(e) = self.unpack() {
            // 无法解包的负载保持原样（仍为短格式字节）
            warn!("记录 {} {} 无法解包，跳过负载中的FormID: {}", self.record_type, self.form_id, e);
            return Ok(());
        }

        let mut bytes_changed = false;
        for subrecord in self.subrecords_mut()?.iter_mut() {
            let sub_sig = subrecord.record_type;
            for field in fields.iter().filter(|f| f.sub == sub_sig) {
                for offset in field.offsets_in(subrecord.data.len()) {
                    let current = subrecord.fid_at(offset)?;
                    let mapped = mapper.map_fid(&current)?;
                    bytes_changed |= subrecord.set_fid_at(offset, mapped)?;
                }
            }
        }
        if bytes_changed {
            self.mark_modified();
        }
        Ok(())
    }

    /// 收集记录引用的所有所属文件（需处于长格式）
    pub fn update_masters(&self, masters: &mut MasterSet) {
        masters.add_fid(&self.form_id);
        if let Some(subrecords) = &self.subrecords {
            for subrecord in subrecords {
                for fid in subrecord.long_fids() {
                    masters.add(&fid.master);
                }
            }
        }
    }

    /// 写出时使用的负载：未修改时为原始字节，否则重新序列化（必要时重新压缩）
    pub fn payload_for_write(&self) -> Result<Cow<'_, [u8]>> {
        let subrecords = match (&self.subrecords, self.is_modified) {
            (Some(subrecords), true) => subrecords,
            _ => return Ok(Cow::Borrowed(&self.raw_data)),
        };

        let data = Self::serialize_subrecords(subrecords)?;
        if self.is_compressed() {
            Ok(Cow::Owned(Self::compress_data(&data)?))
        } else {
            Ok(Cow::Owned(data))
        }
    }

    fn serialize_subrecords(subrecords: &[Subrecord]) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        for subrecord in subrecords {
            subrecord.write_to(&mut data)?;
        }
        Ok(data)
    }

    /// 压缩数据：4字节解压大小 + zlib 流
    fn compress_data(data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data)?;
        let compressed_data = encoder.finish()?;

        let mut result = Vec::with_capacity(compressed_data.len() + 4);
        result.extend_from_slice(&(data.len() as u32).to_le_bytes());
        result.extend_from_slice(&compressed_data);
        Ok(result)
    }

    /// 解压缩数据
    fn decompress_data(data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < 4 {
            return Err(EspError::CompressionError("压缩数据太短，无法包含解压大小".into()));
        }

        let mut data_cursor = Cursor::new(data);
        let decompressed_size = read_u32(&mut data_cursor)?;
        if decompressed_size > 50_000_000 {
            return Err(EspError::CompressionError(format!(
                "解压大小过大: {} bytes (可能数据损坏)",
                decompressed_size
            )));
        }

        let compressed_data = &data[4..];
        if compressed_data.is_empty() {
            return if decompressed_size == 0 {
                Ok(Vec::new())
            } else {
                Err(EspError::CompressionError("没有压缩数据".into()))
            };
        }

        let mut decoder = ZlibDecoder::new(compressed_data);
        let mut decompressed = Vec::with_capacity(decompressed_size as usize);
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| EspError::CompressionError(e.to_string()))?;

        if decompressed.len() != decompressed_size as usize {
            return Err(EspError::CompressionError(format!(
                "解压大小不匹配: 期望 {} bytes，实际 {} bytes",
                decompressed_size,
                decompressed.len()
            )));
        }

        Ok(decompressed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::form_id::{LongFid, LongMapper, ModName, ShortMapper};
    use crate::schema::{DescribedSchema, OpaqueSchema};

    fn npc_schema() -> Arc<dyn RecordSchema> {
        let json = r#"{"signature": "NPC_", "fids": [{"sub": "SCRI"}]}"#;
        Arc::new(serde_json::from_str::<DescribedSchema>(json).unwrap())
    }

    fn payload(subs: &[(&[u8; 4], &[u8])]) -> Vec<u8> {
        let mut data = Vec::new();
        for (sig, bytes) in subs {
            data.extend_from_slice(*sig);
            data.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
            data.extend_from_slice(bytes);
        }
        data
    }

    fn header(sig: &[u8; 4], size: usize, flags: u32, form_id: u32) -> RecordHeader {
        RecordHeader {
            signature: Signature::new(sig),
            size: size as u32,
            flags,
            form_id,
            version_control_info: 0,
            internal_version: 0,
        }
    }

    #[test]
    fn test_unmodified_payload_is_original() {
        let data = payload(&[(b"EDID", b"Guard\0"), (b"SCRI", &0x0100_0900u32.to_le_bytes())]);
        let mut record = Record::from_header(&header(b"NPC_", data.len(), 0, 0x0100_0801), data.clone(), npc_schema());
        record.unpack().unwrap();

        assert_eq!(record.get_editor_id().as_deref(), Some("Guard"));
        assert_eq!(record.payload_for_write().unwrap().as_ref(), data.as_slice());
    }

    #[test]
    fn test_compressed_round_trip() {
        let data = payload(&[(b"EDID", b"Compressed\0")]);
        let packed = Record::compress_data(&data).unwrap();
        let flags = RecordFlags::COMPRESSED.bits();
        let mut record = Record::from_header(
            &header(b"STAT", packed.len(), flags, 0x801),
            packed.clone(),
            Arc::new(OpaqueSchema::new(Signature::new(b"STAT"))),
        );

        // 未解包也能读取
        assert_eq!(record.get_editor_id().as_deref(), Some("Compressed"));
        assert_eq!(record.payload_for_write().unwrap().as_ref(), packed.as_slice());

        record.set_editor_id("Renamed").unwrap();
        let rewritten = record.payload_for_write().unwrap().into_owned();
        let decompressed = Record::decompress_data(&rewritten).unwrap();
        assert_eq!(decompressed, payload(&[(b"EDID", b"Renamed\0")]));
    }

    #[test]
    fn test_bad_compressed_payload() {
        let flags = RecordFlags::COMPRESSED.bits();
        let mut record = Record::from_header(
            &header(b"STAT", 2, flags, 0x801),
            vec![1, 2],
            Arc::new(OpaqueSchema::new(Signature::new(b"STAT"))),
        );
        assert!(record.unpack().is_err());
    }

    #[test]
    fn test_convert_fids_round_trip() {
        let data = payload(&[(b"SCRI", &0x0100_0900u32.to_le_bytes())]);
        let mut record = Record::from_header(&header(b"NPC_", data.len(), 0, 0x0200_0801), data, npc_schema());

        let masters = vec![ModName::new("A.esm"), ModName::new("B.esm")];
        let own = ModName::new("F.esp");
        record.convert_fids(&LongMapper::new(&masters, &own), true).unwrap();
        assert_eq!(record.form_id, FormId::Long(LongFid::new("F.esp", 0x801)));

        let mut set = MasterSet::new();
        record.update_masters(&mut set);
        assert!(set.contains(&ModName::new("B.esm")));
        assert!(set.contains(&own));

        record.convert_fids(&ShortMapper::new(&masters, &own, false), false).unwrap();
        assert_eq!(record.form_id, FormId::Short(0x0200_0801));
        assert!(!record.is_modified());
    }

    #[test]
    fn test_long_form_record_cannot_serialize() {
        let data = payload(&[(b"SCRI", &0x0000_0900u32.to_le_bytes())]);
        let mut record = Record::from_header(&header(b"NPC_", data.len(), 0, 0x801), data, npc_schema());
        record.convert_fids(&LongMapper::new(&[], &ModName::new("F.esp")), true).unwrap();
        record.mark_modified();
        assert!(matches!(record.payload_for_write(), Err(EspError::State(_))));
    }
}
