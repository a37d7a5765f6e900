use crate::datatypes::{read_u16, read_u32, u32_at, write_u16, write_u32, Signature};
use crate::form_id::{FormId, LongFid};
use crate::utils::{EspError, Result};
use std::io::{Cursor, Read};

/// 子记录结构
///
/// 处于长格式时，FormID 字段不写回字节，而是按偏移保存在 `long_fids` 中；
/// 转回短格式时再写入 `data`。
#[derive(Debug, Clone, PartialEq)]
pub struct Subrecord {
    /// 4字符子记录类型
    pub record_type: Signature,
    /// 原始数据
    pub data: Vec<u8>,
    long_fids: Vec<(usize, LongFid)>,
}

impl Subrecord {
    pub fn new(record_type: Signature, data: Vec<u8>) -> Self {
        Subrecord {
            record_type,
            data,
            long_fids: Vec::new(),
        }
    }

    /// 解析子记录
    ///
    /// `size_override` 来自前一个 XXXX 子记录（超过 65535 字节的数据）。
    pub fn parse(cursor: &mut Cursor<&[u8]>, size_override: Option<u32>) -> Result<Self> {
        let total = cursor.get_ref().len() as u64;
        if cursor.position() + 6 > total {
            return Err(EspError::format("子记录头部数据不足"));
        }

        let mut type_bytes = [0u8; 4];
        cursor.read_exact(&mut type_bytes)?;
        let declared = read_u16(cursor)? as u32;
        let size = size_override.unwrap_or(declared);

        if cursor.position() + size as u64 > total {
            return Err(EspError::format(format!(
                "子记录 {} 数据不足: 需要 {} 字节",
                Signature(type_bytes),
                size
            )));
        }

        let mut data = vec![0u8; size as usize];
        cursor.read_exact(&mut data)?;

        Ok(Subrecord::new(Signature(type_bytes), data))
    }

    /// 解析记录负载中的全部子记录
    pub fn parse_all(data: &[u8]) -> Result<Vec<Subrecord>> {
        let mut subrecords = Vec::new();
        let mut cursor = Cursor::new(data);
        let mut size_override = None;

        while cursor.position() < data.len() as u64 {
            let remaining = data.len() as u64 - cursor.position();

            // 子记录最小头部为 6 字节，不足时只允许 NULL 填充
            if remaining < 6 {
                let remaining_bytes = &data[cursor.position() as usize..];
                if remaining_bytes.iter().all(|&b| b == 0) {
                    break;
                }
                return Err(EspError::format(format!(
                    "记录末尾有 {} 字节非 NULL 数据，无法解析为子记录: {:02X?}",
                    remaining, remaining_bytes
                )));
            }

            let subrecord = Subrecord::parse(&mut cursor, size_override.take())?;
            if subrecord.record_type == Signature::XXXX {
                let mut inner = Cursor::new(subrecord.data.as_slice());
                size_override = Some(read_u32(&mut inner).map_err(|_| {
                    EspError::format("XXXX 子记录长度必须为 4 字节")
                })?);
                continue;
            }
            subrecords.push(subrecord);
        }

        if size_override.is_some() {
            return Err(EspError::format("XXXX 子记录之后没有数据"));
        }

        Ok(subrecords)
    }

    /// 写出子记录（必须处于短格式）
    pub fn write_to(&self, out: &mut Vec<u8>) -> Result<()> {
        if !self.long_fids.is_empty() {
            return Err(EspError::state(format!(
                "子记录 {} 仍含长格式FormID，不能序列化",
                self.record_type
            )));
        }
        if self.data.len() > u16::MAX as usize {
            out.extend_from_slice(Signature::XXXX.as_bytes());
            write_u16(out, 4)?;
            write_u32(out, self.data.len() as u32)?;
            out.extend_from_slice(self.record_type.as_bytes());
            write_u16(out, 0)?;
        } else {
            out.extend_from_slice(self.record_type.as_bytes());
            write_u16(out, self.data.len() as u16)?;
        }
        out.extend_from_slice(&self.data);
        Ok(())
    }

    /// 读取指定偏移的FormID
    pub fn fid_at(&self, offset: usize) -> Result<FormId> {
        if let Some((_, fid)) = self.long_fids.iter().find(|(at, _)| *at == offset) {
            return Ok(FormId::Long(fid.clone()));
        }
        u32_at(&self.data, offset).map(FormId::Short).ok_or_else(|| {
            EspError::schema(format!(
                "子记录 {} 偏移 {} 处没有FormID（长度 {}）",
                self.record_type,
                offset,
                self.data.len()
            ))
        })
    }

    /// 写入指定偏移的FormID，返回字节是否发生变化
    pub fn set_fid_at(&mut self, offset: usize, fid: FormId) -> Result<bool> {
        if offset + 4 > self.data.len() {
            return Err(EspError::schema(format!(
                "子记录 {} 偏移 {} 越界（长度 {}）",
                self.record_type,
                offset,
                self.data.len()
            )));
        }
        match fid {
            FormId::Short(value) => {
                self.long_fids.retain(|(at, _)| *at != offset);
                let bytes = value.to_le_bytes();
                let changed = self.data[offset..offset + 4] != bytes;
                self.data[offset..offset + 4].copy_from_slice(&bytes);
                Ok(changed)
            }
            FormId::Long(long) => {
                match self.long_fids.iter_mut().find(|(at, _)| *at == offset) {
                    Some(slot) => slot.1 = long,
                    None => self.long_fids.push((offset, long)),
                }
                Ok(false)
            }
        }
    }

    pub fn has_long_fids(&self) -> bool {
        !self.long_fids.is_empty()
    }

    pub fn long_fids(&self) -> impl Iterator<Item = &LongFid> {
        self.long_fids.iter().map(|(_, fid)| fid)
    }
}
