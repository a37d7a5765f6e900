use crate::datatypes::{read_u32, Signature};
use crate::group::{GroupHeader, GroupType};
use crate::utils::{EspError, Result};
use std::io::{Cursor, Read};

/// 记录头部（不解释负载）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub signature: Signature,
    /// 负载大小（不含头部）
    pub size: u32,
    pub flags: u32,
    pub form_id: u32,
    /// 版本控制信息
    pub version_control_info: u32,
    /// 内部版本（仅24字节头部）
    pub internal_version: u32,
}

/// 块头部：记录或组
#[derive(Debug, Clone)]
pub enum ChunkHeader {
    Record(RecordHeader),
    Group(GroupHeader),
}

impl ChunkHeader {
    pub fn signature(&self) -> Signature {
        match self {
            ChunkHeader::Record(header) => header.signature,
            ChunkHeader::Group(_) => Signature::GRUP,
        }
    }
}

/// 插件文件读取器
///
/// 只读取固定大小的块头部并跳过/截取负载，从不解释负载内容。
/// 头部大小由游戏决定（20 或 24 字节）。
pub struct ModReader<'a> {
    name: String,
    cursor: Cursor<&'a [u8]>,
    header_size: usize,
}

impl<'a> ModReader<'a> {
    pub fn new(name: impl Into<String>, data: &'a [u8], header_size: usize) -> Self {
        ModReader {
            name: name.into(),
            cursor: Cursor::new(data),
            header_size,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn header_size(&self) -> usize {
        self.header_size
    }

    pub fn position(&self) -> u64 {
        self.cursor.position()
    }

    pub fn len(&self) -> u64 {
        self.cursor.get_ref().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn at_end(&self) -> bool {
        self.position() >= self.len()
    }

    pub fn remaining(&self) -> u64 {
        self.len().saturating_sub(self.position())
    }

    /// 带文件名和位置的格式错误
    pub fn format_error(&self, message: impl AsRef<str>) -> EspError {
        EspError::format(format!(
            "{} @ 0x{:X}: {}",
            self.name,
            self.position(),
            message.as_ref()
        ))
    }

    fn ensure(&self, needed: u64, what: &str) -> Result<()> {
        if needed > self.remaining() {
            return Err(self.format_error(format!(
                "{} 需要 {} 字节，剩余 {} 字节",
                what,
                needed,
                self.remaining()
            )));
        }
        Ok(())
    }

    /// 读取下一个块头部
    ///
    /// 组的声明大小包含头部本身，记录的声明大小只含负载。
    /// 任何会越过文件末尾的声明都是格式错误。
    pub fn next_header(&mut self) -> Result<ChunkHeader> {
        self.ensure(self.header_size as u64, "块头部")?;

        let mut type_bytes = [0u8; 4];
        self.cursor.read_exact(&mut type_bytes)?;
        let size = read_u32(&mut self.cursor)?;
        let field_a = read_u32(&mut self.cursor)?;
        let field_b = read_u32(&mut self.cursor)?;
        let version_control_info = read_u32(&mut self.cursor)?;
        let internal_version = if self.header_size >= 24 {
            read_u32(&mut self.cursor)?
        } else {
            0
        };

        let signature = Signature(type_bytes);
        if signature == Signature::GRUP {
            if (size as usize) < self.header_size {
                return Err(self.format_error(format!("组大小 {} 小于头部大小", size)));
            }
            self.ensure(size as u64 - self.header_size as u64, "组负载")?;
            Ok(ChunkHeader::Group(GroupHeader {
                size,
                label: field_a.to_le_bytes(),
                group_type: GroupType::from(field_b as i32),
                version_control_info,
                internal_version,
            }))
        } else {
            self.ensure(size as u64, &format!("记录 {} 负载", signature))?;
            Ok(ChunkHeader::Record(RecordHeader {
                signature,
                size,
                flags: field_a,
                form_id: field_b,
                version_control_info,
                internal_version,
            }))
        }
    }

    /// 查看下一个块的签名而不移动位置
    pub fn peek_signature(&self) -> Result<Signature> {
        self.ensure(4, "签名")?;
        let start = self.position() as usize;
        let data: &'a [u8] = *self.cursor.get_ref();
        Ok(Signature([
            data[start],
            data[start + 1],
            data[start + 2],
            data[start + 3],
        ]))
    }

    pub fn skip(&mut self, n_bytes: u64) -> Result<()> {
        self.ensure(n_bytes, "跳过")?;
        self.cursor.set_position(self.position() + n_bytes);
        Ok(())
    }

    /// 截取负载（零拷贝）
    pub fn read_exact(&mut self, n_bytes: usize) -> Result<&'a [u8]> {
        self.ensure(n_bytes as u64, "读取")?;
        let start = self.position() as usize;
        let data: &'a [u8] = *self.cursor.get_ref();
        self.cursor.set_position((start + n_bytes) as u64);
        Ok(&data[start..start + n_bytes])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_bytes(sig: &[u8; 4], size: u32, a: u32, b: u32) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(sig);
        data.extend_from_slice(&size.to_le_bytes());
        data.extend_from_slice(&a.to_le_bytes());
        data.extend_from_slice(&b.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        data
    }

    #[test]
    fn test_record_header() {
        let mut data = header_bytes(b"NPC_", 3, 0x20, 0x0100_0801);
        data.extend_from_slice(&[1, 2, 3]);

        let mut reader = ModReader::new("Test.esp", &data, 20);
        match reader.next_header().unwrap() {
            ChunkHeader::Record(header) => {
                assert_eq!(header.signature, Signature::new(b"NPC_"));
                assert_eq!(header.size, 3);
                assert_eq!(header.flags, 0x20);
                assert_eq!(header.form_id, 0x0100_0801);
            }
            other => panic!("expected record header, got {:?}", other),
        }
        assert_eq!(reader.read_exact(3).unwrap(), &[1, 2, 3]);
        assert!(reader.at_end());
    }

    #[test]
    fn test_group_header_label() {
        let data = header_bytes(b"GRUP", 20, u32::from_le_bytes(*b"WEAP"), 0);
        let mut reader = ModReader::new("Test.esp", &data, 20);
        match reader.next_header().unwrap() {
            ChunkHeader::Group(header) => {
                assert_eq!(&header.label, b"WEAP");
                assert_eq!(header.group_type, GroupType::Top);
            }
            other => panic!("expected group header, got {:?}", other),
        }
    }

    #[test]
    fn test_record_overruns_stream() {
        let mut data = header_bytes(b"WEAP", 100, 0, 0);
        data.extend_from_slice(&[0; 10]);
        let mut reader = ModReader::new("Test.esp", &data, 20);
        assert!(matches!(reader.next_header(), Err(EspError::Format(_))));
    }

    #[test]
    fn test_group_smaller_than_header() {
        let data = header_bytes(b"GRUP", 8, 0, 0);
        let mut reader = ModReader::new("Test.esp", &data, 20);
        assert!(matches!(reader.next_header(), Err(EspError::Format(_))));
    }

    #[test]
    fn test_truncated_header() {
        let data = vec![b'T', b'E', b'S', b'4', 0, 0];
        let mut reader = ModReader::new("Test.esp", &data, 20);
        assert!(matches!(reader.next_header(), Err(EspError::Format(_))));
        assert!(reader.skip(100).is_err());
    }

    #[test]
    fn test_peek_signature() {
        let data = header_bytes(b"GRUP", 20, 0, 0);
        let reader = ModReader::new("Test.esp", &data, 20);
        assert_eq!(reader.peek_signature().unwrap(), Signature::GRUP);
        assert_eq!(reader.position(), 0);
    }
}
