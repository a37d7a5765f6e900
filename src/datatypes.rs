use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::io::{Cursor, Write};
use std::str::FromStr;

// 基础整数类型读取函数
pub fn read_u16(cursor: &mut Cursor<&[u8]>) -> Result<u16, std::io::Error> {
    cursor.read_u16::<LittleEndian>()
}

pub fn read_u32(cursor: &mut Cursor<&[u8]>) -> Result<u32, std::io::Error> {
    cursor.read_u32::<LittleEndian>()
}

// 基础整数类型写入函数
pub fn write_u16(writer: &mut dyn Write, value: u16) -> Result<(), std::io::Error> {
    writer.write_u16::<LittleEndian>(value)
}

pub fn write_u32(writer: &mut dyn Write, value: u32) -> Result<(), std::io::Error> {
    writer.write_u32::<LittleEndian>(value)
}

/// 从切片指定偏移读取小端 u32（越界返回 None）
pub fn u32_at(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset.checked_add(4)?)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// 4字节类型签名（记录、子记录、组标签共用）
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Signature(pub [u8; 4]);

impl Signature {
    pub const GRUP: Signature = Signature(*b"GRUP");
    pub const TES4: Signature = Signature(*b"TES4");
    pub const EDID: Signature = Signature(*b"EDID");
    pub const FULL: Signature = Signature(*b"FULL");
    pub const XXXX: Signature = Signature(*b"XXXX");

    pub const fn new(bytes: &[u8; 4]) -> Self {
        Signature(*bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }

    /// 可读形式（非ASCII字节按Latin-1显示）
    pub fn as_str(&self) -> Cow<'_, str> {
        if self.0.iter().all(|b| b.is_ascii_graphic()) {
            Cow::Borrowed(std::str::from_utf8(&self.0).unwrap_or("????"))
        } else {
            Cow::Owned(self.0.iter().map(|&b| b as char).collect())
        }
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str())
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", self.as_str())
    }
}

impl FromStr for Signature {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.len() != 4 {
            return Err(format!("签名必须为4个字节: {:?}", s));
        }
        Ok(Signature([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

impl TryFrom<String> for Signature {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Signature> for String {
    fn from(value: Signature) -> Self {
        value.to_string()
    }
}

// 支持的编码
const SUPPORTED_ENCODINGS: &[&str] = &["utf-8", "windows-1252", "windows-1250", "windows-1251"];

#[derive(Debug, Clone)]
pub struct RawString {
    pub content: String,
    pub encoding: String,
}

impl RawString {
    /// 尝试多种编码解码
    pub fn decode(data: &[u8]) -> Self {
        for encoding_name in SUPPORTED_ENCODINGS {
            if let Some(encoding) = encoding_rs::Encoding::for_label(encoding_name.as_bytes()) {
                let (decoded, _, had_errors) = encoding.decode(data);
                if !had_errors {
                    return RawString {
                        content: decoded.into_owned(),
                        encoding: encoding_name.to_string(),
                    };
                }
            }
        }

        // 回退到UTF-8，忽略错误
        RawString {
            content: String::from_utf8_lossy(data).into_owned(),
            encoding: "utf-8".to_string(),
        }
    }

    /// Z字符串解析(以null结尾)
    pub fn parse_zstring(data: &[u8]) -> Self {
        let null_pos = data.iter().position(|&b| b == 0).unwrap_or(data.len());
        Self::decode(&data[..null_pos])
    }

    /// 按游戏使用的 windows-1252 编码写回（无法表示的字符替换）
    pub fn encode(text: &str) -> Vec<u8> {
        let (bytes, _, _) = encoding_rs::WINDOWS_1252.encode(text);
        bytes.into_owned()
    }

    /// 编码为以null结尾的Z字符串
    pub fn encode_zstring(text: &str) -> Vec<u8> {
        let mut bytes = Self::encode(text);
        bytes.push(0);
        bytes
    }
}

// 记录标志位定义
bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RecordFlags: u32 {
        const MASTER_FILE = 0x00000001;        // ESM标志（仅文件头）
        const DELETED = 0x00000020;            // 已删除
        const LOCALIZED = 0x00000080;          // 本地化（仅文件头）
        const LIGHT_MASTER = 0x00000200;       // 轻量级主文件
        const PERSISTENT = 0x00000400;         // 持久化
        const DISABLED = 0x00000800;           // 禁用
        const IGNORED = 0x00001000;            // 被引擎忽略
        const VISIBLE_DISTANT = 0x00008000;    // 远距离可见
        const COMPRESSED = 0x00040000;         // 压缩
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_parse() {
        let sig: Signature = "NPC_".parse().unwrap();
        assert_eq!(sig, Signature::new(b"NPC_"));
        assert_eq!(sig.to_string(), "NPC_");
        assert!("NPC".parse::<Signature>().is_err());
    }

    #[test]
    fn test_signature_json() {
        let sig: Signature = serde_json::from_str("\"WEAP\"").unwrap();
        assert_eq!(sig.as_bytes(), b"WEAP");
        assert_eq!(serde_json::to_string(&sig).unwrap(), "\"WEAP\"");
    }

    #[test]
    fn test_zstring_round_trip() {
        let encoded = RawString::encode_zstring("Épée");
        assert_eq!(encoded.last(), Some(&0));
        assert_eq!(RawString::parse_zstring(&encoded).content, "Épée");
    }

    #[test]
    fn test_u32_at_bounds() {
        let data = [1, 0, 0, 0, 2];
        assert_eq!(u32_at(&data, 0), Some(1));
        assert_eq!(u32_at(&data, 2), None);
    }
}
