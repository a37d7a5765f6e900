use super::{LoadState, Plugin};
use crate::datatypes::{RawString, Signature};
use crate::factory::TopKind;
use crate::form_id::{FidForm, ModName};
use crate::group::{Group, GroupType, LoadContext, RawGroup, TopGroup};
use crate::reader::{ChunkHeader, ModReader};
use crate::record::Record;
use crate::schema::OpaqueSchema;
use crate::subrecord::Subrecord;
use crate::utils::{EspError, Result};
use memmap2::Mmap;
use std::collections::{BTreeSet, HashSet};
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

const HEDR: Signature = Signature::new(b"HEDR");
const MAST: Signature = Signature::new(b"MAST");
const DATA: Signature = Signature::new(b"DATA");
const CNAM: Signature = Signature::new(b"CNAM");
const SNAM: Signature = Signature::new(b"SNAM");

/// 文件头记录（TES4）中的信息
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FileHeader {
    /// 记录标志（主文件、本地化等）
    pub flags: u32,
    pub version: f32,
    /// 记录与组的总数
    pub num_records: u32,
    /// 下一个可分配的对象索引
    pub next_object: u32,
    pub masters: Vec<ModName>,
    pub author: String,
    pub description: String,
}

impl FileHeader {
    /// 从已解包的文件头记录读取
    pub fn from_record(record: &Record) -> Result<Self> {
        let mut header = FileHeader {
            flags: record.flags,
            ..FileHeader::default()
        };
        let mut has_hedr = false;
        for sub in record.subrecords()?.iter() {
            match sub.record_type {
                HEDR => {
                    if sub.data.len() < 12 {
                        return Err(EspError::format(format!("HEDR 长度 {} 不足 12 字节", sub.data.len())));
                    }
                    header.version = f32::from_le_bytes([sub.data[0], sub.data[1], sub.data[2], sub.data[3]]);
                    header.num_records = u32::from_le_bytes([sub.data[4], sub.data[5], sub.data[6], sub.data[7]]);
                    header.next_object = u32::from_le_bytes([sub.data[8], sub.data[9], sub.data[10], sub.data[11]]);
                    has_hedr = true;
                }
                MAST => header
                    .masters
                    .push(ModName::new(RawString::parse_zstring(&sub.data).content)),
                CNAM => header.author = RawString::parse_zstring(&sub.data).content,
                SNAM => header.description = RawString::parse_zstring(&sub.data).content,
                _ => {}
            }
        }
        if !has_hedr {
            return Err(EspError::format("文件头缺少 HEDR"));
        }
        Ok(header)
    }

    /// 只读取文件头（不映射整个文件）
    pub fn read_from_path(path: &Path, header_size: usize) -> Result<Self> {
        let mut file = std::fs::File::open(path)?;
        let name = path.display().to_string();
        let mut head = vec![0u8; header_size];
        file.read_exact(&mut head)
            .map_err(|e| EspError::format(format!("{}: 不是插件文件: {}", name, e)))?;
        if head[0..4] != Signature::TES4.0 {
            return Err(EspError::format(format!("{}: 不是插件文件", name)));
        }

        // 头部之后紧跟负载，读完整个文件头记录再交给读取器
        let size = u32::from_le_bytes([head[4], head[5], head[6], head[7]]) as usize;
        head.resize(header_size + size, 0);
        file.read_exact(&mut head[header_size..])
            .map_err(|e| EspError::format(format!("{}: 文件头被截断: {}", name, e)))?;

        let mut reader = ModReader::new(name.as_str(), &head, header_size);
        let header = match reader.next_header()? {
            ChunkHeader::Record(header) => header,
            ChunkHeader::Group(_) => return Err(EspError::format(format!("{}: 不是插件文件", name))),
        };
        let payload = reader.read_exact(header.size as usize)?.to_vec();
        let record = Record::from_header(&header, payload, Arc::new(OpaqueSchema::new(Signature::TES4)));
        Self::from_record(&record)
    }

    /// 把字段写回文件头记录，返回是否有变化
    pub(crate) fn apply_to(&self, record: &mut Record) -> Result<bool> {
        let mut changed = false;
        if record.flags != self.flags {
            record.flags = self.flags;
            changed = true;
        }

        let current = FileHeader::from_record(record)?;
        let subrecords = record.subrecords_mut()?;

        if current.version != self.version
            || current.num_records != self.num_records
            || current.next_object != self.next_object
        {
            if let Some(hedr) = subrecords.iter_mut().find(|sr| sr.record_type == HEDR) {
                hedr.data[0..4].copy_from_slice(&self.version.to_le_bytes());
                hedr.data[4..8].copy_from_slice(&self.num_records.to_le_bytes());
                hedr.data[8..12].copy_from_slice(&self.next_object.to_le_bytes());
                changed = true;
            }
        }

        for (sig, old, new) in [
            (CNAM, &current.author, &self.author),
            (SNAM, &current.description, &self.description),
        ] {
            if old == new {
                continue;
            }
            let bytes = RawString::encode_zstring(new);
            match subrecords.iter_mut().find(|sr| sr.record_type == sig) {
                Some(sub) => sub.data = bytes,
                None => {
                    let pos = subrecords
                        .iter()
                        .position(|sr| sr.record_type == MAST)
                        .unwrap_or(subrecords.len());
                    subrecords.insert(pos, Subrecord::new(sig, bytes));
                }
            }
            changed = true;
        }

        if current.masters.len() != self.masters.len()
            || current
                .masters
                .iter()
                .zip(&self.masters)
                .any(|(a, b)| a.as_str() != b.as_str())
        {
            let pos = subrecords
                .iter()
                .position(|sr| sr.record_type == MAST)
                .unwrap_or_else(|| {
                    subrecords
                        .iter()
                        .rposition(|sr| matches!(sr.record_type, HEDR | CNAM | SNAM) || sr.record_type.0 == *b"OFST" || sr.record_type.0 == *b"DELE")
                        .map(|i| i + 1)
                        .unwrap_or(subrecords.len())
                });
            subrecords.retain(|sr| sr.record_type != MAST && sr.record_type != DATA);
            let pos = pos.min(subrecords.len());
            let mut pairs = Vec::with_capacity(self.masters.len() * 2);
            for master in &self.masters {
                pairs.push(Subrecord::new(MAST, RawString::encode_zstring(master.as_str())));
                pairs.push(Subrecord::new(DATA, vec![0; 8]));
            }
            subrecords.splice(pos..pos, pairs);
            changed = true;
        }

        if changed {
            record.mark_modified();
        }
        Ok(changed)
    }
}

impl Plugin {
    /// 加载文件
    ///
    /// 失败时回到 `Unloaded` 状态。
    pub fn load(&mut self, unpack: bool) -> Result<()> {
        self.unload();
        self.state = LoadState::Loading;
        let result = self.load_mapped(unpack);
        match result {
            Ok(()) => {
                self.state = LoadState::Loaded;
                Ok(())
            }
            Err(e) => {
                self.unload();
                Err(e)
            }
        }
    }

    fn load_mapped(&mut self, unpack: bool) -> Result<()> {
        let file = std::fs::File::open(&self.path)?;
        // 使用内存映射文件（零拷贝读取，记录负载在解析时复制）
        let mmap = unsafe { Mmap::map(&file)? };
        self.parse(&mmap[..], unpack)
    }

    /// 从内存中的字节加载
    pub fn load_from_bytes(&mut self, data: &[u8], unpack: bool) -> Result<()> {
        self.unload();
        self.state = LoadState::Loading;
        match self.parse(data, unpack) {
            Ok(()) => {
                self.state = LoadState::Loaded;
                Ok(())
            }
            Err(e) => {
                self.unload();
                Err(e)
            }
        }
    }

    fn parse(&mut self, data: &[u8], unpack: bool) -> Result<()> {
        let header_size = self.game.header_size;
        let mut reader = ModReader::new(self.name.as_str(), data, header_size);

        let header = match reader.next_header()? {
            ChunkHeader::Record(header) if header.signature == Signature::TES4 => header,
            other => {
                return Err(reader.format_error(format!("不是插件文件：第一个块为 {}", other.signature())));
            }
        };
        let payload = reader.read_exact(header.size as usize)?;
        let mut header_record =
            Record::from_header(&header, payload.to_vec(), Arc::new(OpaqueSchema::new(Signature::TES4)));
        header_record.unpack()?;
        let file_header = FileHeader::from_record(&header_record)?;

        let mut tops = Vec::new();
        let mut seen = HashSet::new();
        let mut skipped = BTreeSet::new();

        while !reader.at_end() {
            let group_header = match reader.next_header()? {
                ChunkHeader::Group(group) if group.group_type == GroupType::Top => group,
                ChunkHeader::Group(group) => {
                    return Err(reader.format_error(format!(
                        "分组错误：顶层出现类型为 {:?} 的组 {}",
                        group.group_type,
                        group.label_signature()
                    )));
                }
                ChunkHeader::Record(record) => {
                    return Err(reader.format_error(format!(
                        "分组错误：记录 {} 不在任何顶层组中",
                        record.signature
                    )));
                }
            };

            let label = group_header.label_signature();
            if !seen.insert(label) {
                return Err(reader.format_error(format!("重复的顶层组 {}", label)));
            }

            match self.factory.top_kind(label) {
                None => {
                    debug!("跳过顶层组 {}", label);
                    reader.skip(group_header.size as u64 - header_size as u64)?;
                    skipped.insert(label);
                }
                Some(TopKind::Raw) => {
                    tops.push(TopGroup::Raw(RawGroup::read(&mut reader, group_header)?));
                }
                Some(kind) => {
                    let defer = kind == TopKind::Hierarchical && !self.factory.unpack_cell_blocks();
                    let mut ctx = LoadContext {
                        factory: &self.factory,
                        unpack,
                        skipped: &mut skipped,
                    };
                    let group = Group::load(&mut reader, group_header, &mut ctx, defer)?;
                    debug!("加载顶层组 {}: {} 个子元素", label, group.children.len());
                    tops.push(TopGroup::from_group(kind, group));
                }
            }
        }

        debug!(
            "{}: {} 个主文件，{} 个顶层组，跳过 {} 种记录",
            self.name,
            file_header.masters.len(),
            tops.len(),
            skipped.len()
        );

        self.header_record = Some(header_record);
        self.header = file_header;
        self.tops = tops;
        self.skipped = skipped;
        self.fid_form = FidForm::Short;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub(sig: &[u8; 4], data: &[u8]) -> Vec<u8> {
        let mut out = sig.to_vec();
        out.extend_from_slice(&(data.len() as u16).to_le_bytes());
        out.extend_from_slice(data);
        out
    }

    fn header_bytes(masters: &[&str], header_size: usize) -> Vec<u8> {
        let mut hedr = 0.94f32.to_le_bytes().to_vec();
        hedr.extend_from_slice(&3u32.to_le_bytes());
        hedr.extend_from_slice(&0x900u32.to_le_bytes());
        let mut payload = sub(b"HEDR", &hedr);
        payload.extend(sub(b"CNAM", b"Author\0"));
        for master in masters {
            let mut name = master.as_bytes().to_vec();
            name.push(0);
            payload.extend(sub(b"MAST", &name));
            payload.extend(sub(b"DATA", &[0; 8]));
        }

        let mut data = b"TES4".to_vec();
        data.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        data.extend_from_slice(&1u32.to_le_bytes());
        data.resize(header_size, 0);
        data.extend_from_slice(&payload);
        data
    }

    #[test]
    fn test_read_header_with_masters() {
        let dir = tempfile::tempdir().unwrap();
        for header_size in [20, 24] {
            let path = dir.path().join(format!("Test{}.esp", header_size));
            let mut bytes = header_bytes(&["A.esm", "B.esm"], header_size);
            // 文件头之后的组不会被读取
            bytes.extend_from_slice(b"GRUP");
            std::fs::write(&path, bytes).unwrap();

            let header = FileHeader::read_from_path(&path, header_size).unwrap();
            let masters: Vec<&str> = header.masters.iter().map(|m| m.as_str()).collect();
            assert_eq!(masters, ["A.esm", "B.esm"]);
            assert_eq!(header.author, "Author");
            assert_eq!(header.next_object, 0x900);
            assert_eq!(header.flags, 1);
        }
    }

    #[test]
    fn test_read_header_rejects_other_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Text.esp");
        std::fs::write(&path, b"not a plugin file at all").unwrap();
        assert!(matches!(FileHeader::read_from_path(&path, 20), Err(EspError::Format(_))));

        let path = dir.path().join("Short.esp");
        let mut bytes = header_bytes(&["A.esm"], 20);
        bytes.truncate(bytes.len() - 3);
        std::fs::write(&path, bytes).unwrap();
        assert!(matches!(FileHeader::read_from_path(&path, 20), Err(EspError::Format(_))));
    }
}
