//! 测试用插件构造器（Oblivion 20 字节块头部，Skyrim 24 字节）

#![allow(dead_code)]

use esp_engine::GameDescriptor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// 24 字节布局中记录和组头部末尾的版本字
pub const FORM_VERSION: u32 = 0x2C;

pub fn oblivion() -> Arc<GameDescriptor> {
    Arc::new(GameDescriptor::builtin("oblivion").unwrap())
}

pub fn skyrim() -> Arc<GameDescriptor> {
    Arc::new(GameDescriptor::builtin("skyrim").unwrap())
}

/// 子记录字节
pub fn sub(sig: &[u8; 4], data: &[u8]) -> Vec<u8> {
    let mut out = sig.to_vec();
    out.extend_from_slice(&(data.len() as u16).to_le_bytes());
    out.extend_from_slice(data);
    out
}

pub fn zstring(text: &str) -> Vec<u8> {
    let mut out = text.as_bytes().to_vec();
    out.push(0);
    out
}

/// 完整的记录块
pub fn record_chunk(sig: &[u8; 4], form_id: u32, subrecords: &[Vec<u8>], header_size: usize) -> Vec<u8> {
    let payload = subrecords.concat();
    let mut out = sig.to_vec();
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&form_id.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    if header_size >= 24 {
        out.extend_from_slice(&FORM_VERSION.to_le_bytes());
    }
    out.extend_from_slice(&payload);
    out
}

/// 完整的组块；`label` 为签名或小端编码的整数
pub fn group_chunk(label: [u8; 4], group_type: i32, children: &[Vec<u8>], header_size: usize) -> Vec<u8> {
    let body = children.concat();
    let mut out = b"GRUP".to_vec();
    out.extend_from_slice(&((body.len() + header_size) as u32).to_le_bytes());
    out.extend_from_slice(&label);
    out.extend_from_slice(&group_type.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    if header_size >= 24 {
        out.extend_from_slice(&FORM_VERSION.to_le_bytes());
    }
    out.extend_from_slice(&body);
    out
}

/// 数据中的记录与组总数（文件头 HEDR 中的计数）
fn count_chunks(data: &[u8], header_size: usize) -> u32 {
    let mut count = 0;
    let mut pos = 0;
    while pos < data.len() {
        let size = u32::from_le_bytes([data[pos + 4], data[pos + 5], data[pos + 6], data[pos + 7]]) as usize;
        count += 1;
        if &data[pos..pos + 4] == b"GRUP" {
            count += count_chunks(&data[pos + header_size..pos + size], header_size);
            pos += size;
        } else {
            pos += header_size + size;
        }
    }
    count
}

/// 角色属性子记录：等级偏移标志、等级、最小/最大等级
pub fn acbs(pc_level_offset: bool, level: i16, calc_min: u16, calc_max: u16) -> Vec<u8> {
    let mut data = vec![0u8; 16];
    if pc_level_offset {
        data[0] = 0x80;
    }
    data[10..12].copy_from_slice(&level.to_le_bytes());
    data[12..14].copy_from_slice(&calc_min.to_le_bytes());
    data[14..16].copy_from_slice(&calc_max.to_le_bytes());
    data
}

/// 阵营成员子记录
pub fn faction_entry(faction: u32, rank: u8) -> Vec<u8> {
    let mut data = faction.to_le_bytes().to_vec();
    data.push(rank);
    data.extend_from_slice(&[0x4F, 0x44, 0x42]);
    data
}

struct TestRecord {
    sig: [u8; 4],
    form_id: u32,
    subrecords: Vec<Vec<u8>>,
}

/// 逐条添加记录，按顶层类型分组写出
#[derive(Default)]
pub struct PluginBuilder {
    game: &'static str,
    masters: Vec<String>,
    next_object: u32,
    records: Vec<TestRecord>,
    /// 预先构造的顶层组内容（单元格、世界和话题层级）
    tops: Vec<([u8; 4], Vec<Vec<u8>>)>,
}

impl PluginBuilder {
    pub fn new() -> Self {
        PluginBuilder {
            game: "oblivion",
            next_object: 0x800,
            ..PluginBuilder::default()
        }
    }

    /// 24 字节头部布局
    pub fn skyrim() -> Self {
        PluginBuilder {
            game: "skyrim",
            ..PluginBuilder::new()
        }
    }

    pub fn game(&self) -> Arc<GameDescriptor> {
        Arc::new(GameDescriptor::builtin(self.game).unwrap())
    }

    pub fn header_size(&self) -> usize {
        self.game().header_size
    }

    pub fn master(mut self, name: &str) -> Self {
        self.masters.push(name.to_string());
        self
    }

    pub fn next_object(mut self, object: u32) -> Self {
        self.next_object = object;
        self
    }

    /// 添加记录；`subrecords` 为已编码的子记录
    pub fn record(mut self, sig: &[u8; 4], form_id: u32, subrecords: &[Vec<u8>]) -> Self {
        self.records.push(TestRecord {
            sig: *sig,
            form_id,
            subrecords: subrecords.to_vec(),
        });
        self
    }

    /// 添加顶层组的子块（用 `record_chunk` / `group_chunk` 构造）
    pub fn top(mut self, label: &[u8; 4], children: Vec<Vec<u8>>) -> Self {
        self.tops.push((*label, children));
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let game = self.game();
        let header_size = game.header_size;
        let mut body = Vec::new();
        for top in &game.top_types {
            let mut children: Vec<Vec<u8>> = self
                .records
                .iter()
                .filter(|r| r.sig == top.0)
                .map(|r| record_chunk(&r.sig, r.form_id, &r.subrecords, header_size))
                .collect();
            for (label, prebuilt) in &self.tops {
                if *label == top.0 {
                    children.extend(prebuilt.iter().cloned());
                }
            }
            if children.is_empty() {
                continue;
            }
            body.extend(group_chunk(top.0, 0, &children, header_size));
        }

        let mut hedr = 1.0f32.to_le_bytes().to_vec();
        hedr.extend_from_slice(&count_chunks(&body, header_size).to_le_bytes());
        hedr.extend_from_slice(&self.next_object.to_le_bytes());
        let mut header = sub(b"HEDR", &hedr);
        for master in &self.masters {
            header.extend(sub(b"MAST", &zstring(master)));
            header.extend(sub(b"DATA", &[0; 8]));
        }

        let mut data = b"TES4".to_vec();
        data.extend_from_slice(&(header.len() as u32).to_le_bytes());
        data.resize(header_size, 0);
        data.extend_from_slice(&header);
        data.extend_from_slice(&body);
        data
    }

    pub fn write(&self, dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, self.build()).unwrap();
        path
    }
}
