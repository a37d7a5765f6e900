//! 游戏变体描述：头部大小、顶层组顺序、记录结构以及各提取器使用的类型表。

use crate::datatypes::Signature;
use crate::factory::{LoadFactory, CELL_TYPES};
use crate::form_id::ModName;
use crate::schema::{DescribedSchema, OpaqueSchema, RecordSchema};
use crate::utils::{EspError, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

const OBLIVION_JSON: &str = include_str!("../data/games/oblivion.json");
const SKYRIM_JSON: &str = include_str!("../data/games/skyrim.json");

fn default_header_size() -> usize {
    20
}

/// 游戏描述
#[derive(Debug, Clone, Deserialize)]
pub struct GameDescriptor {
    pub name: String,
    /// 游戏主文件（按优先级）
    pub master_files: Vec<String>,
    /// 块头部大小：20 或 24
    #[serde(default = "default_header_size")]
    pub header_size: usize,
    /// 有主文件时低位保留区间可分配到任意槽位
    #[serde(default)]
    pub expanded_plugin_range: bool,
    /// 顶层组的规范顺序
    pub top_types: Vec<Signature>,
    #[serde(default)]
    pub names_types: Vec<Signature>,
    #[serde(default)]
    pub prices_types: Vec<Signature>,
    /// 类型 → 属性名（`eid` 表示编辑器ID）
    #[serde(default)]
    pub stats_types: BTreeMap<Signature, Vec<String>>,
    #[serde(default)]
    pub actor_values: Vec<String>,
    /// 魔法效果代码 → 学派
    #[serde(default)]
    pub mgef_school: BTreeMap<String, u32>,
    /// 魔法效果代码 → 显示名称
    #[serde(default)]
    pub mgef_names: BTreeMap<String, String>,
    #[serde(default)]
    pub hostile_effects: Vec<String>,
    #[serde(default)]
    pub records: Vec<DescribedSchema>,
    #[serde(skip)]
    index: HashMap<Signature, Arc<dyn RecordSchema>>,
}

impl GameDescriptor {
    /// 内置的游戏描述
    pub fn builtin(name: &str) -> Result<Self> {
        let json = match name.to_ascii_lowercase().as_str() {
            "oblivion" => OBLIVION_JSON,
            "skyrim" => SKYRIM_JSON,
            other => return Err(EspError::schema(format!("未知游戏: {}", other))),
        };
        Self::from_json(json)
    }

    /// 从用户提供的JSON文件加载
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let mut game: GameDescriptor = serde_json::from_str(json)?;
        if game.header_size != 20 && game.header_size != 24 {
            return Err(EspError::schema(format!(
                "{}: 头部大小必须为 20 或 24，得到 {}",
                game.name, game.header_size
            )));
        }
        for schema in &game.records {
            if game.index.contains_key(&schema.signature) {
                return Err(EspError::schema(format!("{}: 重复的记录结构 {}", game.name, schema.signature)));
            }
            game.index.insert(schema.signature, Arc::new(schema.clone()));
        }
        debug!("游戏描述 {}: {} 个记录结构", game.name, game.index.len());
        Ok(game)
    }

    /// 签名对应的结构；未描述的签名为不透明结构
    pub fn schema(&self, sig: Signature) -> Arc<dyn RecordSchema> {
        match self.index.get(&sig) {
            Some(schema) => Arc::clone(schema),
            None => Arc::new(OpaqueSchema::new(sig)),
        }
    }

    pub fn is_described(&self, sig: Signature) -> bool {
        self.index.contains_key(&sig)
    }

    pub fn is_top_type(&self, sig: Signature) -> bool {
        self.top_types.contains(&sig)
    }

    /// 构造加载工厂
    ///
    /// 全保留模式下，已描述的单元格类型也会登记，保证单元格内的引用能完整转换。
    pub fn factory(&self, keep_all: bool, types: &[Signature]) -> LoadFactory {
        let mut factory = LoadFactory::new(keep_all);
        for sig in types {
            factory.add_schema(self.schema(*sig));
        }
        if keep_all && factory.top_types().contains(&Signature::new(b"CELL")) {
            for cell_type in CELL_TYPES {
                let sig = Signature::new(cell_type);
                if self.is_described(sig) {
                    factory.add_schema(self.schema(sig));
                }
            }
        }
        factory
    }

    /// 游戏主文件名
    pub fn master_names(&self) -> Vec<ModName> {
        self.master_files.iter().map(|name| ModName::new(name.as_str())).collect()
    }

    /// 属性值编号对应的名称
    pub fn actor_value_name(&self, index: i64) -> Option<&str> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.actor_values.get(i))
            .map(String::as_str)
    }

    /// 按名称（大小写不敏感）查找属性值编号
    pub fn actor_value_index(&self, name: &str) -> Option<i64> {
        self.actor_values
            .iter()
            .position(|v| v.eq_ignore_ascii_case(name))
            .map(|i| i as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::TopKind;

    #[test]
    fn test_builtin_descriptors() {
        let oblivion = GameDescriptor::builtin("Oblivion").unwrap();
        assert_eq!(oblivion.header_size, 20);
        assert!(!oblivion.expanded_plugin_range);
        assert!(oblivion.is_top_type(Signature::new(b"NPC_")));
        assert!(oblivion.is_described(Signature::new(b"SPEL")));
        assert!(oblivion.schema(Signature::new(b"SPEL")).effects().is_some());
        assert!(oblivion.schema(Signature::new(b"STAT")).is_opaque());
        assert_eq!(oblivion.actor_value_name(0), Some("Strength"));
        assert_eq!(oblivion.actor_value_index("luck"), Some(7));

        let skyrim = GameDescriptor::builtin("skyrim").unwrap();
        assert_eq!(skyrim.header_size, 24);

        assert!(GameDescriptor::builtin("morrowind").is_err());
    }

    #[test]
    fn test_stats_attrs_exist() {
        for game in ["oblivion", "skyrim"] {
            let game = GameDescriptor::builtin(game).unwrap();
            for (sig, attrs) in &game.stats_types {
                let schema = game.schema(*sig);
                for attr in attrs.iter().filter(|a| a.as_str() != "eid") {
                    assert!(schema.attr(attr).is_some(), "{} {} 缺少属性 {}", game.name, sig, attr);
                }
            }
            for sig in &game.prices_types {
                assert!(game.schema(*sig).attr("value").is_some(), "{} {}", game.name, sig);
            }
        }
    }

    #[test]
    fn test_factory_keep_all_upgrades_cell_types() {
        let game = GameDescriptor::builtin("oblivion").unwrap();
        let factory = game.factory(true, &[Signature::new(b"CELL")]);
        assert_eq!(factory.top_kind(Signature::new(b"CELL")), Some(TopKind::Hierarchical));
        let refr = factory.class_for(Signature::new(b"REFR")).unwrap();
        assert!(!refr.is_opaque());
    }

    #[test]
    fn test_invalid_header_size() {
        let json = r#"{"name": "Bad", "master_files": [], "header_size": 16, "top_types": []}"#;
        assert!(matches!(GameDescriptor::from_json(json), Err(EspError::Schema(_))));
    }
}
