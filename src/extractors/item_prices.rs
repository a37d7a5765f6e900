use super::{long_fid_of, parse_type, records_of, records_of_mut, ChangeReport, Extractor};
use crate::datatypes::Signature;
use crate::fields::AttrValue;
use crate::form_id::LongFid;
use crate::game::GameDescriptor;
use crate::interchange::{format_object, read_table, Aliases, BadRow, TableWriter};
use crate::plugin::Plugin;
use crate::progress::Progress;
use crate::utils::Result;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// 物品价格
#[derive(Debug, Clone, PartialEq)]
pub struct ItemPrice {
    pub value: i64,
    pub eid: String,
    pub name: String,
}

#[derive(Debug)]
pub struct ItemPrices {
    game: Arc<GameDescriptor>,
    /// 类型 → FormID → 价格
    pub prices: BTreeMap<Signature, BTreeMap<LongFid, ItemPrice>>,
}

impl ItemPrices {
    pub fn new(game: Arc<GameDescriptor>) -> Self {
        ItemPrices {
            game,
            prices: BTreeMap::new(),
        }
    }
}

impl Extractor for ItemPrices {
    fn game(&self) -> &Arc<GameDescriptor> {
        &self.game
    }

    fn read_types(&self) -> Vec<Signature> {
        self.game.prices_types.clone()
    }

    fn read_plugin(&mut self, plugin: &Plugin) -> Result<()> {
        for sig in self.read_types() {
            let table = self.prices.entry(sig).or_default();
            for record in records_of(plugin, sig) {
                let Some(value) = record.attr("value")?.and_then(|v| v.as_int()) else { continue };
                table.insert(
                    long_fid_of(record)?,
                    ItemPrice {
                        value,
                        eid: record.get_editor_id().unwrap_or_default(),
                        name: record.full_name()?.unwrap_or_default(),
                    },
                );
            }
        }
        Ok(())
    }

    fn apply_to_plugin(&self, plugin: &mut Plugin, report: &mut ChangeReport, _progress: &dyn Progress) -> Result<()> {
        for (sig, table) in &self.prices {
            for record in records_of_mut(plugin, *sig) {
                let fid = long_fid_of(record)?;
                let Some(price) = table.get(&fid) else { continue };
                if record.set_attr("value", &AttrValue::Int(price.value))? {
                    report.count(&fid);
                }
            }
        }
        Ok(())
    }

    fn read_from_interchange(&mut self, path: &Path, aliases: &Aliases) -> Result<Vec<BadRow>> {
        let mut bad = Vec::new();
        for row in read_table(path)? {
            if !row.is_data(1) {
                continue;
            }
            let parsed = (
                row.long_fid(0, 1, aliases),
                row.get(2).trim().parse::<i64>().ok(),
                parse_type(row.get(5)),
            );
            let (Some(fid), Some(value), Some(sig)) = parsed else {
                bad.push(row.bad("FormID、价格或类型无效"));
                continue;
            };
            let price = ItemPrice {
                value,
                eid: row.get(3).to_string(),
                name: row.get(4).to_string(),
            };
            self.prices.entry(sig).or_default().insert(fid, price);
        }
        Ok(bad)
    }

    fn write_to_interchange(&self, path: &Path) -> Result<()> {
        let mut writer = TableWriter::create(path)?;
        for (sig, table) in &self.prices {
            if table.is_empty() {
                continue;
            }
            writer.write_row(["Mod Name", "ObjectIndex", "Value", "Editor Id", "Name", "Type"])?;
            let sig = sig.to_string();
            let mut items: Vec<(&LongFid, &ItemPrice)> = table.iter().collect();
            items.sort_by_key(|(fid, price)| (fid.master.clone(), price.eid.to_lowercase()));
            for (fid, price) in items {
                writer.write_row([
                    fid.master.as_str(),
                    &format_object(fid.object),
                    &price.value.to_string(),
                    &price.eid,
                    &price.name,
                    &sig,
                ])?;
            }
        }
        writer.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sections_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prices.csv");
        let game = Arc::new(GameDescriptor::builtin("oblivion").unwrap());

        let mut prices = ItemPrices::new(Arc::clone(&game));
        for (sig, object, value) in [(b"WEAP", 0x801, 25), (b"ARMO", 0x802, 40), (b"WEAP", 0x803, 7)] {
            prices.prices.entry(Signature::new(sig)).or_default().insert(
                LongFid::new("Mod.esp", object),
                ItemPrice {
                    value,
                    eid: format!("Item{:X}", object),
                    name: "Iron, \"old\"".to_string(),
                },
            );
        }
        prices.write_to_interchange(&path).unwrap();

        let rows = read_table(&path).unwrap();
        // 第二种类型前有一行表头
        assert_eq!(rows.len(), 4);
        assert!(!rows[1].is_data(1));

        let mut fresh = ItemPrices::new(game);
        assert!(fresh.read_from_interchange(&path, &Aliases::new()).unwrap().is_empty());
        assert_eq!(fresh.prices, prices.prices);
    }
}
