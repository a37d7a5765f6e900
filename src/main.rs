use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use esp_engine::extractors::{
    ActorFactions, ActorLevels, ChangeReport, EditorIds, Extractor, FactionRelations, FidReplacer, FullNames,
    ItemPrices, ItemStats, ScriptText, SpellRecords,
};
use esp_engine::interchange::{Aliases, BadRow};
use esp_engine::{EspDebugger, GameDescriptor, ModDirectory, ModName, Plugin, Signature};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "esp_engine")]
#[command(about = "读取、重映射并改写 ESP/ESM 插件文件")]
#[command(version)]
struct Cli {
    /// 内置游戏描述（oblivion / skyrim）
    #[arg(long, global = true, default_value = "oblivion")]
    game: String,

    /// 从JSON文件读取游戏描述（优先于 --game）
    #[arg(long, global = true)]
    game_file: Option<PathBuf>,

    /// 数据目录（默认为插件所在目录）
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// 输出更多日志（可重复）
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 显示插件统计信息
    Info {
        plugin: PathBuf,
        /// 把完整结构写入文件
        #[arg(long)]
        dump: Option<PathBuf>,
    },
    /// 完整读取后重新写出，检查是否与原文件逐字节相同
    Rebuild {
        plugin: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// 导出数据表格
    Export {
        kind: Kind,
        plugin: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        /// 法术表包含标志位和效果
        #[arg(long)]
        detailed: bool,
    },
    /// 把数据表格写回插件
    Import {
        kind: Kind,
        csv: PathBuf,
        plugin: PathBuf,
        /// 所属文件改名：OLD=NEW
        #[arg(long = "alias")]
        aliases: Vec<String>,
        #[arg(long)]
        detailed: bool,
        /// 为插件中不存在的脚本新建记录
        #[arg(long)]
        make_new: bool,
        /// FormID替换时也替换记录自身的FormID
        #[arg(long)]
        change_record_ids: bool,
    },
    /// 列出插件实际引用的主文件
    MastersUsed { plugin: PathBuf },
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Kind {
    Names,
    Eids,
    Factions,
    Levels,
    Relations,
    Prices,
    Stats,
    Scripts,
    Spells,
    /// FormID替换表（只能导入）
    Replace,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let game = load_game(&cli)?;

    match &cli.command {
        Command::Info { plugin, dump } => handle_info(&game, plugin, dump.as_deref()),
        Command::Rebuild { plugin, output } => handle_rebuild(&game, plugin, output),
        Command::Export {
            kind,
            plugin,
            output,
            detailed,
        } => handle_export(&cli, &game, *kind, plugin, output, *detailed),
        Command::Import {
            kind,
            csv,
            plugin,
            aliases,
            detailed,
            make_new,
            change_record_ids,
        } => {
            let aliases = parse_aliases(aliases)?;
            if *kind == Kind::Replace {
                return handle_replace(&cli, &game, csv, plugin, &aliases, *change_record_ids);
            }
            handle_import(&cli, &game, *kind, csv, plugin, &aliases, *detailed, *make_new)
        }
        Command::MastersUsed { plugin } => handle_masters_used(&cli, &game, plugin),
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_game(cli: &Cli) -> Result<Arc<GameDescriptor>> {
    let game = match &cli.game_file {
        Some(path) => GameDescriptor::from_file(path).with_context(|| format!("无法读取游戏描述 {:?}", path))?,
        None => GameDescriptor::builtin(&cli.game).with_context(|| format!("未知的游戏: {}", cli.game))?,
    };
    debug!("游戏描述: {}", game.name);
    Ok(Arc::new(game))
}

/// 插件所在的数据目录和插件名
fn locate(cli: &Cli, plugin: &Path) -> Result<(ModDirectory, ModName)> {
    let dir = match (&cli.data_dir, plugin.parent()) {
        (Some(dir), _) => dir.clone(),
        (None, Some(parent)) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let name = plugin
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .with_context(|| format!("不是文件路径: {:?}", plugin))?;
    let dir = ModDirectory::scan(&dir).with_context(|| format!("无法扫描数据目录 {:?}", dir))?;
    Ok((dir, ModName::new(name)))
}

fn parse_aliases(pairs: &[String]) -> Result<Aliases> {
    let mut aliases = Aliases::new();
    for pair in pairs {
        let (old, new) = Aliases::parse_pair(pair).with_context(|| format!("别名格式应为 OLD=NEW: {}", pair))?;
        aliases.insert(old, new);
    }
    Ok(aliases)
}

fn handle_info(game: &Arc<GameDescriptor>, path: &Path, dump: Option<&Path>) -> Result<()> {
    let plugin = Plugin::open(path, Arc::clone(game), false, &game.top_types)
        .with_context(|| format!("无法读取 {:?}", path))?;
    println!("{}", plugin.stats());
    if let Some(dump) = dump {
        EspDebugger::dump_file_structure(&plugin, dump)?;
        println!("结构已写入 {:?}", dump);
    }
    Ok(())
}

fn handle_rebuild(game: &Arc<GameDescriptor>, path: &Path, output: &Path) -> Result<()> {
    let mut plugin = Plugin::open(path, Arc::clone(game), true, &game.top_types)
        .with_context(|| format!("无法读取 {:?}", path))?;
    plugin.save(Some(output)).with_context(|| format!("无法写入 {:?}", output))?;

    match EspDebugger::first_difference(path, output)? {
        None => println!("重建结果与原文件完全相同"),
        Some(offset) => println!("重建结果与原文件不同，首个差异位于偏移 0x{:X}", offset),
    }
    Ok(())
}

fn make_extractor(
    game: &Arc<GameDescriptor>,
    kind: Kind,
    detailed: bool,
    make_new: bool,
) -> Result<Box<dyn Extractor>> {
    let game = Arc::clone(game);
    Ok(match kind {
        Kind::Names => Box::new(FullNames::new(game)),
        Kind::Eids => Box::new(EditorIds::new(game)),
        Kind::Factions => Box::new(ActorFactions::new(game)),
        Kind::Levels => Box::new(ActorLevels::new(game)),
        Kind::Relations => Box::new(FactionRelations::new(game)),
        Kind::Prices => Box::new(ItemPrices::new(game)),
        Kind::Stats => Box::new(ItemStats::new(game)),
        Kind::Scripts => Box::new(ScriptText::new(game).with_make_new(make_new)),
        Kind::Spells => Box::new(SpellRecords::new(game, detailed)?),
        Kind::Replace => bail!("FormID替换表只能导入"),
    })
}

fn log_progress(fraction: f32, message: &str) {
    debug!("{:>3.0}% {}", fraction * 100.0, message);
}

fn handle_export(
    cli: &Cli,
    game: &Arc<GameDescriptor>,
    kind: Kind,
    plugin: &Path,
    output: &Path,
    detailed: bool,
) -> Result<()> {
    let (dir, name) = locate(cli, plugin)?;
    let mut extractor = make_extractor(game, kind, detailed, false)?;
    extractor
        .read_from_file_with_progress(&dir, &name, &log_progress)
        .with_context(|| format!("无法读取 {}", name))?;
    extractor
        .write_to_interchange(output)
        .with_context(|| format!("无法写入 {:?}", output))?;
    println!("已导出到 {:?}", output);
    Ok(())
}

fn report_bad_rows(bad: &[BadRow]) {
    for row in bad {
        warn!("第 {} 行: {} {:?}", row.line, row.reason, row.fields);
    }
    if !bad.is_empty() {
        println!("跳过 {} 行无法解析的数据", bad.len());
    }
}

fn print_report(name: &ModName, report: &ChangeReport) {
    if report.is_empty() {
        println!("{}: 没有变化", name);
        return;
    }
    for (owner, count) in &report.changed {
        println!("{:3} {}", count, owner);
    }
    for (old, new) in &report.renamed {
        println!("    {} >> {}", old, new);
    }
    for (owner, count) in &report.propagated {
        println!("{:3} {} (名称替换)", count, owner);
    }
    for fid in &report.added {
        println!("    新建 {}", fid);
    }
    println!("{}: 共修改 {} 条记录", name, report.total());
}

#[allow(clippy::too_many_arguments)]
fn handle_import(
    cli: &Cli,
    game: &Arc<GameDescriptor>,
    kind: Kind,
    csv: &Path,
    plugin: &Path,
    aliases: &Aliases,
    detailed: bool,
    make_new: bool,
) -> Result<()> {
    let (dir, name) = locate(cli, plugin)?;
    let mut extractor = make_extractor(game, kind, detailed, make_new)?;
    let bad = extractor
        .read_from_interchange(csv, aliases)
        .with_context(|| format!("无法读取表格 {:?}", csv))?;
    report_bad_rows(&bad);

    let report = extractor
        .write_to_file_with_progress(&dir, &name, &log_progress)
        .with_context(|| format!("无法写入 {}", name))?;
    print_report(&name, &report);
    Ok(())
}

fn handle_replace(
    cli: &Cli,
    game: &Arc<GameDescriptor>,
    csv: &Path,
    plugin: &Path,
    aliases: &Aliases,
    change_record_ids: bool,
) -> Result<()> {
    let (dir, name) = locate(cli, plugin)?;
    let mut replacer = FidReplacer::new(Arc::clone(game));
    let bad = replacer
        .read_from_interchange(csv, aliases)
        .with_context(|| format!("无法读取表格 {:?}", csv))?;
    report_bad_rows(&bad);

    // 单元格与世界的层级组不参与替换
    let types: Vec<Signature> = game
        .top_types
        .iter()
        .copied()
        .filter(|sig| *sig != Signature::new(b"CELL") && *sig != Signature::new(b"WRLD"))
        .collect();
    let summary = replacer
        .update_file(&dir, &name, &types, change_record_ids)
        .with_context(|| format!("无法写入 {}", name))?;
    if summary.is_empty() {
        println!("{}: 没有变化", name);
    }
    for entry in &summary {
        println!("{}", entry);
    }
    Ok(())
}

fn handle_masters_used(cli: &Cli, game: &Arc<GameDescriptor>, plugin: &Path) -> Result<()> {
    let (dir, name) = locate(cli, plugin)?;
    let mut loaded = dir
        .open(&name, Arc::clone(game), false, &game.top_types)
        .with_context(|| format!("无法读取 {}", name))?;
    let blocks = loaded.unpack_cell_blocks()?;
    debug!("解析 {} 个延迟的单元格块", blocks);
    loaded.convert_to_long_fids(None)?;
    for master in loaded.masters_used(&dir)? {
        println!("{}", master);
    }
    Ok(())
}
