pub mod datatypes;
pub mod debug;
pub mod extractors;
pub mod factory;
pub mod fields;
pub mod form_id;
pub mod game;
pub mod group;
pub mod interchange;
pub mod mod_dir;
pub mod plugin;
pub mod progress;
pub mod reader;
pub mod record;
pub mod schema;
pub mod subrecord;
pub mod utils;

// 重新导出主要结构
pub use datatypes::{RecordFlags, Signature};
pub use debug::EspDebugger;
pub use form_id::{FormId, LongFid, ModName};
pub use game::GameDescriptor;
pub use group::{Group, RecordGroup, TopGroup};
pub use mod_dir::ModDirectory;
pub use plugin::Plugin;
pub use record::Record;
pub use subrecord::Subrecord;
pub use utils::{EspError, Result};

// 常量定义
pub const SUPPORTED_EXTENSIONS: &[&str] = &["esp", "esm", "esl"];
