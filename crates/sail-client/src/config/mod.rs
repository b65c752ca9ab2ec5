pub mod loader;
pub mod meta;

pub use meta::{LogLevel, MetaConfig, RawMetaConfig};
