use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::{
	constants::{DEFAULT_MAX_PARALLEL_STREAMS, DEFAULT_MAX_RETRIES, DEFAULT_TARGET_BATCH_SIZE},
	header_sync::ReaderOptions,
};

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct HeaderSyncSettings {
	pub max_retries: u32,
	pub max_parallel_streams: u32,
	pub target_batch_size: u32,
}

impl Default for HeaderSyncSettings {
	fn default() -> Self {
		Self {
			max_retries: DEFAULT_MAX_RETRIES,
			max_parallel_streams: DEFAULT_MAX_PARALLEL_STREAMS,
			target_batch_size: DEFAULT_TARGET_BATCH_SIZE,
		}
	}
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
	pub header_sync: HeaderSyncSettings,
}

impl Settings {
	/// Load settings from an optional TOML file, overridden by
	/// `DASH_SPV`-prefixed environment variables.
	pub fn load(config_path: &str) -> Result<Self, ConfigError> {
		Config::builder()
			.add_source(File::with_name(config_path).required(false))
			.add_source(Environment::with_prefix("DASH_SPV").separator("__"))
			.build()?
			.try_deserialize()
	}
}

impl From<&HeaderSyncSettings> for ReaderOptions {
	fn from(settings: &HeaderSyncSettings) -> Self {
		Self {
			max_retries: settings.max_retries,
			max_parallel_streams: settings.max_parallel_streams,
			target_batch_size: settings.target_batch_size,
			..Default::default()
		}
	}
}
