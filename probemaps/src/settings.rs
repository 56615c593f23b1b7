use std::path::Path;

use config::{Config, ConfigError, Environment, File};

use crate::descriptor::{
    DescriptorBuilder, InvalidPageSize, DEFAULT_MAX_ENTRIES_LIMIT, DEFAULT_PAGE_SIZE,
};

/// Configuration file read when no other path is given.
pub static DEFAULT_CONFIG_PATH: &str = "/etc/probemaps/probemaps.toml";

/// Prefix of environment variables overriding the configuration.
static ENV_PREFIX: &str = "PROBEMAPS";

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Settings {
    /// Check invariants which the kernel would enforce anyway (ring buffer
    /// size, LPM trie key header) before handing descriptors to the loader.
    pub strict_validation: bool,
    /// Also require ring buffer sizes to be a multiple of `page_size`.
    pub ring_buffer_page_aligned: bool,
    /// Page size of the target.
    pub page_size: u32,
    /// Largest accepted `max_entries` for entry-counted maps.
    pub max_entries_limit: u32,
}

impl Settings {
    /// Loads defaults, the optional system-wide configuration file and the
    /// environment, in that order.
    pub fn new() -> Result<Self, ConfigError> {
        Self::build(DEFAULT_CONFIG_PATH, false)
    }

    /// Same as [`Settings::new`], but with a configuration file which has to
    /// exist.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_str().ok_or_else(|| {
            ConfigError::Message(format!(
                "configuration path {} is not valid UTF-8",
                path.as_ref().display()
            ))
        })?;
        Self::build(path, true)
    }

    fn build(path: &str, required: bool) -> Result<Self, ConfigError> {
        let settings: Settings = Config::builder()
            .set_default("strict_validation", true)?
            .set_default("ring_buffer_page_aligned", false)?
            .set_default("page_size", DEFAULT_PAGE_SIZE as i64)?
            .set_default("max_entries_limit", DEFAULT_MAX_ENTRIES_LIMIT as i64)?
            .add_source(File::with_name(path).required(required))
            .add_source(Environment::with_prefix(ENV_PREFIX))
            .build()?
            .try_deserialize()?;

        if !settings.page_size.is_power_of_two() {
            return Err(ConfigError::Message(format!(
                "page_size {} is not a power of two",
                settings.page_size
            )));
        }

        Ok(settings)
    }

    /// Descriptor builder which applies these settings.
    pub fn builder(&self) -> Result<DescriptorBuilder, InvalidPageSize> {
        let builder = DescriptorBuilder::new()
            .strict(self.strict_validation)
            .max_entries_limit(self.max_entries_limit);
        if self.ring_buffer_page_aligned {
            return builder.ring_buffer_page_size(self.page_size);
        }
        Ok(builder)
    }
}
