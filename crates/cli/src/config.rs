//! Command-line configuration management

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::output::OutputFormat;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CliConfig {
    #[serde(default)]
    pub general: GeneralSettings,
    #[serde(default)]
    pub listen: ListenSettings,
    /// Named devices usable with `listen --device`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<DevicePreset>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralSettings {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "GeneralSettings::default_log_level")]
    pub log_level: String,
    /// Raise libusb's own logging to debug
    #[serde(default)]
    pub libusb_debug: bool,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            libusb_debug: false,
        }
    }
}

impl GeneralSettings {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenSettings {
    /// Receive buffer length in bytes
    #[serde(default = "ListenSettings::default_max_length")]
    pub max_length: u32,
    /// How each delivery is printed
    #[serde(default)]
    pub format: OutputFormat,
}

impl Default for ListenSettings {
    fn default() -> Self {
        Self {
            max_length: Self::default_max_length(),
            format: OutputFormat::default(),
        }
    }
}

impl ListenSettings {
    fn default_max_length() -> u32 {
        facade::DEFAULT_MAX_LENGTH as u32
    }
}

/// A named interrupt endpoint
///
/// # Example Configuration
/// ```toml
/// [[devices]]
/// name = "keypad"
/// vendor_id = "0x1234"
/// product_id = "0x5678"
/// endpoint = "0x81"
/// max_length = 8
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevicePreset {
    pub name: String,
    /// Vendor ID, `0x` hex or decimal
    pub vendor_id: String,
    /// Product ID, `0x` hex or decimal
    pub product_id: String,
    /// Endpoint address, `0x` hex or decimal
    pub endpoint: String,
    /// Overrides `[listen] max_length` for this device
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl DevicePreset {
    /// Parsed (vendor id, product id, endpoint)
    pub fn ids(&self) -> Result<(u16, u16, u8)> {
        let vendor_id = parse_u16(&self.vendor_id)
            .map_err(|e| anyhow!("Device '{}': invalid vendor_id: {}", self.name, e))?;
        let product_id = parse_u16(&self.product_id)
            .map_err(|e| anyhow!("Device '{}': invalid product_id: {}", self.name, e))?;
        let endpoint = parse_u8(&self.endpoint)
            .map_err(|e| anyhow!("Device '{}': invalid endpoint: {}", self.name, e))?;
        Ok((vendor_id, product_id, endpoint))
    }
}

impl CliConfig {
    /// Load configuration from the specified path, or the default location
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => expand_path(&p),
            None => {
                let default = Self::default_path();
                if !default.exists() {
                    return Err(anyhow!("No configuration file found, using defaults"));
                }
                default
            }
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: CliConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::debug!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!("{}", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usb-facade").join("config.toml")
        } else {
            PathBuf::from(".config/usb-facade/config.toml")
        }
    }

    /// Look up a device preset by name
    pub fn device(&self, name: &str) -> Option<&DevicePreset> {
        self.devices.iter().find(|d| d.name == name)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if !common::is_valid_log_level(&self.general.log_level) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.general.log_level,
                common::VALID_LOG_LEVELS.join(", ")
            ));
        }

        if self.listen.max_length == 0 {
            return Err(anyhow!("listen.max_length must be at least 1"));
        }

        for (i, preset) in self.devices.iter().enumerate() {
            if preset.name.is_empty() {
                return Err(anyhow!("Device preset #{} has an empty name", i + 1));
            }
            if self.devices[..i].iter().any(|d| d.name == preset.name) {
                return Err(anyhow!("Duplicate device preset '{}'", preset.name));
            }
            if preset.max_length == Some(0) {
                return Err(anyhow!("Device '{}': max_length must be at least 1", preset.name));
            }
            preset.ids()?;
        }

        Ok(())
    }
}

/// Expand a leading `~` in a user supplied path
fn expand_path(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).as_ref())
}

/// Parse a number written as `0x` hex or decimal
pub fn parse_number(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|_| format!("'{}' is not a decimal or 0x-prefixed hex number", s))
}

pub fn parse_u16(s: &str) -> Result<u16, String> {
    let value = parse_number(s)?;
    u16::try_from(value).map_err(|_| format!("{} does not fit in 16 bits", s))
}

pub fn parse_u8(s: &str) -> Result<u8, String> {
    let value = parse_number(s)?;
    u8::try_from(value).map_err(|_| format!("{} does not fit in 8 bits", s))
}
