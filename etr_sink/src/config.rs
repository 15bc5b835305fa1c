// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::Error;
use etr_regs::MemWidth;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Trace buffers are allocated in whole pages
pub const PAGE_SIZE: usize = 4096;

/// Buffer size used when a config doesn't give one
pub const DEFAULT_BUFFER_SIZE: usize = 1024 * 1024;

/// Optional features of a particular TMC integration.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Capabilities {
    /// The unit keeps its pointers across power-down, so they have to be
    /// reset to the buffer base whenever a capture is armed.
    #[serde(default)]
    pub save_restore: bool,

    /// AXICTL has read cache attribute bits that should be programmed.
    #[serde(default)]
    pub axi_arcache: bool,
}

/// Struct defining the TOML description of one trace sink, e.g.
///
/// ```toml
/// name = "etr0"
/// buffer-size = 0x100000
/// mem-width-bits = 64
///
/// [capabilities]
/// save-restore = true
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct SinkConfig {
    /// Device name, used as the registry key
    pub name: String,

    /// Size of the hardware buffer in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Width of the trace memory interface
    #[serde(rename = "mem-width-bits")]
    pub mem_width: MemWidth,

    #[serde(default)]
    pub capabilities: Capabilities,

    #[serde(default)]
    pub trigger_counter: u32,
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

impl SinkConfig {
    pub fn new(name: impl Into<String>, buffer_size: usize, mem_width: MemWidth) -> SinkConfig {
        SinkConfig {
            name: name.into(),
            buffer_size,
            mem_width,
            capabilities: Capabilities::default(),
            trigger_counter: 0,
        }
    }

    /// Parse and validate a TOML description
    pub fn from_toml(text: &str) -> Result<SinkConfig, Error> {
        let cfg: SinkConfig = toml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<SinkConfig, Error> {
        let text = std::fs::read_to_string(path)?;
        SinkConfig::from_toml(&text)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.name.is_empty() {
            return Err(Error::InvalidConfig("sink name is empty".to_string()));
        }
        check_buffer_size(self.buffer_size)?;
        // RSZ holds the size in 32-bit words
        if u32::try_from(self.buffer_size / 4).is_err() {
            return Err(Error::InvalidConfig(format!(
                "buffer size {:#x} is too large for the RAM size register",
                self.buffer_size
            )));
        }
        Ok(())
    }

    /// Granularity of read pointer adjustments
    pub fn rrp_alignment(&self) -> usize {
        self.mem_width.rrp_alignment() as usize
    }
}

/// Buffers must be a whole, non-zero number of pages
pub fn check_buffer_size(size: usize) -> Result<(), Error> {
    if size == 0 || size % PAGE_SIZE != 0 {
        return Err(Error::InvalidConfig(format!(
            "buffer size {size:#x} is not a non-zero multiple of {PAGE_SIZE:#x}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_config() {
        let cfg = SinkConfig::from_toml(
            r#"
            name = "etr0"
            buffer-size = 0x10000
            mem-width-bits = 256
            trigger-counter = 16

            [capabilities]
            save-restore = true
            "#,
        )
        .unwrap();

        assert_eq!(cfg.name, "etr0");
        assert_eq!(cfg.buffer_size, 0x10000);
        assert_eq!(cfg.mem_width, MemWidth::Bits256);
        assert_eq!(cfg.rrp_alignment(), 32);
        assert_eq!(cfg.trigger_counter, 16);
        assert!(cfg.capabilities.save_restore);
        assert!(!cfg.capabilities.axi_arcache);
    }

    #[test]
    fn defaults() {
        let cfg = SinkConfig::from_toml("name = \"etr1\"\nmem-width-bits = 64\n").unwrap();
        assert_eq!(cfg.buffer_size, DEFAULT_BUFFER_SIZE);
        assert_eq!(cfg.capabilities, Capabilities::default());
        assert_eq!(cfg.rrp_alignment(), 16);
    }

    #[test]
    fn rejects_bad_configs() {
        assert!(matches!(
            SinkConfig::from_toml("name = \"x\"\nmem-width-bits = 48\n"),
            Err(Error::ConfigParse(_))
        ));
        assert!(matches!(
            SinkConfig::from_toml("name = \"x\"\nmem-width-bits = 64\ncolour = 1\n"),
            Err(Error::ConfigParse(_))
        ));
        assert!(matches!(
            SinkConfig::from_toml("name = \"x\"\nmem-width-bits = 64\nbuffer-size = 5000\n"),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            SinkConfig::new("", PAGE_SIZE, MemWidth::Bits32).validate(),
            Err(Error::InvalidConfig(_))
        ));
    }
}
