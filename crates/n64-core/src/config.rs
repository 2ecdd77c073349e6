//! Emulator configuration, read from `N64_*` environment variables.
//!
//! Every value has a default; malformed values are logged and ignored.

use crate::memory::rdram::RDRAM_SIZE;

/// How the machine gets from reset to game code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BootMode {
    /// Skip PIF and IPL3: leave the state IPL3 hands to the game at
    /// 0xA400_0040 in SP DMEM.
    #[default]
    Hle,
    /// Like `Hle`, but also copy the first megabyte of game code to the
    /// header entry point and start there.
    Direct,
    /// Execute a real PIF ROM from the reset vector.
    PifRom,
}

impl BootMode {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "hle" => Some(Self::Hle),
            "direct" => Some(Self::Direct),
            "pif" | "pifrom" => Some(Self::PifRom),
            _ => None,
        }
    }
}

/// Recompiler knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DynarecSettings {
    pub enabled: bool,
    /// Visits before an entry point is compiled.
    pub hot_threshold: u32,
    pub max_block_instructions: u32,
    /// Cached successors run after the first block; 0 disables chaining.
    pub chain_limit: u32,
}

impl Default for DynarecSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            hot_threshold: 64,
            max_block_instructions: 256,
            chain_limit: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmulatorConfig {
    pub dynarec: DynarecSettings,
    /// Retired instructions kept for dumps; 0 disables tracing.
    pub trace_depth: usize,
    pub rdram_size: usize,
    pub boot: BootMode,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            dynarec: DynarecSettings::default(),
            trace_depth: 0,
            rdram_size: RDRAM_SIZE,
            boot: BootMode::default(),
        }
    }
}

fn parse_env_flag(name: &str) -> Option<bool> {
    let raw = std::env::var(name).ok()?;
    let normalized = raw.trim().to_ascii_lowercase();
    if matches!(normalized.as_str(), "" | "0" | "off" | "false" | "no") {
        return Some(false);
    }
    if matches!(
        normalized.as_str(),
        "1" | "on" | "true" | "yes" | "threaded"
    ) {
        return Some(true);
    }
    log::warn!("Unknown {} value {:?}; using default", name, raw);
    None
}

fn parse_env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

fn parse_env_u32_allow_zero(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

impl EmulatorConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let dynarec = DynarecSettings {
            enabled: parse_env_flag("N64_DYNAREC").unwrap_or(defaults.dynarec.enabled),
            hot_threshold: parse_env_u32(
                "N64_DYNAREC_HOT_THRESHOLD",
                defaults.dynarec.hot_threshold,
            ),
            max_block_instructions: parse_env_u32(
                "N64_DYNAREC_MAX_BLOCK_INSNS",
                defaults.dynarec.max_block_instructions,
            ),
            chain_limit: parse_env_u32_allow_zero(
                "N64_DYNAREC_CHAIN_LIMIT",
                defaults.dynarec.chain_limit,
            ),
        };
        let trace_depth =
            parse_env_u32_allow_zero("N64_TRACE_DEPTH", defaults.trace_depth as u32) as usize;

        let rdram_size = match std::env::var("N64_RDRAM_SIZE").ok().as_deref().map(str::trim) {
            None => defaults.rdram_size,
            Some("4") => 4 * 1024 * 1024,
            Some("8") => 8 * 1024 * 1024,
            Some(other) => {
                log::warn!("Unknown N64_RDRAM_SIZE value {:?}; using 8 MiB", other);
                defaults.rdram_size
            }
        };

        let boot = match std::env::var("N64_BOOT") {
            Ok(raw) => BootMode::parse(&raw).unwrap_or_else(|| {
                log::warn!("Unknown N64_BOOT value {:?}; using HLE boot", raw);
                defaults.boot
            }),
            Err(_) => defaults.boot,
        };

        Self {
            dynarec,
            trace_depth,
            rdram_size,
            boot,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_mode_names() {
        assert_eq!(BootMode::parse("HLE"), Some(BootMode::Hle));
        assert_eq!(BootMode::parse(" direct "), Some(BootMode::Direct));
        assert_eq!(BootMode::parse("pif"), Some(BootMode::PifRom));
        assert_eq!(BootMode::parse("cold"), None);
    }

    #[test]
    fn defaults_use_interpreter_and_full_rdram() {
        let config = EmulatorConfig::default();
        assert!(!config.dynarec.enabled);
        assert_eq!(config.rdram_size, 8 * 1024 * 1024);
        assert_eq!(config.trace_depth, 0);
        assert_eq!(config.boot, BootMode::Hle);
    }

    // One test owns every variable it touches, so parallel tests never race.
    #[test]
    fn environment_overrides() {
        std::env::set_var("N64_DYNAREC", "threaded");
        std::env::set_var("N64_DYNAREC_HOT_THRESHOLD", "0");
        std::env::set_var("N64_DYNAREC_CHAIN_LIMIT", "0");
        std::env::set_var("N64_RDRAM_SIZE", "4");
        std::env::set_var("N64_BOOT", "bogus");
        let config = EmulatorConfig::from_env();
        assert!(config.dynarec.enabled);
        assert_eq!(config.dynarec.hot_threshold, 64);
        assert_eq!(config.dynarec.chain_limit, 0);
        assert_eq!(config.rdram_size, 4 * 1024 * 1024);
        assert_eq!(config.boot, BootMode::Hle);
        for name in [
            "N64_DYNAREC",
            "N64_DYNAREC_HOT_THRESHOLD",
            "N64_DYNAREC_CHAIN_LIMIT",
            "N64_RDRAM_SIZE",
            "N64_BOOT",
        ] {
            std::env::remove_var(name);
        }
    }
}
