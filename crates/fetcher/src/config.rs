use crate::error::{FetchError, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, path::PathBuf, time::Duration};

pub const DEFAULT_BLOCK_SIZE_POWER: u32 = 16;
pub const MIN_BLOCK_SIZE_POWER: u32 = 4;
pub const MAX_BLOCK_SIZE_POWER: u32 = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Blocks are `2^block_size_power` bytes.
    pub block_size_power: u32,
    /// Reserved for the persistent cache layer; parsed but not enforced here.
    pub local_cache_dir: PathBuf,
    pub local_cache_size: String,
    pub prefetch_blocks: usize,
    /// Upper bound on concurrent network fetches across all handles. 0 = unbounded.
    pub max_concurrent_fetches: usize,
    pub rank_peers_by_latency: bool,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            block_size_power: DEFAULT_BLOCK_SIZE_POWER,
            local_cache_dir: PathBuf::from("./peerfs-data/cache"),
            local_cache_size: "20G".to_string(),
            prefetch_blocks: 0,
            max_concurrent_fetches: 64,
            rank_peers_by_latency: false,
            connect_timeout_secs: 10,
            request_timeout_secs: 30,
        }
    }
}

impl FetchConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            FetchError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let cfg: Self = serde_json::from_str(&raw).map_err(|e| {
            FetchError::Config(format!("failed to parse {}: {e}", path.display()))
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if !(MIN_BLOCK_SIZE_POWER..=MAX_BLOCK_SIZE_POWER).contains(&self.block_size_power) {
            return Err(FetchError::Config(format!(
                "block_size_power must be between {MIN_BLOCK_SIZE_POWER} and {MAX_BLOCK_SIZE_POWER}, got {}",
                self.block_size_power
            )));
        }
        if self.connect_timeout_secs == 0 || self.request_timeout_secs == 0 {
            return Err(FetchError::Config("timeouts must be > 0".to_string()));
        }
        if self.max_concurrent_fetches > tokio::sync::Semaphore::MAX_PERMITS {
            return Err(FetchError::Config(format!(
                "max_concurrent_fetches must be at most {}",
                tokio::sync::Semaphore::MAX_PERMITS
            )));
        }
        parse_byte_size(&self.local_cache_size)?;
        Ok(())
    }

    pub fn block_size(&self) -> usize {
        1usize << self.block_size_power
    }

    pub fn local_cache_bytes(&self) -> Result<u64> {
        parse_byte_size(&self.local_cache_size)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Parses human byte sizes such as `20G`, `1.5 GiB` or `512`.
///
/// Single letters and `xB` suffixes are decimal (`G` = 10^9), `xiB` suffixes
/// are binary (`GiB` = 2^30). Bare numbers are bytes.
pub fn parse_byte_size(input: &str) -> Result<u64> {
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    let value: f64 = number
        .parse()
        .map_err(|_| FetchError::Config(format!("invalid byte size {input:?}")))?;

    let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" => 1_000,
        "m" | "mb" => 1_000_000,
        "g" | "gb" => 1_000_000_000,
        "t" | "tb" => 1_000_000_000_000,
        "p" | "pb" => 1_000_000_000_000_000,
        "ki" | "kib" => 1 << 10,
        "mi" | "mib" => 1 << 20,
        "gi" | "gib" => 1 << 30,
        "ti" | "tib" => 1 << 40,
        "pi" | "pib" => 1 << 50,
        other => {
            return Err(FetchError::Config(format!(
                "unknown byte size unit {other:?} in {input:?}"
            )))
        }
    };

    let bytes = value * multiplier as f64;
    if !bytes.is_finite() || bytes > u64::MAX as f64 {
        return Err(FetchError::Config(format!("byte size {input:?} out of range")));
    }
    Ok(bytes as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_decimal_and_binary_units() {
        assert_eq!(parse_byte_size("20G").unwrap(), 20_000_000_000);
        assert_eq!(parse_byte_size("20 GB").unwrap(), 20_000_000_000);
        assert_eq!(parse_byte_size("1GiB").unwrap(), 1 << 30);
        assert_eq!(parse_byte_size("1.5 KiB").unwrap(), 1536);
        assert_eq!(parse_byte_size("512").unwrap(), 512);
        assert_eq!(parse_byte_size("4k").unwrap(), 4000);
    }

    #[test]
    fn rejects_garbage_sizes() {
        assert!(parse_byte_size("").is_err());
        assert!(parse_byte_size("lots").is_err());
        assert!(parse_byte_size("10 parsecs").is_err());
    }

    #[test]
    fn defaults_are_valid() {
        let cfg = FetchConfig::default();
        cfg.validate().expect("defaults must validate");
        assert_eq!(cfg.block_size(), 65536);
        assert_eq!(cfg.prefetch_blocks, 0);
        assert_eq!(cfg.local_cache_bytes().unwrap(), 20_000_000_000);
    }

    #[test]
    fn block_size_power_is_bounded() {
        let cfg = FetchConfig {
            block_size_power: 31,
            ..FetchConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(FetchError::Config(_))));
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("fetch.json");
        fs::write(&path, r#"{ "block_size_power": 12, "prefetch_blocks": 3 }"#).unwrap();

        let cfg = FetchConfig::load(&path).expect("config should load");
        assert_eq!(cfg.block_size(), 4096);
        assert_eq!(cfg.prefetch_blocks, 3);
        assert_eq!(cfg.local_cache_size, "20G");
        assert!(!cfg.rank_peers_by_latency);
    }
}
