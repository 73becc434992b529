use serde::Deserialize;

/// Configuration surface recognized by the core (spec §6). Loaded from an
/// optional TOML file via [`Config::load`] and otherwise defaulted.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Initial connect timeout for the bootstrap port scan, in milliseconds.
    pub connect_timeout_ms: u64,
    /// Multiplier applied to both connect and reply timeouts per scan round.
    pub connect_backoff: u32,
    /// Sleep between bootstrap port-scan rounds, in milliseconds.
    pub connect_sleep_ms: u64,
    /// Overall bootstrap deadline, in seconds.
    pub connect_timelimit_s: u64,
    /// 0 = errors only; increasing values add per-rank diagnostics.
    pub debug_level: u8,
    /// Encoded VAL/DIR size above which the commit engine stores the value
    /// as a separate cache entry and replaces it with a VALREF/DIRREF,
    /// rather than inlining it (spec §4.6 STORE).
    pub inline_value_threshold: usize,
    /// Hop limit for symlink resolution during commit path walks (spec §9).
    pub symlink_hop_limit: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            connect_timeout_ms: 500,
            connect_backoff: 2,
            connect_sleep_ms: 250,
            connect_timelimit_s: 30,
            debug_level: 0,
            inline_value_threshold: 256,
            symlink_hop_limit: 40,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, falling back to defaults for any
    /// key the file does not mention.
    pub fn load(path: &std::path::Path) -> crate::Result<Config> {
        let text = std::fs::read_to_string(path)?;
        let cfg: Config = toml::from_str(&text).map_err(|e| crate::err(crate::ErrorKind::Inval, e.to_string()))?;
        Ok(cfg)
    }

    /// The `tracing` level implied by `debug_level`.
    pub fn trace_level(&self) -> tracing::Level {
        match self.debug_level {
            0 => tracing::Level::WARN,
            1 => tracing::Level::INFO,
            2 => tracing::Level::DEBUG,
            _ => tracing::Level::TRACE,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.connect_backoff, 2);
        assert_eq!(cfg.symlink_hop_limit, 40);
        assert_eq!(cfg.trace_level(), tracing::Level::WARN);
    }

    #[test]
    fn parses_partial_toml() {
        let cfg: Config = toml::from_str("debug_level = 2\nconnect_timelimit_s = 60\n").unwrap();
        assert_eq!(cfg.debug_level, 2);
        assert_eq!(cfg.connect_timelimit_s, 60);
        assert_eq!(cfg.connect_backoff, 2); // default preserved
    }
}
