use std::time::Duration;

use anyhow::{Context, Result};
use nx_transfer::{DATAGRAM_READ_TIMEOUT, DEFAULT_CHUNK_SIZE, HANDSHAKE_TIMEOUT};

/// Transfer settings shared by every subcommand.
///
/// Read from the environment (and `.env`), then overridden by flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub chunk_size: usize,
    pub handshake_timeout: Duration,
    /// Datagram receive: gap allowed between units after the handshake.
    pub read_timeout: Duration,
    /// Stream connect, ACK wait and payload reads and writes. Unset blocks.
    pub stream_timeout: Option<Duration>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            read_timeout: DATAGRAM_READ_TIMEOUT,
            stream_timeout: None,
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut settings = Self::default();
        if let Some(v) = get("NX_CHUNK_SIZE") {
            settings.chunk_size = v
                .trim()
                .parse()
                .with_context(|| format!("NX_CHUNK_SIZE={:?} is not a byte count", v))?;
        }
        if let Some(ms) = millis(&get, "NX_HANDSHAKE_TIMEOUT_MS")? {
            settings.handshake_timeout = ms;
        }
        if let Some(ms) = millis(&get, "NX_READ_TIMEOUT_MS")? {
            settings.read_timeout = ms;
        }
        // 0 means "no timeout" for stream sockets.
        settings.stream_timeout = millis(&get, "NX_STREAM_TIMEOUT_MS")?.filter(|d| !d.is_zero());
        Ok(settings)
    }

    pub fn with_chunk_size(mut self, chunk_size: Option<usize>) -> Self {
        if let Some(size) = chunk_size {
            self.chunk_size = size;
        }
        self
    }
}

fn millis(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<Duration>> {
    get(key)
        .map(|v| {
            v.trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .with_context(|| format!("{}={:?} is not a number of milliseconds", key, v))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let settings = Settings::from_lookup(lookup(&[])).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.chunk_size, 1024);
        assert_eq!(settings.handshake_timeout, Duration::from_millis(500));
    }

    #[test]
    fn environment_values() {
        let settings = Settings::from_lookup(lookup(&[
            ("NX_CHUNK_SIZE", "4096"),
            ("NX_HANDSHAKE_TIMEOUT_MS", "750"),
            ("NX_READ_TIMEOUT_MS", "10000"),
            ("NX_STREAM_TIMEOUT_MS", "0"),
        ]))
        .unwrap();
        assert_eq!(settings.chunk_size, 4096);
        assert_eq!(settings.handshake_timeout, Duration::from_millis(750));
        assert_eq!(settings.read_timeout, Duration::from_secs(10));
        assert_eq!(settings.stream_timeout, None);
    }

    #[test]
    fn bad_value_names_the_variable() {
        let err = Settings::from_lookup(lookup(&[("NX_READ_TIMEOUT_MS", "soon")])).unwrap_err();
        assert!(err.to_string().contains("NX_READ_TIMEOUT_MS"));
    }

    #[test]
    fn flag_overrides_environment() {
        let settings = Settings::from_lookup(lookup(&[("NX_CHUNK_SIZE", "4096")]))
            .unwrap()
            .with_chunk_size(Some(8192));
        assert_eq!(settings.chunk_size, 8192);
        assert_eq!(settings.clone().with_chunk_size(None).chunk_size, 8192);
    }
}
