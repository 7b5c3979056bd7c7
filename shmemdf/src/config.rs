use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::ShmemDfError;

/// Where segment file links live and how long attachment may block.
///
/// Every process exchanging samples on an address must use the same
/// `data_dir`, since the segment rendezvous happens through a file link
/// named exactly as the address inside that directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SegmentConfig {
    /// Directory holding segment file links.
    pub data_dir: String,
    /// How long a source's `touch`/`connect` may poll for a producer before
    /// giving up, in milliseconds. `0` means wait forever.
    pub attach_timeout_ms: u64,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        SegmentConfig {
            data_dir: String::from("/dev/shm"),
            attach_timeout_ms: 0,
        }
    }
}

impl SegmentConfig {
    pub fn attach_deadline(&self) -> Option<Duration> {
        if self.attach_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.attach_timeout_ms))
        }
    }
}

/// Load a component configuration from a TOML file.
///
/// With a key, the named top-level table is deserialized; this lets several
/// components share one file, each reading its own `[key]` table. Without a
/// key the whole document is deserialized.
pub fn load_config<T: DeserializeOwned>(
    path: &Path,
    key: Option<&str>,
) -> Result<T, ShmemDfError> {
    let text = std::fs::read_to_string(path)?;
    let doc: toml::Value = toml::from_str(&text)
        .map_err(|e| ShmemDfError::Config(format!("{}: {}", path.display(), e)))?;

    let value = match key {
        Some(k) => doc
            .get(k)
            .cloned()
            .ok_or_else(|| {
                ShmemDfError::Config(format!("{}: no table '{}'", path.display(), k))
            })?,
        None => doc,
    };

    value
        .try_into()
        .map_err(|e| ShmemDfError::Config(format!("{}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Sample {
        rate_hz: f64,
        segment: SegmentConfig,
    }

    #[test]
    fn keyed_table_is_selected() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(
            f,
            r#"
[gen-a]
rate_hz = 100.0
[gen-a.segment]
data_dir = "/tmp/df"

[gen-b]
rate_hz = 25.0
[gen-b.segment]
"#
        )
        .unwrap();

        let cfg: Sample = load_config(f.path(), Some("gen-a")).unwrap();
        assert_eq!(cfg.rate_hz, 100.0);
        assert_eq!(cfg.segment.data_dir, "/tmp/df");

        let cfg: Sample = load_config(f.path(), Some("gen-b")).unwrap();
        assert_eq!(cfg.rate_hz, 25.0);
        assert_eq!(cfg.segment, SegmentConfig::default());
    }

    #[test]
    fn missing_key_is_a_config_error() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, "rate_hz = 1.0").unwrap();
        let err = load_config::<Sample>(f.path(), Some("nope")).unwrap_err();
        assert!(matches!(err, ShmemDfError::Config(_)));
    }
}
