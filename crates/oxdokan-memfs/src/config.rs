//! Settings for the in-memory volume and the file the binary loads them from.

use std::fs;
use std::path::Path;

use oxdokan_core::MountConfig;
use serde::{Deserialize, Serialize};

use crate::error::MemFsError;

/// Default volume size: 512 MiB.
pub const DEFAULT_CAPACITY: u64 = 512 * 1024 * 1024;

/// Volume-level settings of a [`MemoryFs`](crate::MemoryFs).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemFsConfig {
    /// Label reported by `GetVolumeInformation`; empty defers to the mount.
    pub volume_label: String,
    pub serial_number: u32,
    /// Bytes of file content the volume accepts.
    pub capacity: u64,
    /// Advertise only read-only operations and refuse mutating creates.
    pub read_only: bool,
    pub case_sensitive: bool,
}

impl Default for MemFsConfig {
    fn default() -> Self {
        Self {
            volume_label: "MEMFS".to_string(),
            serial_number: 0x0D0C_A11E,
            capacity: DEFAULT_CAPACITY,
            read_only: false,
            case_sensitive: false,
        }
    }
}

impl MemFsConfig {
    #[must_use]
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    #[must_use]
    pub fn capacity(mut self, capacity: u64) -> Self {
        self.capacity = capacity;
        self
    }

    #[must_use]
    pub fn volume_label(mut self, label: impl Into<String>) -> Self {
        self.volume_label = label.into();
        self
    }

    #[must_use]
    pub fn case_sensitive(mut self, case_sensitive: bool) -> Self {
        self.case_sensitive = case_sensitive;
        self
    }
}

/// JSON document accepted by `oxdokan-memfs serve --config`.
///
/// ```json
/// {
///   "mount": { "mount_point": "M:\\", "unmount_timeout": "5s" },
///   "volume": { "capacity": 1048576, "read_only": true }
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub mount: MountConfig,
    pub volume: MemFsConfig,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, MemFsError> {
        let text = fs::read_to_string(path).map_err(|source| MemFsError::ReadConfig {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text).map_err(|source| MemFsError::ParseConfig {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_partial_document_uses_defaults() {
        let config = FileConfig::parse(r#"{"volume": {"read_only": true}}"#).unwrap();
        assert!(config.volume.read_only);
        assert_eq!(config.volume.capacity, DEFAULT_CAPACITY);
        assert_eq!(config.mount, MountConfig::default());
    }

    #[test]
    fn test_mount_section_parses_durations() {
        let config = FileConfig::parse(
            r#"{"mount": {"mount_point": "Q:\\", "unmount_timeout": "750ms", "single_thread": true}}"#,
        )
        .unwrap();
        assert_eq!(config.mount.mount_point, "Q:\\");
        assert_eq!(config.mount.unmount_timeout, Duration::from_millis(750));
        assert!(config.mount.single_thread);
    }

    #[test]
    fn test_missing_file_reports_path() {
        let err = FileConfig::load(Path::new("definitely/not/here.json")).unwrap_err();
        assert!(matches!(err, MemFsError::ReadConfig { .. }));
        assert!(err.to_string().contains("here.json"));
    }

    #[test]
    fn test_malformed_json_rejected() {
        assert!(FileConfig::parse("{ not json").is_err());
    }
}
