//! Declarative map manifests.
//!
//! ```toml
//! [[maps]]
//! name = "ALLOWED_NETS"
//! kind = "lpm_trie"
//! key_size = 12
//! value_size = 4
//! max_entries = 256
//! flags = ["no_prealloc"]
//!
//! [[maps]]
//! name = "EVENTS"
//! kind = "ring_buffer"
//! max_entries = 262144
//! pinning = "by_name"
//! ```

use std::{fs, io, path::Path};

use config::{Config, ConfigError, File, FileFormat};
use probemaps_common::{MapFlags, MapType, Pinning};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::{
    descriptor::{DescriptorBuilder, DescriptorError, MapSpec},
    registry::MapSet,
};

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error(transparent)]
    IO(#[from] io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Descriptor(#[from] DescriptorError),

    #[error("map {map}: unknown flag {flag:?}")]
    UnknownFlag { map: String, flag: String },
}

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default)]
    maps: Vec<MapEntry>,
}

#[derive(Debug, Deserialize)]
struct MapEntry {
    name: String,
    kind: MapType,
    key_size: Option<u32>,
    value_size: Option<u32>,
    max_entries: u32,
    #[serde(default)]
    flags: Vec<String>,
    #[serde(default)]
    pinning: Pinning,
}

impl MapEntry {
    fn into_spec(self) -> Result<MapSpec, ManifestError> {
        let mut flags = MapFlags::empty();
        for flag in &self.flags {
            flags |= MapFlags::from_name(&flag.to_ascii_uppercase()).ok_or_else(|| {
                ManifestError::UnknownFlag {
                    map: self.name.clone(),
                    flag: flag.clone(),
                }
            })?;
        }

        Ok(MapSpec {
            name: self.name,
            kind: self.kind,
            key_size: self.key_size,
            value_size: self.value_size,
            max_entries: self.max_entries,
            flags,
            pinning: self.pinning,
        })
    }
}

/// Parses a TOML manifest and builds the descriptor set it declares.
pub fn parse_manifest(
    content: &str,
    builder: &DescriptorBuilder,
) -> Result<MapSet, ManifestError> {
    let manifest: Manifest = Config::builder()
        .add_source(File::from_str(content, FileFormat::Toml))
        .build()?
        .try_deserialize()?;

    let mut set = MapSet::new();
    for entry in manifest.maps {
        set.insert(builder.build(entry.into_spec()?)?)?;
    }

    Ok(set)
}

pub fn load_manifest<P: AsRef<Path>>(
    path: P,
    builder: &DescriptorBuilder,
) -> Result<MapSet, ManifestError> {
    let path = path.as_ref();
    debug!(path = %path.display(), "loading map manifest");

    let content = fs::read_to_string(path)?;
    parse_manifest(&content, builder)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    static MANIFEST: &str = r#"
[[maps]]
name = "CONNECTIONS"
kind = "hash"
key_size = 8
value_size = 16
max_entries = 1024

[[maps]]
name = "COUNTERS"
kind = "percpu_array"
value_size = 8
max_entries = 4

[[maps]]
name = "ALLOWED_NETS"
kind = "lpm_trie"
key_size = 12
value_size = 4
max_entries = 256
flags = ["no_prealloc"]

[[maps]]
name = "EVENTS"
kind = "ring_buffer"
max_entries = 262144
pinning = "by_name"
"#;

    #[test]
    fn parse() {
        let set = parse_manifest(MANIFEST, &DescriptorBuilder::default()).unwrap();
        let names: Vec<_> = set.iter().map(|d| d.name()).collect();
        assert_eq!(names, ["CONNECTIONS", "COUNTERS", "ALLOWED_NETS", "EVENTS"]);

        let conn = set.get("CONNECTIONS").unwrap();
        assert_eq!(conn.kind(), MapType::Hash);
        assert_eq!(conn.key_size(), 8);
        assert_eq!(conn.value_size(), 16);
        assert_eq!(conn.max_entries(), 1024);

        let counters = set.get("COUNTERS").unwrap();
        assert_eq!(counters.key_size(), 4);

        let nets = set.get("ALLOWED_NETS").unwrap();
        assert_eq!(nets.flags(), MapFlags::NO_PREALLOC);

        let events = set.get("EVENTS").unwrap();
        assert_eq!(events.pinning(), Pinning::ByName);
        assert_eq!(events.key_size(), 0);
    }

    #[test]
    fn empty_manifest() {
        let set = parse_manifest("", &DescriptorBuilder::default()).unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn lpm_trie_without_flag() {
        let manifest = r#"
[[maps]]
name = "ALLOWED_NETS"
kind = "lpm_trie"
key_size = 12
value_size = 4
max_entries = 256
"#;
        let res = parse_manifest(manifest, &DescriptorBuilder::default());
        assert!(matches!(
            res,
            Err(ManifestError::Descriptor(
                DescriptorError::MissingRequiredFlag { .. }
            ))
        ));
    }

    #[test]
    fn duplicate_names() {
        let manifest = r#"
[[maps]]
name = "PIDS"
kind = "hash"
key_size = 4
value_size = 4
max_entries = 16

[[maps]]
name = "PIDS"
kind = "lru_hash"
key_size = 4
value_size = 4
max_entries = 16
"#;
        let res = parse_manifest(manifest, &DescriptorBuilder::default());
        assert!(matches!(
            res,
            Err(ManifestError::Descriptor(DescriptorError::DuplicateName { .. }))
        ));
    }

    #[test]
    fn unknown_flag() {
        let manifest = r#"
[[maps]]
name = "PIDS"
kind = "hash"
key_size = 4
value_size = 4
max_entries = 16
flags = ["no_such_flag"]
"#;
        let res = parse_manifest(manifest, &DescriptorBuilder::default());
        assert!(matches!(res, Err(ManifestError::UnknownFlag { .. })));
    }

    #[test]
    fn unknown_kind() {
        let manifest = r#"
[[maps]]
name = "STACKS"
kind = "stack_trace"
max_entries = 16
"#;
        let res = parse_manifest(manifest, &DescriptorBuilder::default());
        assert!(matches!(res, Err(ManifestError::Config(_))));
    }

    #[test]
    fn load_from_file() {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(MANIFEST.as_bytes()).unwrap();
        let set = load_manifest(f.path(), &DescriptorBuilder::default()).unwrap();
        assert_eq!(set.len(), 4);
    }

    #[test]
    fn missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let res = load_manifest(dir.path().join("maps.toml"), &DescriptorBuilder::default());
        assert!(matches!(res, Err(ManifestError::IO(_))));
    }
}
