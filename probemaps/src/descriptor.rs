use std::mem;

use probemaps_common::{LpmKey, MapFlags, MapType, Pinning, LPM_PREFIX_LEN_SIZE};
use thiserror::Error;
use tracing::debug;

/// Page size assumed when no settings are given.
pub const DEFAULT_PAGE_SIZE: u32 = 4096;

/// Longest accepted map name. Pinned maps use the name as a file name.
/// The kernel object name is the name cut down to 15 bytes.
pub const MAX_NAME_LEN: usize = 255;

/// Upper bound of `max_entries` assumed when no settings are given.
pub const DEFAULT_MAX_ENTRIES_LIMIT: u32 = 1 << 24;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("map {name}: invalid capacity {max_entries}: {reason}")]
    InvalidCapacity {
        name: String,
        max_entries: u32,
        reason: &'static str,
    },

    #[error("map {name}: invalid key/value shape for {kind}: {reason}")]
    InvalidKeyValueShape {
        name: String,
        kind: MapType,
        reason: &'static str,
    },

    #[error("map {name}: {kind} requires flags {flags:?}")]
    MissingRequiredFlag {
        name: String,
        kind: MapType,
        flags: MapFlags,
    },

    #[error("map {name}: {kind} does not accept flags {flags:?}")]
    UnsupportedFlag {
        name: String,
        kind: MapType,
        flags: MapFlags,
    },

    #[error("invalid map name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },

    #[error("map {name} is declared more than once")]
    DuplicateName { name: String },
}

/// Raw, untyped declaration of a map. `None` sizes mean "not declared";
/// kinds with an implicit key or value fill them in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MapSpec {
    pub name: String,
    pub kind: MapType,
    pub key_size: Option<u32>,
    pub value_size: Option<u32>,
    pub max_entries: u32,
    pub flags: MapFlags,
    pub pinning: Pinning,
}

impl MapSpec {
    pub fn new(name: &str, kind: MapType, max_entries: u32) -> Self {
        MapSpec {
            name: name.to_owned(),
            kind,
            key_size: None,
            value_size: None,
            max_entries,
            flags: MapFlags::empty(),
            pinning: Pinning::None,
        }
    }

    pub fn key_size(mut self, key_size: u32) -> Self {
        self.key_size = Some(key_size);
        self
    }

    pub fn value_size(mut self, value_size: u32) -> Self {
        self.value_size = Some(value_size);
        self
    }

    pub fn flags(mut self, flags: MapFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn pinning(mut self, pinning: Pinning) -> Self {
        self.pinning = pinning;
        self
    }
}

/// Validated declaration of a map. Once built, a descriptor is never
/// mutated; the loader reads it exactly once to create the map.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MapDescriptor {
    name: String,
    kind: MapType,
    key_size: u32,
    value_size: u32,
    max_entries: u32,
    flags: MapFlags,
    pinning: Pinning,
}

impl MapDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> MapType {
        self.kind
    }

    pub fn key_size(&self) -> u32 {
        self.key_size
    }

    pub fn value_size(&self) -> u32 {
        self.value_size
    }

    pub fn max_entries(&self) -> u32 {
        self.max_entries
    }

    pub fn flags(&self) -> MapFlags {
        self.flags
    }

    pub fn pinning(&self) -> Pinning {
        self.pinning
    }

    /// Returns the descriptor with a different set of creation flags.
    /// Flags are checked against the kind again, so a trie can't lose its
    /// `NO_PREALLOC` this way.
    pub fn with_flags(self, flags: MapFlags) -> Result<Self, DescriptorError> {
        check_flags(&self.name, self.kind, flags)?;
        Ok(MapDescriptor { flags, ..self })
    }

    pub fn with_pinning(self, pinning: Pinning) -> Self {
        MapDescriptor { pinning, ..self }
    }

    pub fn hash<K, V>(name: &str, max_entries: u32) -> Result<Self, DescriptorError> {
        DescriptorBuilder::default().hash::<K, V>(name, max_entries)
    }

    pub fn lru_hash<K, V>(name: &str, max_entries: u32) -> Result<Self, DescriptorError> {
        DescriptorBuilder::default().lru_hash::<K, V>(name, max_entries)
    }

    pub fn array<V>(name: &str, max_entries: u32) -> Result<Self, DescriptorError> {
        DescriptorBuilder::default().array::<V>(name, max_entries)
    }

    pub fn percpu_array<V>(name: &str, max_entries: u32) -> Result<Self, DescriptorError> {
        DescriptorBuilder::default().percpu_array::<V>(name, max_entries)
    }

    pub fn prog_array(name: &str, max_entries: u32) -> Result<Self, DescriptorError> {
        DescriptorBuilder::default().prog_array(name, max_entries)
    }

    pub fn perf_output(name: &str, max_entries: u32) -> Result<Self, DescriptorError> {
        DescriptorBuilder::default().perf_output(name, max_entries)
    }

    pub fn ring_buffer(name: &str, size: u32) -> Result<Self, DescriptorError> {
        DescriptorBuilder::default().ring_buffer(name, size)
    }

    pub fn lpm_trie<K, V>(name: &str, max_entries: u32) -> Result<Self, DescriptorError> {
        DescriptorBuilder::default().lpm_trie::<K, V>(name, max_entries)
    }

    pub fn from_spec(spec: MapSpec) -> Result<Self, DescriptorError> {
        DescriptorBuilder::default().build(spec)
    }
}

/// Builds descriptors, one constructor per map kind.
///
/// In strict mode the builder also checks invariants which the kernel
/// enforces anyway (ring buffer size is a power of two, LPM key header), so
/// a bad declaration is reported before anything reaches the loader.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescriptorBuilder {
    strict: bool,
    /// Ring buffer sizes must be a multiple of it when set. Always a power
    /// of two.
    ring_buffer_page_size: Option<u32>,
    max_entries_limit: u32,
}

impl Default for DescriptorBuilder {
    fn default() -> Self {
        DescriptorBuilder {
            strict: true,
            ring_buffer_page_size: None,
            max_entries_limit: DEFAULT_MAX_ENTRIES_LIMIT,
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("page size {0} is not a power of two")]
pub struct InvalidPageSize(pub u32);

impl DescriptorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables or disables the checks the kernel would do on its own.
    pub fn strict(self, strict: bool) -> Self {
        DescriptorBuilder { strict, ..self }
    }

    pub fn max_entries_limit(self, max_entries_limit: u32) -> Self {
        DescriptorBuilder {
            max_entries_limit,
            ..self
        }
    }

    /// Requires ring buffer sizes to be a multiple of `page_size`, as the
    /// kernel does when the map is created. Only checked in strict mode.
    pub fn ring_buffer_page_size(self, page_size: u32) -> Result<Self, InvalidPageSize> {
        if !page_size.is_power_of_two() {
            return Err(InvalidPageSize(page_size));
        }
        Ok(DescriptorBuilder {
            ring_buffer_page_size: Some(page_size),
            ..self
        })
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    pub fn ring_buffer_alignment(&self) -> Option<u32> {
        self.ring_buffer_page_size
    }

    pub fn entries_limit(&self) -> u32 {
        self.max_entries_limit
    }
}

impl DescriptorBuilder {
    /// Hash table with arbitrary fixed-size keys and values. Inserting into
    /// a full map fails.
    pub fn hash<K, V>(
        &self,
        name: &str,
        max_entries: u32,
    ) -> Result<MapDescriptor, DescriptorError> {
        self.typed::<K, V>(name, MapType::Hash, max_entries, MapFlags::empty())
    }

    /// Hash table which evicts the least recently used entry when full.
    pub fn lru_hash<K, V>(
        &self,
        name: &str,
        max_entries: u32,
    ) -> Result<MapDescriptor, DescriptorError> {
        self.typed::<K, V>(name, MapType::LruHash, max_entries, MapFlags::empty())
    }

    /// Array of `max_entries` slots indexed by `u32`.
    pub fn array<V>(
        &self,
        name: &str,
        max_entries: u32,
    ) -> Result<MapDescriptor, DescriptorError> {
        self.typed::<u32, V>(name, MapType::Array, max_entries, MapFlags::empty())
    }

    /// Array with a private copy per CPU. Readers have to aggregate the
    /// per-CPU values themselves.
    pub fn percpu_array<V>(
        &self,
        name: &str,
        max_entries: u32,
    ) -> Result<MapDescriptor, DescriptorError> {
        self.typed::<u32, V>(name, MapType::PercpuArray, max_entries, MapFlags::empty())
    }

    /// Tail call dispatch table holding program file descriptors.
    pub fn prog_array(
        &self,
        name: &str,
        max_entries: u32,
    ) -> Result<MapDescriptor, DescriptorError> {
        self.typed::<u32, u32>(name, MapType::ProgArray, max_entries, MapFlags::empty())
    }

    /// Per-CPU perf event buffers. `max_entries` is the number of CPU slots.
    pub fn perf_output(
        &self,
        name: &str,
        max_entries: u32,
    ) -> Result<MapDescriptor, DescriptorError> {
        self.build(MapSpec::new(name, MapType::PerfOutput, max_entries))
    }

    /// Single ring shared by all CPUs, `size` in bytes.
    pub fn ring_buffer(&self, name: &str, size: u32) -> Result<MapDescriptor, DescriptorError> {
        self.build(MapSpec::new(name, MapType::RingBuffer, size))
    }

    /// Longest prefix match trie. `K` is the matched data, the key stored in
    /// the map is `LpmKey<K>`. `NO_PREALLOC` is always set.
    pub fn lpm_trie<K, V>(
        &self,
        name: &str,
        max_entries: u32,
    ) -> Result<MapDescriptor, DescriptorError> {
        self.typed::<LpmKey<K>, V>(name, MapType::LpmTrie, max_entries, MapFlags::NO_PREALLOC)
    }

    fn typed<K, V>(
        &self,
        name: &str,
        kind: MapType,
        max_entries: u32,
        flags: MapFlags,
    ) -> Result<MapDescriptor, DescriptorError> {
        let key_size = type_size::<K>(name, kind)?;
        let value_size = type_size::<V>(name, kind)?;
        self.build(
            MapSpec::new(name, kind, max_entries)
                .key_size(key_size)
                .value_size(value_size)
                .flags(flags),
        )
    }

    /// Validates a raw declaration and turns it into a descriptor.
    pub fn build(&self, spec: MapSpec) -> Result<MapDescriptor, DescriptorError> {
        check_name(&spec.name)?;
        self.check_capacity(&spec)?;
        let (key_size, value_size) = self.resolve_shape(&spec)?;
        check_flags(&spec.name, spec.kind, spec.flags)?;

        debug!(
            map = spec.name.as_str(),
            kind = spec.kind.as_str(),
            key_size = key_size,
            value_size = value_size,
            max_entries = spec.max_entries,
            "declared map"
        );

        Ok(MapDescriptor {
            name: spec.name,
            kind: spec.kind,
            key_size,
            value_size,
            max_entries: spec.max_entries,
            flags: spec.flags,
            pinning: spec.pinning,
        })
    }

    fn check_capacity(&self, spec: &MapSpec) -> Result<(), DescriptorError> {
        let invalid = |reason| DescriptorError::InvalidCapacity {
            name: spec.name.clone(),
            max_entries: spec.max_entries,
            reason,
        };

        if spec.max_entries == 0 {
            return Err(invalid("max_entries must be greater than zero"));
        }
        // Ring buffers are sized in bytes, the entry limit doesn't apply.
        if !spec.kind.capacity_in_bytes() && spec.max_entries > self.max_entries_limit {
            return Err(invalid("max_entries exceeds the configured limit"));
        }
        if spec.kind == MapType::RingBuffer && self.strict {
            if !spec.max_entries.is_power_of_two() {
                return Err(invalid("ring buffer size must be a power of two"));
            }
            let unaligned = self
                .ring_buffer_page_size
                .and_then(|page_size| spec.max_entries.checked_rem(page_size))
                .map_or(false, |rem| rem != 0);
            if unaligned {
                return Err(invalid("ring buffer size must be a multiple of the page size"));
            }
        }
        Ok(())
    }

    fn resolve_shape(&self, spec: &MapSpec) -> Result<(u32, u32), DescriptorError> {
        let invalid = |reason| DescriptorError::InvalidKeyValueShape {
            name: spec.name.clone(),
            kind: spec.kind,
            reason,
        };

        if spec.kind.is_byte_oriented() {
            let key_size = spec.kind.implicit_key_size().unwrap_or(0);
            let value_size = spec.kind.implicit_value_size().unwrap_or(0);
            // Leaving a size out, zero and the synthetic size all mean the
            // same thing.
            let synthetic = |declared: Option<u32>, size: u32| {
                matches!(declared, None | Some(0)) || declared == Some(size)
            };
            if !synthetic(spec.key_size, key_size) || !synthetic(spec.value_size, value_size) {
                return Err(invalid("byte-oriented maps don't take a key or value type"));
            }
            return Ok((key_size, value_size));
        }

        let key_size = match (spec.kind.implicit_key_size(), spec.key_size) {
            (Some(implicit), Some(declared)) if declared != implicit => {
                return Err(invalid("key must be the implicit u32 index"));
            }
            (Some(implicit), _) => implicit,
            (None, Some(declared)) if declared > 0 => declared,
            (None, _) => return Err(invalid("key size must be greater than zero")),
        };

        let value_size = match (spec.kind.implicit_value_size(), spec.value_size) {
            (Some(implicit), Some(declared)) if declared != implicit => {
                return Err(invalid("value must be a u32 program reference"));
            }
            (Some(implicit), _) => implicit,
            (None, Some(declared)) if declared > 0 => declared,
            (None, _) => return Err(invalid("value size must be greater than zero")),
        };

        if spec.kind == MapType::LpmTrie && self.strict && key_size <= LPM_PREFIX_LEN_SIZE {
            return Err(invalid(
                "key must hold a u32 prefix length followed by the matched data",
            ));
        }

        Ok((key_size, value_size))
    }
}

fn type_size<T>(name: &str, kind: MapType) -> Result<u32, DescriptorError> {
    u32::try_from(mem::size_of::<T>()).map_err(|_| DescriptorError::InvalidKeyValueShape {
        name: name.to_owned(),
        kind,
        reason: "type is too large",
    })
}

fn check_name(name: &str) -> Result<(), DescriptorError> {
    let invalid = |reason: String| DescriptorError::InvalidName {
        name: name.to_owned(),
        reason,
    };

    if name.is_empty() {
        return Err(invalid("name is empty".to_owned()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(invalid(format!("name is longer than {} bytes", MAX_NAME_LEN)));
    }
    if name.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(invalid("name starts with a digit".to_owned()));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '.'))
    {
        return Err(invalid(format!("unexpected character {:?}", c)));
    }
    Ok(())
}

fn check_flags(name: &str, kind: MapType, flags: MapFlags) -> Result<(), DescriptorError> {
    let unsupported = flags.difference(kind.supported_flags());
    if !unsupported.is_empty() {
        return Err(DescriptorError::UnsupportedFlag {
            name: name.to_owned(),
            kind,
            flags: unsupported,
        });
    }
    let missing = kind.required_flags().difference(flags);
    if !missing.is_empty() {
        return Err(DescriptorError::MissingRequiredFlag {
            name: name.to_owned(),
            kind,
            flags: missing,
        });
    }
    Ok(())
}
