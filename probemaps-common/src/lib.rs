#![cfg_attr(not(any(feature = "user", test)), no_std)]

use core::fmt;

/// Maximum length of a kernel object name, including the trailing nul byte.
pub const MAP_NAME_LEN: usize = 16;

/// Size of the prefix length header which every LPM trie key starts with.
pub const LPM_PREFIX_LEN_SIZE: u32 = core::mem::size_of::<u32>() as u32;

/// Size of the implicit index key used by array-like maps.
pub const INDEX_KEY_SIZE: u32 = core::mem::size_of::<u32>() as u32;

/// Kinds of maps which a probe program can declare. Discriminants are the
/// kernel's map type identifiers.
#[cfg_attr(
    feature = "user",
    derive(serde::Deserialize, serde::Serialize),
    serde(rename_all = "snake_case")
)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MapType {
    Hash = 1,
    Array = 2,
    ProgArray = 3,
    PerfOutput = 4,
    PercpuArray = 6,
    LruHash = 9,
    LpmTrie = 11,
    RingBuffer = 27,
}

impl MapType {
    pub const ALL: [MapType; 8] = [
        MapType::Hash,
        MapType::LruHash,
        MapType::Array,
        MapType::PercpuArray,
        MapType::ProgArray,
        MapType::PerfOutput,
        MapType::RingBuffer,
        MapType::LpmTrie,
    ];

    pub const fn from_type_id(type_id: u32) -> Option<Self> {
        match type_id {
            1 => Some(MapType::Hash),
            2 => Some(MapType::Array),
            3 => Some(MapType::ProgArray),
            4 => Some(MapType::PerfOutput),
            6 => Some(MapType::PercpuArray),
            9 => Some(MapType::LruHash),
            11 => Some(MapType::LpmTrie),
            27 => Some(MapType::RingBuffer),
            _ => None,
        }
    }

    pub const fn type_id(self) -> u32 {
        self as u32
    }

    /// Name of the kind as used in manifests and CLI output.
    pub const fn as_str(self) -> &'static str {
        match self {
            MapType::Hash => "hash",
            MapType::LruHash => "lru_hash",
            MapType::Array => "array",
            MapType::PercpuArray => "percpu_array",
            MapType::ProgArray => "prog_array",
            MapType::PerfOutput => "perf_output",
            MapType::RingBuffer => "ring_buffer",
            MapType::LpmTrie => "lpm_trie",
        }
    }

    /// Key size the kind imposes regardless of what the caller declares.
    /// Array-like maps are indexed with a 32-bit unsigned integer, perf
    /// outputs with the CPU number.
    pub const fn implicit_key_size(self) -> Option<u32> {
        match self {
            MapType::Array | MapType::PercpuArray | MapType::ProgArray | MapType::PerfOutput => {
                Some(INDEX_KEY_SIZE)
            }
            _ => None,
        }
    }

    /// Value size the kind imposes. Program arrays hold program file
    /// descriptors and perf outputs hold perf event file descriptors.
    pub const fn implicit_value_size(self) -> Option<u32> {
        match self {
            MapType::ProgArray | MapType::PerfOutput => Some(4),
            _ => None,
        }
    }

    /// Byte-oriented event channels don't carry a domain key/value type.
    pub const fn is_byte_oriented(self) -> bool {
        matches!(self, MapType::PerfOutput | MapType::RingBuffer)
    }

    /// Whether every CPU gets its own private copy (or buffer).
    pub const fn is_per_cpu(self) -> bool {
        matches!(self, MapType::PercpuArray | MapType::PerfOutput)
    }

    /// Whether inserting into a full map evicts an entry instead of failing.
    pub const fn evicts(self) -> bool {
        matches!(self, MapType::LruHash)
    }

    /// Whether `max_entries` counts bytes rather than entries.
    pub const fn capacity_in_bytes(self) -> bool {
        matches!(self, MapType::RingBuffer)
    }

    /// Flags the kernel accepts for this kind.
    pub const fn supported_flags(self) -> MapFlags {
        let access = MapFlags::RDONLY.union(MapFlags::WRONLY);
        let prog_access = MapFlags::RDONLY_PROG.union(MapFlags::WRONLY_PROG);
        match self {
            MapType::Hash => MapFlags::NO_PREALLOC
                .union(MapFlags::ZERO_SEED)
                .union(access)
                .union(prog_access),
            MapType::LruHash => MapFlags::NO_COMMON_LRU
                .union(MapFlags::ZERO_SEED)
                .union(access)
                .union(prog_access),
            MapType::Array => MapFlags::MMAPABLE.union(access).union(prog_access),
            MapType::PercpuArray => access.union(prog_access),
            MapType::ProgArray => access,
            MapType::PerfOutput => MapFlags::PRESERVE_ELEMS.union(access),
            MapType::RingBuffer => MapFlags::empty(),
            MapType::LpmTrie => MapFlags::NO_PREALLOC.union(access).union(prog_access),
        }
    }

    /// Flags without which the kernel refuses to create the map.
    pub const fn required_flags(self) -> MapFlags {
        match self {
            // The key space of a trie is sparse, it can't be preallocated.
            MapType::LpmTrie => MapFlags::NO_PREALLOC,
            _ => MapFlags::empty(),
        }
    }

    /// Short human readable description of the storage and eviction
    /// semantics.
    pub const fn describe(self) -> &'static str {
        match self {
            MapType::Hash => "shared hash table, insert fails when full",
            MapType::LruHash => "shared hash table, evicts least recently used entry when full",
            MapType::Array => "shared fixed-size array indexed by u32, update in place only",
            MapType::PercpuArray => "fixed-size array with one private copy per CPU",
            MapType::ProgArray => "tail call dispatch table, out-of-range index falls through",
            MapType::PerfOutput => "per-CPU perf event buffers, writer drops when full",
            MapType::RingBuffer => "single shared ring, reserve then commit, one consumer",
            MapType::LpmTrie => "longest prefix match trie, insert fails when full",
        }
    }
}

impl fmt::Display for MapType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

bitflags::bitflags! {
    /// Map creation flags, values as defined by the kernel UAPI.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MapFlags: u32 {
        const NO_PREALLOC = 1 << 0;
        const NO_COMMON_LRU = 1 << 1;
        const RDONLY = 1 << 3;
        const WRONLY = 1 << 4;
        const ZERO_SEED = 1 << 6;
        const RDONLY_PROG = 1 << 7;
        const WRONLY_PROG = 1 << 8;
        const MMAPABLE = 1 << 10;
        const PRESERVE_ELEMS = 1 << 11;
    }
}

/// Pinning mode of a map. Pinned maps outlive the program which created
/// them and are shared by name with later loads.
#[cfg_attr(
    feature = "user",
    derive(serde::Deserialize, serde::Serialize),
    serde(rename_all = "snake_case")
)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(u32)]
pub enum Pinning {
    #[default]
    None = 0,
    ByName = 1,
}

impl Pinning {
    pub const fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Pinning::None),
            1 => Some(Pinning::ByName),
            _ => None,
        }
    }
}

/// Fixed-layout map definition block, in the same shape as the legacy
/// `struct bpf_map_def` which loaders read from the `maps` section.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct MapDef {
    pub type_: u32,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
    pub map_flags: u32,
}

impl MapDef {
    pub const SIZE: usize = core::mem::size_of::<MapDef>();

    pub fn map_type(&self) -> Option<MapType> {
        MapType::from_type_id(self.type_)
    }

    pub fn flags(&self) -> MapFlags {
        MapFlags::from_bits_retain(self.map_flags)
    }
}

/// Nul-padded name of the kernel map object.
#[derive(Copy, Clone, PartialEq, Eq)]
#[repr(C)]
pub struct MapName {
    pub name: [u8; MAP_NAME_LEN],
}

impl MapName {
    /// Returns the name up to the first nul byte.
    pub fn as_str(&self) -> Result<&str, core::str::Utf8Error> {
        let end = self
            .name
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(MAP_NAME_LEN);
        core::str::from_utf8(&self.name[..end])
    }
}

impl fmt::Debug for MapName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_str() {
            Ok(s) => f.debug_tuple("MapName").field(&s).finish(),
            Err(_) => f.debug_tuple("MapName").field(&self.name).finish(),
        }
    }
}

#[cfg(feature = "user")]
#[derive(thiserror::Error, Debug)]
pub enum NewMapNameError {
    #[error(transparent)]
    NulError(#[from] std::ffi::NulError),

    #[error("name is longer than {} bytes", MAP_NAME_LEN - 1)]
    TooLong,
}

#[cfg(feature = "user")]
impl MapName {
    /// Converts the given Rust string into a nul terminated fixed-size
    /// array.
    pub fn new(name: &str) -> Result<Self, NewMapNameError> {
        let mut name_b = std::ffi::CString::new(name)?.into_bytes_with_nul();
        if name_b.len() > MAP_NAME_LEN {
            return Err(NewMapNameError::TooLong);
        }
        name_b.resize(MAP_NAME_LEN, 0);
        Ok(MapName {
            name: name_b.try_into().map_err(|_| NewMapNameError::TooLong)?,
        })
    }

    /// Like [`MapName::new`], but keeps only as many leading bytes of
    /// `name` as the kernel stores.
    pub fn truncated(name: &str) -> Result<Self, NewMapNameError> {
        let mut end = name.len().min(MAP_NAME_LEN - 1);
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        Self::new(&name[..end])
    }
}

/// Key of an LPM trie: the number of significant bits followed by the data
/// being matched.
#[repr(C, packed)]
pub struct LpmKey<K> {
    pub prefix_len: u32,
    pub data: K,
}

impl<K> LpmKey<K> {
    pub const fn new(prefix_len: u32, data: K) -> Self {
        Self { prefix_len, data }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_ids_round_trip() {
        for kind in MapType::ALL {
            assert_eq!(MapType::from_type_id(kind.type_id()), Some(kind));
        }
        assert_eq!(MapType::from_type_id(0), None);
        assert_eq!(MapType::from_type_id(5), None);
    }

    #[test]
    fn kernel_type_ids() {
        assert_eq!(MapType::Hash.type_id(), 1);
        assert_eq!(MapType::LruHash.type_id(), 9);
        assert_eq!(MapType::PerfOutput.type_id(), 4);
        assert_eq!(MapType::RingBuffer.type_id(), 27);
        assert_eq!(MapType::LpmTrie.type_id(), 11);
    }

    #[test]
    fn required_flags_are_supported() {
        for kind in MapType::ALL {
            assert!(kind.supported_flags().contains(kind.required_flags()));
        }
    }

    #[test]
    fn map_def_layout() {
        assert_eq!(MapDef::SIZE, 20);
        assert_eq!(core::mem::size_of::<MapName>(), MAP_NAME_LEN);
    }

    #[test]
    fn lpm_key_has_prefix_header() {
        assert_eq!(core::mem::size_of::<LpmKey<[u8; 8]>>(), 12);
        assert_eq!(core::mem::size_of::<LpmKey<u32>>(), 8);
    }

    #[test]
    fn map_name_as_str_stops_at_nul() {
        let mut name = [0u8; MAP_NAME_LEN];
        name[..6].copy_from_slice(b"EVENTS");
        assert_eq!(MapName { name }.as_str().unwrap(), "EVENTS");
    }

    #[cfg(feature = "user")]
    #[test]
    fn map_name_new() {
        let name = MapName::new("CONNECTIONS").unwrap();
        assert_eq!(&name.name, b"CONNECTIONS\0\0\0\0\0");

        assert!(matches!(
            MapName::new("THIS_NAME_IS_TOO_LONG"),
            Err(NewMapNameError::TooLong)
        ));
        assert!(matches!(
            MapName::new("A\0B"),
            Err(NewMapNameError::NulError(_))
        ));
    }

    #[cfg(feature = "user")]
    #[test]
    fn map_name_truncated() {
        let name = MapName::truncated("process_exec_events").unwrap();
        assert_eq!(name.as_str().unwrap(), "process_exec_ev");
        assert_eq!(MapName::truncated("PIDS").unwrap().as_str().unwrap(), "PIDS");
        // Never splits a character.
        let name = MapName::truncated("abcdefghijklmn\u{e9}").unwrap();
        assert_eq!(name.as_str().unwrap(), "abcdefghijklmn");
    }
}
