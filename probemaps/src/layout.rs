//! Loader-facing image of a descriptor set.
//!
//! The image starts with a header of two native-endian `u32` values: the
//! magic number and the count of records. Each record holds the full map
//! name, prefixed with its length, followed by the definition block and the
//! pinning mode:
//!
//! ```text
//! name_len | name[name_len] | type | key_size | value_size | max_entries | map_flags | pinning
//! ```
//!
//! The five `u32` fields after the name are the legacy `bpf_map_def` block.
//! The kernel object name is derived from the full name by the loader, see
//! [`MapRecord::object_name`].

use std::{
    fmt,
    io::{self, Read, Write},
    str::Utf8Error,
};

use byteorder::{NativeEndian, ReadBytesExt, WriteBytesExt};
use probemaps_common::{MapDef, MapFlags, MapName, MapType, NewMapNameError, Pinning};
use thiserror::Error;
use tracing::debug;

use crate::{
    descriptor::{DescriptorBuilder, DescriptorError, MapDescriptor, MapSpec, MAX_NAME_LEN},
    registry::MapSet,
};

/// Written in native byte order, so the image starts with the bytes "PMAP"
/// on little-endian hosts and "PAMP" on big-endian ones.
pub const SECTION_MAGIC: u32 = 0x5041_4d50;

pub const HEADER_SIZE: usize = 8;

/// Size of a record without the name bytes.
pub const RECORD_FIXED_SIZE: usize = 4 + MapDef::SIZE + 4;

/// Part of the image which ended early.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SectionPart {
    Header,
    Record(u32),
}

impl fmt::Display for SectionPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SectionPart::Header => write!(f, "header"),
            SectionPart::Record(index) => write!(f, "record {}", index),
        }
    }
}

#[derive(Error, Debug)]
pub enum LayoutError {
    #[error(transparent)]
    IO(#[from] io::Error),

    #[error("record {index}: map name is not valid UTF-8")]
    NameEncoding {
        index: u32,
        #[source]
        source: Utf8Error,
    },

    #[error("map name of {0} bytes is too long")]
    NameTooLong(usize),

    #[error("bad section magic {0:#010x}")]
    BadMagic(u32),

    #[error("section is truncated in {0}")]
    Truncated(SectionPart),

    #[error("record {index}: unknown map type {type_id}")]
    UnknownMapType { index: u32, type_id: u32 },

    #[error("record {index}: unknown pinning mode {pinning}")]
    UnknownPinning { index: u32, pinning: u32 },

    #[error("too many maps for one section")]
    TooManyMaps,
}

impl From<&MapDescriptor> for MapDef {
    fn from(desc: &MapDescriptor) -> Self {
        MapDef {
            type_: desc.kind().type_id(),
            key_size: desc.key_size(),
            value_size: desc.value_size(),
            max_entries: desc.max_entries(),
            map_flags: desc.flags().bits(),
        }
    }
}

/// One map as laid out in the section image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MapRecord {
    pub name: String,
    pub def: MapDef,
    pub pinning: Pinning,
}

impl MapRecord {
    pub fn from_descriptor(desc: &MapDescriptor) -> Self {
        MapRecord {
            name: desc.name().to_owned(),
            def: MapDef::from(desc),
            pinning: desc.pinning(),
        }
    }

    /// Name the kernel keeps for the map object: the first 15 bytes of the
    /// full name.
    pub fn object_name(&self) -> Result<MapName, NewMapNameError> {
        MapName::truncated(&self.name)
    }

    /// Number of bytes [`MapRecord::write_to`] produces.
    pub fn encoded_len(&self) -> usize {
        RECORD_FIXED_SIZE + self.name.len()
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<(), LayoutError> {
        if self.name.len() > MAX_NAME_LEN {
            return Err(LayoutError::NameTooLong(self.name.len()));
        }
        w.write_u32::<NativeEndian>(self.name.len() as u32)?;
        w.write_all(self.name.as_bytes())?;
        w.write_u32::<NativeEndian>(self.def.type_)?;
        w.write_u32::<NativeEndian>(self.def.key_size)?;
        w.write_u32::<NativeEndian>(self.def.value_size)?;
        w.write_u32::<NativeEndian>(self.def.max_entries)?;
        w.write_u32::<NativeEndian>(self.def.map_flags)?;
        w.write_u32::<NativeEndian>(self.pinning as u32)?;
        Ok(())
    }

    fn read_from<R: Read>(r: &mut R, index: u32) -> Result<Self, LayoutError> {
        let truncated = |e: io::Error| truncated_in(SectionPart::Record(index), e);

        let name_len = r.read_u32::<NativeEndian>().map_err(truncated)? as usize;
        if name_len > MAX_NAME_LEN {
            return Err(LayoutError::NameTooLong(name_len));
        }
        let mut name = vec![0u8; name_len];
        r.read_exact(&mut name).map_err(truncated)?;
        let name = String::from_utf8(name).map_err(|e| LayoutError::NameEncoding {
            index,
            source: e.utf8_error(),
        })?;

        let mut fields = [0u32; 6];
        for field in fields.iter_mut() {
            *field = r.read_u32::<NativeEndian>().map_err(truncated)?;
        }
        let [type_, key_size, value_size, max_entries, map_flags, pinning] = fields;

        if MapType::from_type_id(type_).is_none() {
            return Err(LayoutError::UnknownMapType {
                index,
                type_id: type_,
            });
        }
        let pinning =
            Pinning::from_u32(pinning).ok_or(LayoutError::UnknownPinning { index, pinning })?;

        Ok(MapRecord {
            name,
            def: MapDef {
                type_,
                key_size,
                value_size,
                max_entries,
                map_flags,
            },
            pinning,
        })
    }

    /// Validates the record again, as if it was declared by hand.
    pub fn to_descriptor(
        &self,
        builder: &DescriptorBuilder,
    ) -> Result<MapDescriptor, RecordError> {
        let kind = self.def.map_type().ok_or(LayoutError::UnknownMapType {
            index: 0,
            type_id: self.def.type_,
        })?;
        let spec = MapSpec::new(&self.name, kind, self.def.max_entries)
            .key_size(self.def.key_size)
            .value_size(self.def.value_size)
            .flags(MapFlags::from_bits_retain(self.def.map_flags))
            .pinning(self.pinning);
        Ok(builder.build(spec)?)
    }
}

fn truncated_in(part: SectionPart, e: io::Error) -> LayoutError {
    match e.kind() {
        io::ErrorKind::UnexpectedEof => LayoutError::Truncated(part),
        _ => LayoutError::IO(e),
    }
}

#[derive(Error, Debug)]
pub enum RecordError {
    #[error(transparent)]
    Layout(#[from] LayoutError),

    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
}

/// Writes the whole descriptor set, in order.
pub fn write_section<W: Write>(set: &MapSet, mut w: W) -> Result<(), LayoutError> {
    let count = u32::try_from(set.len()).map_err(|_| LayoutError::TooManyMaps)?;
    w.write_u32::<NativeEndian>(SECTION_MAGIC)?;
    w.write_u32::<NativeEndian>(count)?;
    for desc in set {
        MapRecord::from_descriptor(desc).write_to(&mut w)?;
    }
    w.flush()?;

    debug!(maps = count, "wrote map section");

    Ok(())
}

/// Reads all records of a section image.
pub fn read_section<R: Read>(mut r: R) -> Result<Vec<MapRecord>, LayoutError> {
    let truncated = |e: io::Error| truncated_in(SectionPart::Header, e);

    let magic = r.read_u32::<NativeEndian>().map_err(truncated)?;
    if magic != SECTION_MAGIC {
        return Err(LayoutError::BadMagic(magic));
    }
    let count = r.read_u32::<NativeEndian>().map_err(truncated)?;

    // Don't trust the count for the allocation size.
    let mut records = Vec::with_capacity(count.min(1024) as usize);
    for index in 0..count {
        records.push(MapRecord::read_from(&mut r, index)?);
    }

    debug!(maps = count, "read map section");

    Ok(records)
}
