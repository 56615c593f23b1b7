//! Declarations of the maps a probe program needs: one validating
//! constructor per map kind, an ordered descriptor set, and the fixed-layout
//! image handed over to the loader.
//!
//! ```
//! use probemaps::{MapDescriptor, MapSet};
//!
//! let maps = MapSet::from_descriptors([
//!     MapDescriptor::hash::<u64, [u8; 16]>("CONNECTIONS", 1024).unwrap(),
//!     MapDescriptor::ring_buffer("EVENTS", 256 * 1024).unwrap(),
//! ])
//! .unwrap();
//! assert_eq!(maps.len(), 2);
//! ```

pub mod descriptor;
pub mod layout;
pub mod loader;
pub mod logging;
pub mod manifest;
pub mod registry;
pub mod settings;

pub use descriptor::{DescriptorBuilder, DescriptorError, InvalidPageSize, MapDescriptor, MapSpec};
pub use loader::{load_all, BoundMap, DeclaredMap, DryRunLoader, LoadError, MapLoader};
pub use registry::MapSet;

pub use probemaps_common::{LpmKey, MapDef, MapFlags, MapType, Pinning};
