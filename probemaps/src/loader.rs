//! The seam between declared maps and whatever creates them in the host.
//!
//! A descriptor starts out `Declared`. A [`MapLoader`] turns it into a
//! `Bound` map by issuing the host's map creation request. Host failures are
//! passed through to the caller untouched.

use std::{convert::Infallible, error::Error as StdError};

use probemaps_common::{MapDef, Pinning};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{descriptor::MapDescriptor, registry::MapSet};

/// Creates maps in the host from their definition blocks.
pub trait MapLoader {
    type Handle;
    type Error: StdError + 'static;

    fn create(
        &mut self,
        name: &str,
        def: &MapDef,
        pinning: Pinning,
    ) -> Result<Self::Handle, Self::Error>;
}

#[derive(Error, Debug)]
#[error("could not create map {name}")]
pub struct LoadError<E: StdError + 'static> {
    pub name: String,
    #[source]
    pub source: E,
}

/// A validated descriptor which wasn't submitted to the host yet.
#[derive(Clone, Copy, Debug)]
pub struct DeclaredMap<'a> {
    descriptor: &'a MapDescriptor,
}

impl<'a> DeclaredMap<'a> {
    pub fn new(descriptor: &'a MapDescriptor) -> Self {
        DeclaredMap { descriptor }
    }

    pub fn descriptor(&self) -> &'a MapDescriptor {
        self.descriptor
    }

    pub fn bind<L: MapLoader>(
        self,
        loader: &mut L,
    ) -> Result<BoundMap<L::Handle>, LoadError<L::Error>> {
        let name = self.descriptor.name();
        let def = MapDef::from(self.descriptor);

        match loader.create(name, &def, self.descriptor.pinning()) {
            Ok(handle) => {
                debug!(map = name, kind = self.descriptor.kind().as_str(), "map created");
                Ok(BoundMap {
                    name: name.to_owned(),
                    def,
                    handle,
                })
            }
            Err(source) => {
                warn!(
                    map = name,
                    error = source.to_string().as_str(),
                    "host refused to create map"
                );
                Err(LoadError {
                    name: name.to_owned(),
                    source,
                })
            }
        }
    }
}

/// A map for which the host returned a handle.
#[derive(Debug)]
pub struct BoundMap<H> {
    name: String,
    def: MapDef,
    handle: H,
}

impl<H> BoundMap<H> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn def(&self) -> &MapDef {
        &self.def
    }

    pub fn handle(&self) -> &H {
        &self.handle
    }

    pub fn into_handle(self) -> H {
        self.handle
    }
}

/// Binds every map of the set, in declaration order. Stops at the first
/// map the host refuses; maps bound before it are dropped.
pub fn load_all<L: MapLoader>(
    set: &MapSet,
    loader: &mut L,
) -> Result<Vec<BoundMap<L::Handle>>, LoadError<L::Error>> {
    set.iter()
        .map(|descriptor| DeclaredMap::new(descriptor).bind(&mut *loader))
        .collect()
}

/// One creation request as the host would receive it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateRequest {
    pub name: String,
    pub def: MapDef,
    pub pinning: Pinning,
}

/// Loader which doesn't talk to the host, it only records the requests it
/// would have issued. Handles are positions in the request list.
#[derive(Debug, Default)]
pub struct DryRunLoader {
    requests: Vec<CreateRequest>,
}

impl DryRunLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> &[CreateRequest] {
        &self.requests
    }
}

impl MapLoader for DryRunLoader {
    type Handle = usize;
    type Error = Infallible;

    fn create(
        &mut self,
        name: &str,
        def: &MapDef,
        pinning: Pinning,
    ) -> Result<Self::Handle, Self::Error> {
        self.requests.push(CreateRequest {
            name: name.to_owned(),
            def: *def,
            pinning,
        });
        Ok(self.requests.len() - 1)
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use probemaps_common::MapType;

    use super::*;

    /// Fails with ENOSPC-like errors after `capacity` maps.
    struct LimitedLoader {
        capacity: usize,
        created: Vec<String>,
    }

    impl MapLoader for LimitedLoader {
        type Handle = i32;
        type Error = io::Error;

        fn create(
            &mut self,
            name: &str,
            _def: &MapDef,
            _pinning: Pinning,
        ) -> Result<Self::Handle, Self::Error> {
            if self.created.len() == self.capacity {
                return Err(io::Error::new(io::ErrorKind::Other, "no space left"));
            }
            self.created.push(name.to_owned());
            Ok(100 + self.created.len() as i32)
        }
    }

    fn sample_set() -> MapSet {
        MapSet::from_descriptors([
            MapDescriptor::hash::<u32, u64>("PIDS", 1024).unwrap(),
            MapDescriptor::ring_buffer("EVENTS", 1 << 16)
                .unwrap()
                .with_pinning(Pinning::ByName),
            MapDescriptor::prog_array("JUMP_TABLE", 4).unwrap(),
        ])
        .unwrap()
    }

    #[test]
    fn dry_run_records_requests_in_order() {
        let set = sample_set();
        let mut loader = DryRunLoader::new();
        let bound = load_all(&set, &mut loader).unwrap();

        assert_eq!(bound.len(), 3);
        let handles: Vec<_> = bound.iter().map(|b| *b.handle()).collect();
        assert_eq!(handles, [0, 1, 2]);

        let requests = loader.requests();
        assert_eq!(requests[0].name, "PIDS");
        assert_eq!(requests[0].def.type_, MapType::Hash.type_id());
        assert_eq!(requests[1].name, "EVENTS");
        assert_eq!(requests[1].pinning, Pinning::ByName);
        assert_eq!(requests[1].def.max_entries, 1 << 16);
        assert_eq!(requests[2].def.value_size, 4);
    }

    #[test]
    fn stops_at_first_host_error() {
        let set = sample_set();
        let mut loader = LimitedLoader {
            capacity: 1,
            created: Vec::new(),
        };
        let err = load_all(&set, &mut loader).unwrap_err();

        assert_eq!(err.name, "EVENTS");
        assert_eq!(err.source.kind(), io::ErrorKind::Other);
        assert_eq!(loader.created, ["PIDS"]);
    }

    #[test]
    fn bind_single_map() {
        let desc = MapDescriptor::lpm_trie::<[u8; 4], u8>("NETS", 64).unwrap();
        let mut loader = LimitedLoader {
            capacity: 8,
            created: Vec::new(),
        };
        let bound = DeclaredMap::new(&desc).bind(&mut loader).unwrap();
        assert_eq!(bound.name(), "NETS");
        assert_eq!(bound.def().key_size, 8);
        assert_eq!(bound.into_handle(), 101);
    }
}
