use std::{slice, vec};

use tracing::{debug, warn};

use crate::descriptor::{DescriptorError, MapDescriptor};

/// Ordered set of map descriptors declared by one probe program.
///
/// The order of insertion is the order in which the loader creates the
/// maps. Names are unique within the set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MapSet {
    descriptors: Vec<MapDescriptor>,
}

impl MapSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a set from the given descriptors, failing on the first
    /// duplicate name.
    pub fn from_descriptors<I>(descriptors: I) -> Result<Self, DescriptorError>
    where
        I: IntoIterator<Item = MapDescriptor>,
    {
        let mut set = MapSet::new();
        for descriptor in descriptors {
            set.insert(descriptor)?;
        }
        Ok(set)
    }

    pub fn insert(&mut self, descriptor: MapDescriptor) -> Result<(), DescriptorError> {
        if self.get(descriptor.name()).is_some() {
            warn!(map = descriptor.name(), "map name is already declared");
            return Err(DescriptorError::DuplicateName {
                name: descriptor.name().to_owned(),
            });
        }

        debug!(
            map = descriptor.name(),
            kind = descriptor.kind().as_str(),
            position = self.descriptors.len(),
            "adding map to descriptor set"
        );
        self.descriptors.push(descriptor);

        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&MapDescriptor> {
        self.descriptors.iter().find(|d| d.name() == name)
    }

    pub fn iter(&self) -> slice::Iter<'_, MapDescriptor> {
        self.descriptors.iter()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

impl IntoIterator for MapSet {
    type Item = MapDescriptor;
    type IntoIter = vec::IntoIter<MapDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.descriptors.into_iter()
    }
}

impl<'a> IntoIterator for &'a MapSet {
    type Item = &'a MapDescriptor;
    type IntoIter = slice::Iter<'a, MapDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.descriptors.iter()
    }
}

#[cfg(test)]
mod tests {
    use probemaps_common::MapType;

    use super::*;

    #[test]
    fn keeps_insertion_order() {
        let set = MapSet::from_descriptors([
            MapDescriptor::ring_buffer("EVENTS", 1 << 16).unwrap(),
            MapDescriptor::hash::<u32, u64>("PIDS", 1024).unwrap(),
            MapDescriptor::prog_array("JUMP_TABLE", 4).unwrap(),
        ])
        .unwrap();

        let names: Vec<_> = set.iter().map(|d| d.name()).collect();
        assert_eq!(names, ["EVENTS", "PIDS", "JUMP_TABLE"]);
        assert_eq!(set.len(), 3);
        assert_eq!(set.get("PIDS").unwrap().kind(), MapType::Hash);
        assert!(set.get("MISSING").is_none());
    }

    #[test]
    fn duplicate_name() {
        let mut set = MapSet::new();
        set.insert(MapDescriptor::hash::<u32, u64>("PIDS", 1024).unwrap())
            .unwrap();

        // Same name, different kind: still a duplicate.
        let res = set.insert(MapDescriptor::array::<u64>("PIDS", 16).unwrap());
        assert_eq!(
            res,
            Err(DescriptorError::DuplicateName {
                name: "PIDS".to_string()
            })
        );
        assert_eq!(set.len(), 1);
        assert_eq!(set.get("PIDS").unwrap().kind(), MapType::Hash);
    }

    #[test]
    fn from_descriptors_stops_at_duplicate() {
        let res = MapSet::from_descriptors([
            MapDescriptor::perf_output("OUT", 4).unwrap(),
            MapDescriptor::perf_output("OUT", 8).unwrap(),
        ]);
        assert!(matches!(res, Err(DescriptorError::DuplicateName { .. })));
    }

    #[test]
    fn long_names_are_compared_in_full() {
        let mut set = MapSet::from_descriptors([
            MapDescriptor::hash::<u64, u64>("process_exec_events", 1024).unwrap(),
            MapDescriptor::hash::<u64, u64>("process_exec_errors", 1024).unwrap(),
        ])
        .unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.get("process_exec_events").is_some());

        let dup = MapDescriptor::hash::<u64, u64>("process_exec_events", 16).unwrap();
        let res = set.insert(dup);
        assert!(matches!(res, Err(DescriptorError::DuplicateName { .. })));
    }
}
