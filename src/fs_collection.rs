use std::collections::BTreeMap;
use std::io::{Read, Write};

use crate::errors::VmError;
use crate::vfs::VirtualFileSystem;

/// Bundles several named [`VirtualFileSystem`]s (`libs`, `device`, `adi`, `cache`, ...)
/// so they can be serialized together into a single tar archive, with each
/// member's entries prefixed by `/<name>/`.
#[derive(Debug, Clone, Default)]
pub struct FSCollection {
    members: BTreeMap<String, VirtualFileSystem>,
}

impl FSCollection {
    pub fn new() -> Self {
        Self {
            members: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, fs: VirtualFileSystem) {
        self.members.insert(name.into(), fs);
    }

    /// Get (and lazily create) the named member filesystem.
    pub fn get_or_create(&mut self, name: &str) -> &mut VirtualFileSystem {
        self.members
            .entry(name.to_string())
            .or_insert_with(VirtualFileSystem::new)
    }

    pub fn get(&self, name: &str) -> Option<&VirtualFileSystem> {
        self.members.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.members.keys().map(String::as_str)
    }

    /// Combine the requested members into a single ustar archive, each entry
    /// prefixed with `<name>/`. `include`/`exclude` default to "everything"
    /// and "nothing" respectively; both may not be supplied together.
    pub fn save(
        &self,
        writer: impl Write,
        include: Option<&[&str]>,
        exclude: Option<&[&str]>,
    ) -> Result<(), VmError> {
        if include.is_some() && exclude.is_some() {
            return Err(VmError::VfsInvalid(
                "FSCollection::save: include and exclude are mutually exclusive".to_string(),
            ));
        }

        let mut combined = VirtualFileSystem::new();
        for (name, fs) in &self.members {
            if let Some(include) = include
                && !include.contains(&name.as_str())
            {
                continue;
            }
            if let Some(exclude) = exclude
                && exclude.contains(&name.as_str())
            {
                continue;
            }
            combined.mkdir(name)?;
            for entry in fs.list_files() {
                let data = fs.read_file(&entry)?;
                combined.write_file(&format!("{name}/{entry}"), data)?;
            }
        }
        combined.save(writer)
    }

    /// Save everything, under every member's name prefix.
    pub fn save_all(&self, writer: impl Write) -> Result<(), VmError> {
        self.save(writer, None, None)
    }

    /// Load one or more archives (split or combined, any order) and demux
    /// their entries back into member filesystems by top-level directory.
    pub fn load<R: Read>(readers: impl IntoIterator<Item = R>) -> Result<Self, VmError> {
        let mut collection = Self::new();

        for reader in readers {
            let combined = VirtualFileSystem::load(reader)?;
            for entry in combined.list_files() {
                let Some((member, rest)) = entry.split_once('/') else {
                    continue;
                };
                let data = combined.read_file(&entry)?;
                collection.get_or_create(member).write_file(rest, data)?;
            }
        }

        Ok(collection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FSCollection {
        let mut collection = FSCollection::new();
        collection
            .get_or_create("libs")
            .write_file("libstoreservicescore.so", vec![1, 2, 3])
            .unwrap();
        collection
            .get_or_create("device")
            .write_file("device.json", b"{}".to_vec())
            .unwrap();
        collection
            .get_or_create("adi")
            .write_file("adi.pb", vec![9, 9])
            .unwrap();
        collection
    }

    fn assert_same_contents(a: &FSCollection, b: &FSCollection) {
        let a_names: Vec<&str> = a.names().collect();
        for name in a_names {
            let fs_a = a.get(name).unwrap();
            let fs_b = b.get(name).expect("member missing after merge");
            assert_eq!(fs_a, fs_b, "member {name} differs after round trip");
        }
    }

    #[test]
    fn save_all_then_load_round_trips() {
        let collection = sample();
        let mut buffer = Vec::new();
        collection.save_all(&mut buffer).unwrap();

        let loaded = FSCollection::load([buffer.as_slice()]).unwrap();
        assert_same_contents(&collection, &loaded);
    }

    #[test]
    fn split_save_then_load_in_either_order_round_trips() {
        let collection = sample();

        let mut libs_buf = Vec::new();
        collection
            .save(&mut libs_buf, Some(&["libs"]), None)
            .unwrap();

        let mut rest_buf = Vec::new();
        collection
            .save(&mut rest_buf, None, Some(&["libs"]))
            .unwrap();

        let loaded_forward =
            FSCollection::load([libs_buf.as_slice(), rest_buf.as_slice()]).unwrap();
        assert_same_contents(&collection, &loaded_forward);

        let loaded_reversed =
            FSCollection::load([rest_buf.as_slice(), libs_buf.as_slice()]).unwrap();
        assert_same_contents(&collection, &loaded_reversed);
    }
}
