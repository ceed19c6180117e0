use std::collections::BTreeMap;
use std::io::{Read, Write};

use crate::constants::{O_ACCMODE, O_CREAT, O_WRONLY};
use crate::errors::VmError;

const MODE_DIR: u32 = 0o040755;
const MODE_FILE: u32 = 0o100644;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    File(Vec<u8>),
    Dir(BTreeMap<String, Node>),
}

impl Node {
    fn new_dir() -> Self {
        Node::Dir(BTreeMap::new())
    }
}

#[derive(Debug, Clone)]
struct FileHandle {
    path: String,
    cursor: u64,
    readable: bool,
    writable: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct Stat {
    pub mode: u32,
    pub size: u64,
}

impl Stat {
    pub fn is_dir(&self) -> bool {
        self.mode & 0o170000 == 0o040000
    }
}

/// An in-memory hierarchical file store with a POSIX-like open-handle API,
/// serializable as a ustar archive.
#[derive(Debug, Clone)]
pub struct VirtualFileSystem {
    root: Node,
    handles: Vec<Option<FileHandle>>,
}

impl PartialEq for VirtualFileSystem {
    fn eq(&self, other: &Self) -> bool {
        self.root == other.root
    }
}

fn split_path(path: &str) -> Vec<String> {
    path.split('/')
        .map(|part| part.trim_end_matches('/'))
        .filter(|part| !part.is_empty() && *part != ".")
        .map(str::to_string)
        .collect()
}

impl Default for VirtualFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualFileSystem {
    pub fn new() -> Self {
        Self {
            root: Node::new_dir(),
            handles: Vec::new(),
        }
    }

    fn navigate<'a>(&'a self, components: &[String]) -> Option<&'a Node> {
        let mut node = &self.root;
        for part in components {
            let Node::Dir(children) = node else {
                return None;
            };
            node = children.get(part)?;
        }
        Some(node)
    }

    fn navigate_dir_mut<'a>(&'a mut self, components: &[String]) -> Option<&'a mut BTreeMap<String, Node>> {
        let mut node = &mut self.root;
        for part in components {
            let Node::Dir(children) = node else {
                return None;
            };
            node = children.get_mut(part)?;
        }
        match node {
            Node::Dir(children) => Some(children),
            Node::File(_) => None,
        }
    }

    /// Create a directory, and any missing parents. Idempotent: a
    /// pre-existing directory at `path` is not an error.
    pub fn mkdir(&mut self, path: &str) -> Result<(), VmError> {
        match self.mkdir_leaf(path) {
            Ok(()) | Err(VmError::VfsAlreadyExists(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn mkdir_leaf(&mut self, path: &str) -> Result<(), VmError> {
        let components = split_path(path);
        if components.is_empty() {
            return Ok(());
        }

        let mut node = &mut self.root;
        for part in &components[..components.len() - 1] {
            let children = match node {
                Node::Dir(children) => children,
                Node::File(_) => return Err(VmError::VfsInvalid(path.to_string())),
            };
            node = children.entry(part.clone()).or_insert_with(Node::new_dir);
        }

        let children = match node {
            Node::Dir(children) => children,
            Node::File(_) => return Err(VmError::VfsInvalid(path.to_string())),
        };

        let leaf = components.last().unwrap();
        match children.get(leaf) {
            Some(Node::Dir(_)) => Err(VmError::VfsAlreadyExists(path.to_string())),
            Some(Node::File(_)) => Err(VmError::VfsInvalid(format!("{path} exists as a file"))),
            None => {
                children.insert(leaf.clone(), Node::new_dir());
                Ok(())
            }
        }
    }

    fn ensure_parent_dir(&mut self, components: &[String]) -> Result<&mut BTreeMap<String, Node>, VmError> {
        let parent = &components[..components.len() - 1];
        self.navigate_dir_mut(parent)
            .ok_or_else(|| VmError::VfsNotFound(components.join("/")))
    }

    fn free_handle_slot(&mut self) -> u32 {
        for (index, slot) in self.handles.iter().enumerate() {
            if slot.is_none() {
                return index as u32;
            }
        }
        self.handles.push(None);
        (self.handles.len() - 1) as u32
    }

    pub fn open(&mut self, path: &str, oflag: u32) -> Result<u32, VmError> {
        let components = split_path(path);
        if components.is_empty() {
            return Err(VmError::EmptyPath);
        }

        let access = oflag & O_ACCMODE as u32;
        let readable = access != O_WRONLY as u32;
        let writable = access != 0;
        let create = oflag & O_CREAT as u32 != 0;

        let exists = matches!(self.navigate(&components), Some(Node::File(_)));
        if !exists {
            if matches!(self.navigate(&components), Some(Node::Dir(_))) {
                return Err(VmError::VfsInvalid(format!("{path} is a directory")));
            }
            if !create {
                return Err(VmError::VfsNotFound(path.to_string()));
            }
            let parent = self.ensure_parent_dir(&components)?;
            parent.insert(components.last().unwrap().clone(), Node::File(Vec::new()));
        }

        let fd = self.free_handle_slot();
        let handle = FileHandle {
            path: components.join("/"),
            cursor: 0,
            readable,
            writable,
        };
        self.handles[fd as usize] = Some(handle);
        Ok(fd)
    }

    fn handle(&self, fd: u32) -> Result<&FileHandle, VmError> {
        self.handles
            .get(fd as usize)
            .and_then(Option::as_ref)
            .ok_or_else(|| VmError::VfsInvalid(format!("bad file descriptor {fd}")))
    }

    fn handle_mut(&mut self, fd: u32) -> Result<&mut FileHandle, VmError> {
        self.handles
            .get_mut(fd as usize)
            .and_then(Option::as_mut)
            .ok_or_else(|| VmError::VfsInvalid(format!("bad file descriptor {fd}")))
    }

    pub fn close(&mut self, fd: u32) -> Result<(), VmError> {
        let slot = self
            .handles
            .get_mut(fd as usize)
            .ok_or_else(|| VmError::VfsInvalid(format!("bad file descriptor {fd}")))?;
        if slot.is_none() {
            return Err(VmError::VfsInvalid(format!("bad file descriptor {fd}")));
        }
        *slot = None;
        Ok(())
    }

    fn file_bytes(&self, path: &str) -> Result<&Vec<u8>, VmError> {
        let components = split_path(path);
        match self.navigate(&components) {
            Some(Node::File(bytes)) => Ok(bytes),
            Some(Node::Dir(_)) => Err(VmError::VfsInvalid(format!("{path} is a directory"))),
            None => Err(VmError::VfsNotFound(path.to_string())),
        }
    }

    fn file_bytes_mut(&mut self, path: &str) -> Result<&mut Vec<u8>, VmError> {
        let components = split_path(path);
        let parent = components[..components.len() - 1].to_vec();
        let name = components
            .last()
            .cloned()
            .ok_or(VmError::EmptyPath)?;
        let children = self
            .navigate_dir_mut(&parent)
            .ok_or_else(|| VmError::VfsNotFound(path.to_string()))?;
        match children.get_mut(&name) {
            Some(Node::File(bytes)) => Ok(bytes),
            Some(Node::Dir(_)) => Err(VmError::VfsInvalid(format!("{path} is a directory"))),
            None => Err(VmError::VfsNotFound(path.to_string())),
        }
    }

    pub fn read(&mut self, fd: u32, length: usize) -> Result<Vec<u8>, VmError> {
        let handle = self.handle(fd)?.clone();
        if !handle.readable {
            return Err(VmError::VfsInvalid(format!("fd {fd} is not readable")));
        }
        let bytes = self.file_bytes(&handle.path)?;
        let start = (handle.cursor as usize).min(bytes.len());
        let end = (start + length).min(bytes.len());
        let chunk = bytes[start..end].to_vec();
        self.handle_mut(fd)?.cursor = end as u64;
        Ok(chunk)
    }

    pub fn write(&mut self, fd: u32, buf: &[u8]) -> Result<usize, VmError> {
        let handle = self.handle(fd)?.clone();
        if !handle.writable {
            return Err(VmError::VfsInvalid(format!("fd {fd} is not writable")));
        }
        let bytes = self.file_bytes_mut(&handle.path)?;
        let start = handle.cursor as usize;
        if start + buf.len() > bytes.len() {
            bytes.resize(start + buf.len(), 0);
        }
        bytes[start..start + buf.len()].copy_from_slice(buf);
        self.handle_mut(fd)?.cursor = (start + buf.len()) as u64;
        Ok(buf.len())
    }

    pub fn truncate(&mut self, fd: u32, length: u64) -> Result<(), VmError> {
        let handle = self.handle(fd)?.clone();
        let bytes = self.file_bytes_mut(&handle.path)?;
        bytes.resize(length as usize, 0);
        Ok(())
    }

    pub fn stat_path(&self, path: &str) -> Result<Stat, VmError> {
        let components = split_path(path);
        match self.navigate(&components) {
            Some(Node::File(bytes)) => Ok(Stat {
                mode: MODE_FILE,
                size: bytes.len() as u64,
            }),
            Some(Node::Dir(_)) => Ok(Stat {
                mode: MODE_DIR,
                size: 4096,
            }),
            None => Err(VmError::VfsNotFound(path.to_string())),
        }
    }

    pub fn stat_fd(&self, fd: u32) -> Result<Stat, VmError> {
        let handle = self.handle(fd)?;
        let bytes = self.file_bytes(&handle.path)?;
        Ok(Stat {
            mode: MODE_FILE,
            size: bytes.len() as u64,
        })
    }

    pub fn unlink(&mut self, path: &str) -> Result<(), VmError> {
        let components = split_path(path);
        if components.is_empty() {
            return Err(VmError::EmptyPath);
        }
        let parent = &components[..components.len() - 1];
        let name = components.last().unwrap();
        let children = self
            .navigate_dir_mut(parent)
            .ok_or_else(|| VmError::VfsNotFound(path.to_string()))?;
        match children.get(name) {
            Some(Node::File(_)) => {
                children.remove(name);
                Ok(())
            }
            Some(Node::Dir(_)) => Err(VmError::VfsInvalid(format!("{path} is a directory"))),
            None => Err(VmError::VfsNotFound(path.to_string())),
        }
    }

    /// Whole-file convenience write, creating the file and its parent directories.
    pub fn write_file(&mut self, path: &str, data: Vec<u8>) -> Result<(), VmError> {
        let components = split_path(path);
        if components.is_empty() {
            return Err(VmError::EmptyPath);
        }
        if components.len() > 1 {
            self.mkdir(&components[..components.len() - 1].join("/"))?;
        }
        let parent = self
            .navigate_dir_mut(&components[..components.len() - 1])
            .ok_or_else(|| VmError::VfsNotFound(path.to_string()))?;
        parent.insert(components.last().unwrap().clone(), Node::File(data));
        Ok(())
    }

    /// Whole-file convenience read.
    pub fn read_file(&self, path: &str) -> Result<Vec<u8>, VmError> {
        self.file_bytes(path).cloned()
    }

    pub fn exists(&self, path: &str) -> bool {
        self.navigate(&split_path(path)).is_some()
    }

    /// List every regular file's path, relative to the tree root.
    pub fn list_files(&self) -> Vec<String> {
        let mut entries = Vec::new();
        Self::walk(&self.root, "", &mut entries);
        entries
            .into_iter()
            .filter_map(|(path, data)| data.map(|_| path))
            .collect()
    }

    /// Copy either the whole tree, or a single file, from `src` into `self`.
    pub fn copy_from(
        &mut self,
        src: &VirtualFileSystem,
        src_path: Option<&str>,
        dst_path: Option<&str>,
    ) -> Result<(), VmError> {
        match (src_path, dst_path) {
            (None, None) => {
                self.root = src.root.clone();
                Ok(())
            }
            (Some(src_path), Some(dst_path)) => {
                let data = src.read_file(src_path)?;
                self.write_file(dst_path, data)
            }
            _ => Err(VmError::VfsInvalid(
                "copy_from requires both paths or neither".to_string(),
            )),
        }
    }

    pub fn copy_into(
        &self,
        dst: &mut VirtualFileSystem,
        src_path: Option<&str>,
        dst_path: Option<&str>,
    ) -> Result<(), VmError> {
        dst.copy_from(self, src_path, dst_path)
    }

    fn walk<'a>(node: &'a Node, prefix: &str, out: &mut Vec<(String, Option<&'a [u8]>)>) {
        match node {
            Node::File(bytes) => out.push((prefix.to_string(), Some(bytes))),
            Node::Dir(children) => {
                if !prefix.is_empty() {
                    out.push((format!("{prefix}/"), None));
                }
                for (name, child) in children {
                    let child_prefix = if prefix.is_empty() {
                        name.clone()
                    } else {
                        format!("{prefix}/{name}")
                    };
                    Self::walk(child, &child_prefix, out);
                }
            }
        }
    }

    /// Serialize the whole tree as a ustar archive.
    pub fn save(&self, writer: impl Write) -> Result<(), VmError> {
        let mut builder = tar::Builder::new(writer);
        let mut entries = Vec::new();
        Self::walk(&self.root, "", &mut entries);

        for (path, data) in entries {
            let mut header = tar::Header::new_ustar();
            match data {
                None => {
                    header.set_entry_type(tar::EntryType::Directory);
                    header.set_size(0);
                    header.set_mode(0o755);
                    header
                        .set_path(&path)
                        .map_err(|e| VmError::Archive(e.to_string()))?;
                    header.set_cksum();
                    builder
                        .append(&header, std::io::empty())
                        .map_err(VmError::Io)?;
                }
                Some(bytes) => {
                    header.set_entry_type(tar::EntryType::Regular);
                    header.set_size(bytes.len() as u64);
                    header.set_mode(0o644);
                    header
                        .set_path(&path)
                        .map_err(|e| VmError::Archive(e.to_string()))?;
                    header.set_cksum();
                    builder.append(&header, bytes).map_err(VmError::Io)?;
                }
            }
        }

        builder.finish().map_err(VmError::Io)
    }

    /// Deserialize a ustar archive, producing an equivalent tree.
    pub fn load(reader: impl Read) -> Result<Self, VmError> {
        let mut vfs = Self::new();
        let mut archive = tar::Archive::new(reader);
        for entry in archive.entries().map_err(VmError::Io)? {
            let mut entry = entry.map_err(VmError::Io)?;
            let path = entry
                .path()
                .map_err(|e| VmError::Archive(e.to_string()))?
                .to_string_lossy()
                .into_owned();

            if entry.header().entry_type().is_dir() {
                vfs.mkdir(&path)?;
                continue;
            }

            let mut data = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut data).map_err(VmError::Io)?;
            vfs.write_file(&path, data)?;
        }
        Ok(vfs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{O_CREAT, O_RDWR};

    #[test]
    fn write_then_read_round_trips() {
        let mut vfs = VirtualFileSystem::new();
        let fd = vfs
            .open("adi.pb", (O_CREAT | O_RDWR) as u32)
            .expect("open");
        vfs.write(fd, b"hello").expect("write");
        vfs.close(fd).expect("close");

        let fd = vfs.open("adi.pb", O_RDWR as u32).expect("reopen");
        let data = vfs.read(fd, 1024).expect("read");
        assert_eq!(data, b"hello");
    }

    #[test]
    fn open_missing_without_creat_fails() {
        let mut vfs = VirtualFileSystem::new();
        assert!(matches!(
            vfs.open("missing", 0),
            Err(VmError::VfsNotFound(_))
        ));
    }

    #[test]
    fn mkdir_is_idempotent() {
        let mut vfs = VirtualFileSystem::new();
        vfs.mkdir("a/b/c").expect("first mkdir");
        vfs.mkdir("a/b/c").expect("second mkdir is a no-op");
        let stat = vfs.stat_path("a/b/c").expect("stat");
        assert!(stat.is_dir());
    }

    #[test]
    fn mkdir_over_a_file_is_an_error() {
        let mut vfs = VirtualFileSystem::new();
        vfs.write_file("a/b", b"data".to_vec()).unwrap();
        assert!(matches!(vfs.mkdir("a/b"), Err(VmError::VfsInvalid(_))));
    }

    #[test]
    fn tar_round_trip_preserves_tree() {
        let mut vfs = VirtualFileSystem::new();
        vfs.write_file("device/device.json", b"{}".to_vec())
            .unwrap();
        vfs.write_file("adi/adi.pb", vec![1, 2, 3, 4]).unwrap();
        vfs.mkdir("empty_dir").unwrap();

        let mut buffer = Vec::new();
        vfs.save(&mut buffer).expect("save");

        let loaded = VirtualFileSystem::load(buffer.as_slice()).expect("load");
        assert_eq!(vfs, loaded);
    }

    #[test]
    fn truncate_extends_with_zero() {
        let mut vfs = VirtualFileSystem::new();
        let fd = vfs.open("f", (O_CREAT | O_RDWR) as u32).unwrap();
        vfs.write(fd, b"ab").unwrap();
        vfs.truncate(fd, 5).unwrap();
        assert_eq!(vfs.read_file("f").unwrap(), vec![b'a', b'b', 0, 0, 0]);
    }
}
