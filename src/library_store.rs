use std::io::{Cursor, Read};

use crate::constants::{APK_LIB_ARCH_DIR, COREADI_SO, STORESERVICESCORE_SO};
use crate::errors::VmError;
use crate::vfs::VirtualFileSystem;

/// Holds the two proprietary ARM64 shared objects at the root of its own
/// filesystem, extracted either from an Apple Music APK or from a
/// previously-saved archive. This filesystem becomes the `libs` member of
/// an `FSCollection`, which supplies the `libs/` path prefix on save.
#[derive(Debug, Clone, Default)]
pub struct LibraryStore {
    fs: VirtualFileSystem,
}

const LIBRARIES: [&str; 2] = [STORESERVICESCORE_SO, COREADI_SO];

impl LibraryStore {
    pub fn from_virtfs(fs: VirtualFileSystem) -> Self {
        Self { fs }
    }

    pub fn into_vfs(self) -> VirtualFileSystem {
        self.fs
    }

    pub fn vfs(&self) -> &VirtualFileSystem {
        &self.fs
    }

    /// Extract `lib/arm64-v8a/libstoreservicescore.so` and
    /// `lib/arm64-v8a/libCoreADI.so` from an APK (a standard ZIP archive).
    pub fn init_from_apk(reader: impl Read + std::io::Seek) -> Result<Self, VmError> {
        let mut archive = zip::ZipArchive::new(reader).map_err(|e| VmError::Archive(e.to_string()))?;
        let mut fs = VirtualFileSystem::new();

        for name in LIBRARIES {
            let entry_path = format!("{APK_LIB_ARCH_DIR}/{name}");
            let mut entry = archive
                .by_name(&entry_path)
                .map_err(|_| VmError::LibraryMissingInArchive(entry_path.clone()))?;

            let mut data = Vec::with_capacity(entry.size() as usize);
            entry
                .read_to_end(&mut data)
                .map_err(VmError::Io)?;

            fs.write_file(name, data)?;
        }

        Ok(Self { fs })
    }

    /// Read bytes from a ZIP or ustar-tar source, auto-detecting by magic
    /// bytes (§6 "Library bundle download"): `PK\x03\x04` means an APK/ZIP,
    /// anything else is assumed to be a previously-saved tar of this store.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, VmError> {
        if bytes.len() >= 4 && &bytes[0..4] == b"PK\x03\x04" {
            Self::init_from_apk(Cursor::new(bytes.to_vec()))
        } else {
            let fs = VirtualFileSystem::load(bytes)?;
            Ok(Self { fs })
        }
    }

    pub fn open_library_bytes(&self, name: &str) -> Result<Vec<u8>, VmError> {
        self.fs.read_file(name)
    }

    pub fn storeservicescore(&self) -> Result<Vec<u8>, VmError> {
        self.open_library_bytes(STORESERVICESCORE_SO)
    }

    pub fn coreadi(&self) -> Result<Vec<u8>, VmError> {
        self.open_library_bytes(COREADI_SO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_apk() -> Vec<u8> {
        let mut buffer = Vec::new();
        {
            let mut writer = zip::ZipWriter::new(Cursor::new(&mut buffer));
            let options: zip::write::FileOptions<'_, ()> = zip::write::FileOptions::default();
            for name in LIBRARIES {
                writer
                    .start_file(format!("{APK_LIB_ARCH_DIR}/{name}"), options)
                    .unwrap();
                writer.write_all(format!("fake-{name}").as_bytes()).unwrap();
            }
            writer.finish().unwrap();
        }
        buffer
    }

    #[test]
    fn extracts_both_libraries_from_apk() {
        let apk = sample_apk();
        let store = LibraryStore::init_from_apk(Cursor::new(apk)).expect("extract");
        assert_eq!(store.storeservicescore().unwrap(), b"fake-libstoreservicescore.so");
        assert_eq!(store.coreadi().unwrap(), b"fake-libCoreADI.so");
    }

    #[test]
    fn missing_library_in_apk_is_fatal() {
        let mut buffer = Vec::new();
        {
            let mut writer = zip::ZipWriter::new(Cursor::new(&mut buffer));
            let options: zip::write::FileOptions<'_, ()> = zip::write::FileOptions::default();
            writer
                .start_file(format!("{APK_LIB_ARCH_DIR}/{STORESERVICESCORE_SO}"), options)
                .unwrap();
            writer.write_all(b"only one").unwrap();
            writer.finish().unwrap();
        }

        let result = LibraryStore::init_from_apk(Cursor::new(buffer));
        assert!(matches!(result, Err(VmError::LibraryMissingInArchive(_))));
    }

    #[test]
    fn from_bytes_detects_apk_by_magic() {
        let apk = sample_apk();
        let store = LibraryStore::from_bytes(&apk).expect("detect apk");
        assert_eq!(store.storeservicescore().unwrap(), b"fake-libstoreservicescore.so");
    }

    #[test]
    fn from_bytes_detects_tar_fallback() {
        let mut original = VirtualFileSystem::new();
        original
            .write_file(STORESERVICESCORE_SO, b"a".to_vec())
            .unwrap();
        original.write_file(COREADI_SO, b"b".to_vec()).unwrap();

        let mut buffer = Vec::new();
        original.save(&mut buffer).unwrap();

        let store = LibraryStore::from_bytes(&buffer).expect("detect tar");
        assert_eq!(store.storeservicescore().unwrap(), b"a");
    }
}
