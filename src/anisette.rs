use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::{Engine as _, engine::general_purpose::STANDARD};

use crate::adi::{Adi, AdiInit};
use crate::constants::{
    ADI_FS_NAME, CACHE_FS_NAME, DEFAULT_LIBS_URL, DEVICE_FS_NAME, DS_ID, LIBRARY_STORE_PATH,
};
use crate::device::{AnisetteDeviceConfig, Device};
use crate::fs_collection::FSCollection;
use crate::library_store::LibraryStore;
use crate::provisioning::ProvisioningSession;
use crate::vfs::VirtualFileSystem;

/// A single Anisette session: the two proprietary libraries, a virtual
/// device identity, the emulated ADI state, and a scratch cache filesystem
/// reserved for future library use.
///
/// Construct with [`Anisette::init_default`], [`Anisette::init_from_bytes`]
/// or [`Anisette::init_from_path`] for a brand-new session, or
/// [`Anisette::load`] to resume one saved with [`Anisette::save_all`] /
/// [`Anisette::save_provisioning`] / [`Anisette::save_libs`].
pub struct Anisette {
    library_store: LibraryStore,
    device: Device,
    device_fs: VirtualFileSystem,
    adi: Adi,
    cache_fs: VirtualFileSystem,
    apple_root_pem: Option<PathBuf>,
    ds_id: u64,
}

impl Anisette {
    fn assemble(
        library_store: LibraryStore,
        device: Device,
        device_fs: VirtualFileSystem,
        adi: Adi,
        cache_fs: VirtualFileSystem,
        apple_root_pem: Option<PathBuf>,
    ) -> Self {
        Self {
            library_store,
            device,
            device_fs,
            adi,
            cache_fs,
            apple_root_pem,
            ds_id: DS_ID,
        }
    }

    /// Start a brand-new session from library bytes (an Apple Music APK or a
    /// previously-saved `libs` archive), generating a fresh device identity.
    pub fn init_from_bytes(
        bytes: &[u8],
        device_config: Option<AnisetteDeviceConfig>,
        apple_root_pem: Option<PathBuf>,
    ) -> Result<Self> {
        let library_store = LibraryStore::from_bytes(bytes)?;

        let mut device_fs = VirtualFileSystem::new();
        let mut device = Device::load(&device_fs)?;
        device.initialize_defaults(device_config.unwrap_or_default());
        device.persist(&mut device_fs)?;

        let adi = Self::build_adi(&library_store, &device)?;

        Ok(Self::assemble(
            library_store,
            device,
            device_fs,
            adi,
            VirtualFileSystem::new(),
            apple_root_pem,
        ))
    }

    /// Start a brand-new session from a file on disk.
    pub fn init_from_path(
        path: impl AsRef<Path>,
        device_config: Option<AnisetteDeviceConfig>,
        apple_root_pem: Option<PathBuf>,
    ) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read library file {}", path.display()))?;
        Self::init_from_bytes(&bytes, device_config, apple_root_pem)
    }

    /// Start a brand-new session, downloading the library bundle from
    /// [`DEFAULT_LIBS_URL`].
    pub fn init_default(
        device_config: Option<AnisetteDeviceConfig>,
        apple_root_pem: Option<PathBuf>,
    ) -> Result<Self> {
        let bytes = download_library_bundle(DEFAULT_LIBS_URL)?;
        Self::init_from_bytes(&bytes, device_config, apple_root_pem)
    }

    /// Resume a session previously saved with [`Anisette::save_all`] or the
    /// split `save_provisioning`/`save_libs` pair, in either order.
    pub fn load<R: Read>(
        readers: impl IntoIterator<Item = R>,
        device_config: Option<AnisetteDeviceConfig>,
        apple_root_pem: Option<PathBuf>,
    ) -> Result<Self> {
        let collection = FSCollection::load(readers)?;

        let libs_fs = collection.get(LIBRARY_STORE_PATH).cloned().unwrap_or_default();
        let library_store = LibraryStore::from_virtfs(libs_fs);

        let mut device_fs = collection.get(DEVICE_FS_NAME).cloned().unwrap_or_default();
        let mut device = Device::load(&device_fs)?;
        if !device.initialized {
            device.initialize_defaults(device_config.unwrap_or_default());
            device.persist(&mut device_fs)?;
        }

        let mut adi = Self::build_adi(&library_store, &device)?;
        if let Some(adi_fs) = collection.get(ADI_FS_NAME) {
            adi.set_adi_fs(adi_fs.clone());
        }

        let cache_fs = collection.get(CACHE_FS_NAME).cloned().unwrap_or_default();

        Ok(Self::assemble(
            library_store,
            device,
            device_fs,
            adi,
            cache_fs,
            apple_root_pem,
        ))
    }

    fn build_adi(library_store: &LibraryStore, device: &Device) -> Result<Adi> {
        let adi = Adi::new(AdiInit {
            storeservicescore: library_store.storeservicescore()?,
            coreadi: library_store.coreadi()?,
            library_path: ".".to_string(),
            provisioning_path: Some(".".to_string()),
            identifier: Some(device.data.adi_identifier.clone()),
        })?;
        Ok(adi)
    }

    fn to_collection(&self) -> FSCollection {
        let mut collection = FSCollection::new();
        collection.insert(LIBRARY_STORE_PATH, self.library_store.vfs().clone());
        collection.insert(DEVICE_FS_NAME, self.device_fs.clone());
        collection.insert(ADI_FS_NAME, self.adi.adi_fs().clone());
        collection.insert(CACHE_FS_NAME, self.cache_fs.clone());
        collection
    }

    /// Save provisioning data (device identity + ADI state), excluding the
    /// (large, session-agnostic) library bundle.
    pub fn save_provisioning(&self, writer: impl std::io::Write) -> Result<()> {
        self.to_collection()
            .save(writer, None, Some(&[LIBRARY_STORE_PATH]))?;
        Ok(())
    }

    /// Save just the library bundle, re-usable across sessions.
    pub fn save_libs(&self, writer: impl std::io::Write) -> Result<()> {
        self.to_collection()
            .save(writer, Some(&[LIBRARY_STORE_PATH]), None)?;
        Ok(())
    }

    /// Save a complete, self-contained copy of this session.
    pub fn save_all(&self, writer: impl std::io::Write) -> Result<()> {
        self.to_collection().save_all(writer)?;
        Ok(())
    }

    /// Provision the virtual device, if it has not been provisioned yet.
    /// [`Anisette::get_data`] calls this implicitly.
    pub fn provision(&mut self) -> Result<()> {
        if self.adi.is_machine_provisioned(self.ds_id)? {
            return Ok(());
        }

        let mut session =
            ProvisioningSession::new(&mut self.adi, &self.device.data, self.apple_root_pem.clone())?;
        session.provision(self.ds_id)?;
        Ok(())
    }

    /// Obtain Anisette headers for this session, provisioning first if
    /// necessary.
    pub fn get_data(&mut self) -> Result<HashMap<String, String>> {
        self.provision()?;
        let otp = self.adi.request_otp(self.ds_id)?;

        let mut headers = HashMap::new();
        headers.insert("X-Apple-I-MD".to_string(), STANDARD.encode(&otp.otp));
        headers.insert(
            "X-Apple-I-MD-M".to_string(),
            STANDARD.encode(&otp.machine_id),
        );
        Ok(headers)
    }
}

fn download_library_bundle(url: &str) -> Result<Vec<u8>> {
    let response = reqwest::blocking::get(url)
        .with_context(|| format!("failed to download library bundle from {url}"))?
        .error_for_status()?;
    Ok(response.bytes()?.to_vec())
}
