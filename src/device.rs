use std::fmt::Write as _;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::DEVICE_JSON_PATH;
use crate::errors::VmError;
use crate::vfs::VirtualFileSystem;

const DEFAULT_CLIENT_INFO: &str =
    "<MacBookPro13,2> <macOS;13.1;22C65> <com.apple.AuthKit/1 (com.apple.dt.Xcode/3594.4.19)>";

/// Fresh values for a device record that has never been provisioned.
#[derive(Debug, Clone)]
pub struct AnisetteDeviceConfig {
    pub server_friendly_description: String,
    pub unique_device_id: String,
    pub adi_id: String,
    pub local_user_uuid: String,
}

impl Default for AnisetteDeviceConfig {
    fn default() -> Self {
        Self {
            server_friendly_description: DEFAULT_CLIENT_INFO.to_string(),
            unique_device_id: Uuid::new_v4().to_string().to_uppercase(),
            adi_id: random_hex(8, false),
            local_user_uuid: random_hex(32, true),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeviceData {
    #[serde(rename = "UUID")]
    pub unique_device_identifier: String,
    #[serde(rename = "clientInfo")]
    pub server_friendly_description: String,
    #[serde(rename = "identifier")]
    pub adi_identifier: String,
    #[serde(rename = "localUUID")]
    pub local_user_uuid: String,
}

impl From<AnisetteDeviceConfig> for DeviceData {
    fn from(config: AnisetteDeviceConfig) -> Self {
        Self {
            unique_device_identifier: config.unique_device_id,
            server_friendly_description: config.server_friendly_description,
            adi_identifier: config.adi_id,
            local_user_uuid: config.local_user_uuid,
        }
    }
}

/// A device record backed by the "device" member of the session's
/// `FSCollection`. Loading a fresh (never-persisted) filesystem produces an
/// uninitialized record; `initialize_defaults` fills it and `persist` writes
/// it back as compact JSON at [`DEVICE_JSON_PATH`].
#[derive(Debug, Clone)]
pub struct Device {
    pub data: DeviceData,
    pub initialized: bool,
}

impl Device {
    pub fn load(fs: &VirtualFileSystem) -> Result<Self, VmError> {
        if !fs.exists(DEVICE_JSON_PATH) {
            return Ok(Self {
                data: DeviceData::default(),
                initialized: false,
            });
        }

        let bytes = fs.read_file(DEVICE_JSON_PATH)?;
        let data: DeviceData = serde_json::from_slice(&bytes)?;

        Ok(Self {
            data,
            initialized: true,
        })
    }

    pub fn initialize_defaults(&mut self, config: AnisetteDeviceConfig) {
        self.data = config.into();
        self.initialized = true;
    }

    pub fn persist(&self, fs: &mut VirtualFileSystem) -> Result<(), VmError> {
        let bytes = serde_json::to_vec(&self.data)?;
        fs.write_file(DEVICE_JSON_PATH, bytes)?;
        Ok(())
    }
}

fn random_hex(byte_len: usize, uppercase: bool) -> String {
    let mut bytes = vec![0_u8; byte_len];
    rand::thread_rng().fill_bytes(&mut bytes);

    let mut output = String::with_capacity(byte_len * 2);
    for byte in bytes {
        let _ = write!(output, "{byte:02x}");
    }

    if uppercase {
        output.make_ascii_uppercase();
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_filesystem_loads_uninitialized() {
        let fs = VirtualFileSystem::new();
        let device = Device::load(&fs).expect("load");
        assert!(!device.initialized);
        assert!(device.data.unique_device_identifier.is_empty());
    }

    #[test]
    fn persist_then_load_round_trips_as_compact_json() {
        let mut fs = VirtualFileSystem::new();
        let mut device = Device::load(&fs).unwrap();
        device.initialize_defaults(AnisetteDeviceConfig {
            server_friendly_description: DEFAULT_CLIENT_INFO.to_string(),
            unique_device_id: "ABCDEF".to_string(),
            adi_id: "0011223344556677".to_string(),
            local_user_uuid: "A".repeat(64),
        });
        device.persist(&mut fs).expect("persist");

        let bytes = fs.read_file(DEVICE_JSON_PATH).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(!text.contains('\n'));
        assert_eq!(
            text,
            format!(
                "{{\"UUID\":\"ABCDEF\",\"clientInfo\":\"{}\",\"identifier\":\"0011223344556677\",\"localUUID\":\"{}\"}}",
                DEFAULT_CLIENT_INFO,
                "A".repeat(64)
            )
        );

        let reloaded = Device::load(&fs).expect("reload");
        assert!(reloaded.initialized);
        assert_eq!(reloaded.data.unique_device_identifier, "ABCDEF");
    }

    #[test]
    fn default_config_generates_expected_shapes() {
        let config = AnisetteDeviceConfig::default();
        assert_eq!(config.server_friendly_description, DEFAULT_CLIENT_INFO);
        assert_eq!(config.adi_id.len(), 16);
        assert_eq!(config.local_user_uuid.len(), 64);
        assert_eq!(config.local_user_uuid, config.local_user_uuid.to_uppercase());
    }
}
