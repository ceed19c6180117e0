mod adi;
mod allocator;
mod anisette;
mod constants;
mod debug;
mod device;
mod emu;
mod errors;
mod fs_collection;
mod library_store;
mod provisioning;
mod runtime;
mod stub;
mod util;
mod vfs;

pub use adi::{Adi, AdiInit, OtpResult, ProvisioningStartResult};
pub use allocator::Allocator;
pub use anisette::Anisette;
pub use constants::{DEFAULT_LIBS_URL, DS_ID};
pub use device::{AnisetteDeviceConfig, Device, DeviceData};
pub use emu::EmuCore;
pub use errors::VmError;
pub use fs_collection::FSCollection;
pub use library_store::LibraryStore;
pub use provisioning::{ProvisioningSession, ProvisioningState};
pub use vfs::{Stat, VirtualFileSystem};
