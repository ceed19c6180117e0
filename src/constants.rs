use unicorn_engine::RegisterARM64;

pub const PAGE_SIZE: u64 = 0x1000;

pub const RETURN_ADDRESS: u64 = 0xDEAD_0000;
pub const STACK_ADDRESS: u64 = 0xF000_0000;
pub const STACK_SIZE: u64 = 0x10_0000;

pub const MALLOC_ADDRESS: u64 = 0x6000_0000;
pub const MALLOC_SIZE: u64 = 0x10_00000;

pub const IMPORT_ADDRESS: u64 = 0xA000_0000;
pub const IMPORT_SIZE: u64 = 0x1000;
pub const IMPORT_LIBRARY_STRIDE: u64 = 0x0100_0000;
pub const IMPORT_LIBRARY_COUNT: usize = 10;

// Permanent arena: backs alloc_data, never reset (C-strings, SPIM/CPIM/PTM/TK
// buffers that must outlive a single invoke_cdecl round trip).
pub const DATA_ALLOC_BASE: u64 = 0x0008_0000_0000;
pub const DATA_ALLOC_SIZE: u64 = 0x1000_0000;

// Scratch arena: backs alloc_temporary, reset at the start of every
// invoke_cdecl (out-parameter slots only need to survive until that call
// returns to the host).
pub const SCRATCH_ALLOC_BASE: u64 = 0x0008_1000_0000;
pub const SCRATCH_ALLOC_SIZE: u64 = 0x1000_0000;

pub const LIB_ALLOC_BASE: u64 = 0x0010_0000;
pub const LIB_ALLOC_SIZE: u64 = 0x9000_0000;
pub const LIB_RESERVATION_SIZE: u64 = 0x1000_0000;

pub const O_WRONLY: u64 = 0o1;
pub const O_RDWR: u64 = 0o2;
pub const O_ACCMODE: u64 = 0o3;
pub const O_CREAT: u64 = 0o100;
pub const O_NOFOLLOW: u64 = 0o100000;

pub const ENOENT: u32 = 2;

pub const RET_AARCH64: [u8; 4] = [0xC0, 0x03, 0x5F, 0xD6];


// The AArch64 PCS only ever needs x0..x7 for this system (spec §4.4: up to
// eight integer/pointer arguments, nothing wider is passed by value).
pub const ARG_REGS: [RegisterARM64; 8] = [
    RegisterARM64::X0,
    RegisterARM64::X1,
    RegisterARM64::X2,
    RegisterARM64::X3,
    RegisterARM64::X4,
    RegisterARM64::X5,
    RegisterARM64::X6,
    RegisterARM64::X7,
];

pub const DEBUG_PRINT_ENABLED: bool = false;
pub const DEBUG_TRACE_ENABLED: bool = false;

pub const LIBRARY_STORE_PATH: &str = "libs";
pub const APK_LIB_ARCH_DIR: &str = "lib/arm64-v8a";
pub const STORESERVICESCORE_SO: &str = "libstoreservicescore.so";
pub const COREADI_SO: &str = "libCoreADI.so";

pub const DEVICE_FS_NAME: &str = "device";
pub const ADI_FS_NAME: &str = "adi";
pub const CACHE_FS_NAME: &str = "cache";

pub const DEVICE_JSON_PATH: &str = "device.json";

// ds_id = (u64)(c_ulonglong)(-2), preserved bit-for-bit per spec §9 Open Question.
pub const DS_ID: u64 = 0xFFFF_FFFF_FFFF_FFFE;

pub const ADI_NOT_PROVISIONED_CODE: i32 = -45061;

pub const DEFAULT_LIBS_URL: &str = "https://anisette.dl.mikealmel.ooo/libs?arch=arm64-v8a";
