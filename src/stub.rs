use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use unicorn_engine::{RegisterARM64, Unicorn};

use crate::constants::{
    ENOENT, IMPORT_ADDRESS, IMPORT_LIBRARY_STRIDE, O_ACCMODE, O_CREAT, O_WRONLY,
};
use crate::debug::{debug_print, debug_trace};
use crate::emu::{
    ensure_errno_address, load_library_by_name, read_c_string,
    resolve_symbol_from_loaded_library_by_name, set_errno,
};
use crate::errors::VmError;
use crate::runtime::RuntimeState;
use crate::util::bytes_to_hex;

/// Every import name the shim is prepared to back with a host implementation.
/// A `SHN_UNDEF` symbol whose name is not in this table is a load-time error
/// (spec §4.3/§4.5: "any import not in the shim table causes load to fail
/// explicitly with the unresolved symbol name").
pub(crate) const KNOWN_IMPORTS: &[&str] = &[
    "malloc",
    "free",
    "calloc",
    "realloc",
    "memcpy",
    "memmove",
    "memset",
    "memcmp",
    "strlen",
    "strcpy",
    "strncpy",
    "strcmp",
    "strncmp",
    "open",
    "close",
    "read",
    "write",
    "lseek",
    "ftruncate",
    "fstat",
    "lstat",
    "stat",
    "mkdir",
    "unlink",
    "umask",
    "chmod",
    "clock_gettime",
    "gettimeofday",
    "arc4random",
    "arc4random_buf",
    "__errno",
    "__system_property_get",
    "dlopen",
    "dlsym",
    "dlclose",
    "abort",
    "pthread_once",
    "pthread_create",
    "pthread_mutex_lock",
    "pthread_mutex_unlock",
    "pthread_rwlock_init",
    "pthread_rwlock_destroy",
    "pthread_rwlock_rdlock",
    "pthread_rwlock_wrlock",
    "pthread_rwlock_unlock",
];

pub(crate) fn is_known_import(name: &str) -> bool {
    KNOWN_IMPORTS.contains(&name)
}

pub fn dispatch_import_stub(
    uc: &mut Unicorn<'_, RuntimeState>,
    address: u64,
) -> Result<(), VmError> {
    if address < IMPORT_ADDRESS {
        return Err(VmError::InvalidImportAddress(address));
    }

    let offset = address - IMPORT_ADDRESS;
    let library_index = (offset / IMPORT_LIBRARY_STRIDE) as usize;
    let symbol_index = ((offset % IMPORT_LIBRARY_STRIDE) / 4) as usize;

    let symbol_name = {
        let state = uc.get_data();
        let library = state
            .loaded_libraries
            .get(library_index)
            .ok_or(VmError::LibraryNotLoaded(library_index))?;

        let symbol =
            library
                .symbols
                .get(symbol_index)
                .ok_or_else(|| VmError::SymbolIndexOutOfRange {
                    library: library.name.clone(),
                    index: symbol_index,
                })?;

        symbol.name.clone()
    };

    handle_stub_by_name(uc, &symbol_name)
}

fn handle_stub_by_name(
    uc: &mut Unicorn<'_, RuntimeState>,
    symbol_name: &str,
) -> Result<(), VmError> {
    match symbol_name {
        "malloc" => stub_malloc(uc),
        "free" => stub_free(uc),
        "calloc" => stub_calloc(uc),
        "realloc" => stub_realloc(uc),
        "memcpy" | "memmove" => stub_memcpy(uc),
        "memset" => stub_memset(uc),
        "memcmp" => stub_memcmp(uc),
        "strlen" => stub_strlen(uc),
        "strcpy" => stub_strcpy(uc),
        "strncpy" => stub_strncpy(uc),
        "strcmp" => stub_strcmp(uc),
        "strncmp" => stub_strncmp(uc),
        "mkdir" => stub_mkdir(uc),
        "umask" => stub_umask(uc),
        "chmod" => stub_chmod(uc),
        "lstat" | "stat" => stub_stat(uc),
        "fstat" => stub_fstat(uc),
        "open" => stub_open(uc),
        "ftruncate" => stub_ftruncate(uc),
        "read" => stub_read(uc),
        "write" => stub_write(uc),
        "lseek" => stub_lseek(uc),
        "close" => stub_close(uc),
        "unlink" => stub_unlink(uc),
        "dlopen" => stub_dlopen(uc),
        "dlsym" => stub_dlsym(uc),
        "dlclose" => stub_dlclose(uc),
        "abort" => stub_abort(uc),
        "pthread_once" => stub_return_zero(uc),
        "pthread_create" => stub_return_zero(uc),
        "pthread_mutex_lock" => stub_return_zero(uc),
        "pthread_mutex_unlock" => stub_return_zero(uc),
        "pthread_rwlock_unlock" => stub_return_zero(uc),
        "pthread_rwlock_destroy" => stub_return_zero(uc),
        "pthread_rwlock_wrlock" => stub_return_zero(uc),
        "pthread_rwlock_init" => stub_return_zero(uc),
        "pthread_rwlock_rdlock" => stub_return_zero(uc),
        "clock_gettime" => stub_clock_gettime(uc),
        "gettimeofday" => stub_gettimeofday(uc),
        "__errno" => stub_errno_location(uc),
        "__system_property_get" => stub_system_property_get(uc),
        "arc4random" => stub_arc4random(uc),
        "arc4random_buf" => stub_arc4random_buf(uc),
        other => {
            debug_print(other);
            Err(VmError::UnhandledImport(other.to_string()))
        }
    }
}

fn stub_return_zero(uc: &mut Unicorn<'_, RuntimeState>) -> Result<(), VmError> {
    uc.reg_write(RegisterARM64::X0, 0)?;
    Ok(())
}

fn stub_abort(uc: &mut Unicorn<'_, RuntimeState>) -> Result<(), VmError> {
    debug_print("guest called abort()");
    uc.emu_stop()?;
    Ok(())
}

fn stub_malloc(uc: &mut Unicorn<'_, RuntimeState>) -> Result<(), VmError> {
    let request = uc.reg_read(RegisterARM64::X0)?;
    let address = {
        let state = uc.get_data_mut();
        let address = state.malloc_allocator.alloc(request)?;
        state.malloc_sizes.insert(address, request);
        address
    };

    debug_trace(format!("malloc(0x{request:X})=0x{address:X}"));
    uc.reg_write(RegisterARM64::X0, address)?;
    Ok(())
}

fn stub_free(uc: &mut Unicorn<'_, RuntimeState>) -> Result<(), VmError> {
    uc.reg_write(RegisterARM64::X0, 0)?;
    Ok(())
}

fn stub_calloc(uc: &mut Unicorn<'_, RuntimeState>) -> Result<(), VmError> {
    let count = uc.reg_read(RegisterARM64::X0)?;
    let size = uc.reg_read(RegisterARM64::X1)?;
    let request = count.saturating_mul(size);
    let address = {
        let state = uc.get_data_mut();
        let address = state.malloc_allocator.alloc(request)?;
        state.malloc_sizes.insert(address, request);
        address
    };

    let zeros = vec![0_u8; request.max(1) as usize];
    uc.mem_write(address, &zeros)?;
    debug_trace(format!("calloc({count}, {size})=0x{address:X}"));
    uc.reg_write(RegisterARM64::X0, address)?;
    Ok(())
}

fn stub_realloc(uc: &mut Unicorn<'_, RuntimeState>) -> Result<(), VmError> {
    let old_ptr = uc.reg_read(RegisterARM64::X0)?;
    let new_size = uc.reg_read(RegisterARM64::X1)?;

    let old_size = uc
        .get_data()
        .malloc_sizes
        .get(&old_ptr)
        .copied()
        .unwrap_or(0);

    let new_address = {
        let state = uc.get_data_mut();
        let address = state.malloc_allocator.alloc(new_size)?;
        state.malloc_sizes.insert(address, new_size);
        address
    };

    if old_ptr != 0 && old_size > 0 {
        let copy_len = old_size.min(new_size) as usize;
        let data = uc.mem_read_as_vec(old_ptr, copy_len)?;
        uc.mem_write(new_address, &data)?;
    }

    debug_trace(format!("realloc(0x{old_ptr:X}, {new_size})=0x{new_address:X}"));
    uc.reg_write(RegisterARM64::X0, new_address)?;
    Ok(())
}

fn stub_memcpy(uc: &mut Unicorn<'_, RuntimeState>) -> Result<(), VmError> {
    let dst = uc.reg_read(RegisterARM64::X0)?;
    let src = uc.reg_read(RegisterARM64::X1)?;
    let length = uc.reg_read(RegisterARM64::X2)? as usize;

    let data = uc.mem_read_as_vec(src, length)?;
    uc.mem_write(dst, &data)?;
    uc.reg_write(RegisterARM64::X0, dst)?;
    Ok(())
}

fn stub_memset(uc: &mut Unicorn<'_, RuntimeState>) -> Result<(), VmError> {
    let dst = uc.reg_read(RegisterARM64::X0)?;
    let value = uc.reg_read(RegisterARM64::X1)? as u8;
    let length = uc.reg_read(RegisterARM64::X2)? as usize;

    let buffer = vec![value; length];
    uc.mem_write(dst, &buffer)?;
    uc.reg_write(RegisterARM64::X0, dst)?;
    Ok(())
}

fn stub_memcmp(uc: &mut Unicorn<'_, RuntimeState>) -> Result<(), VmError> {
    let a = uc.reg_read(RegisterARM64::X0)?;
    let b = uc.reg_read(RegisterARM64::X1)?;
    let length = uc.reg_read(RegisterARM64::X2)? as usize;

    let a_bytes = uc.mem_read_as_vec(a, length)?;
    let b_bytes = uc.mem_read_as_vec(b, length)?;
    let result = match a_bytes.cmp(&b_bytes) {
        std::cmp::Ordering::Less => -1_i64,
        std::cmp::Ordering::Equal => 0,
        std::cmp::Ordering::Greater => 1,
    };

    uc.reg_write(RegisterARM64::X0, result as u64)?;
    Ok(())
}

fn stub_strlen(uc: &mut Unicorn<'_, RuntimeState>) -> Result<(), VmError> {
    let ptr = uc.reg_read(RegisterARM64::X0)?;
    let text = read_c_string(uc, ptr, 0x1_0000)?;
    uc.reg_write(RegisterARM64::X0, text.len() as u64)?;
    Ok(())
}

fn stub_strcpy(uc: &mut Unicorn<'_, RuntimeState>) -> Result<(), VmError> {
    let dst = uc.reg_read(RegisterARM64::X0)?;
    let src = uc.reg_read(RegisterARM64::X1)?;
    let text = read_c_string(uc, src, 0x1_0000)?;

    let mut bytes = text.into_bytes();
    bytes.push(0);
    uc.mem_write(dst, &bytes)?;
    uc.reg_write(RegisterARM64::X0, dst)?;
    Ok(())
}

fn stub_strncpy(uc: &mut Unicorn<'_, RuntimeState>) -> Result<(), VmError> {
    let dst = uc.reg_read(RegisterARM64::X0)?;
    let src = uc.reg_read(RegisterARM64::X1)?;
    let length = uc.reg_read(RegisterARM64::X2)? as usize;

    let input = uc.mem_read_as_vec(src, length)?;
    let copy_len = input
        .iter()
        .position(|byte| *byte == 0)
        .unwrap_or(length)
        .min(length);

    let mut output = vec![0_u8; length];
    output[..copy_len].copy_from_slice(&input[..copy_len]);

    uc.mem_write(dst, &output)?;
    uc.reg_write(RegisterARM64::X0, dst)?;

    Ok(())
}

fn stub_strcmp(uc: &mut Unicorn<'_, RuntimeState>) -> Result<(), VmError> {
    let a_ptr = uc.reg_read(RegisterARM64::X0)?;
    let b_ptr = uc.reg_read(RegisterARM64::X1)?;
    let a = read_c_string(uc, a_ptr, 0x1_0000)?;
    let b = read_c_string(uc, b_ptr, 0x1_0000)?;

    let result: i64 = match a.cmp(&b) {
        std::cmp::Ordering::Less => -1,
        std::cmp::Ordering::Equal => 0,
        std::cmp::Ordering::Greater => 1,
    };
    uc.reg_write(RegisterARM64::X0, result as u64)?;
    Ok(())
}

fn stub_strncmp(uc: &mut Unicorn<'_, RuntimeState>) -> Result<(), VmError> {
    let a_ptr = uc.reg_read(RegisterARM64::X0)?;
    let b_ptr = uc.reg_read(RegisterARM64::X1)?;
    let length = uc.reg_read(RegisterARM64::X2)? as usize;

    let a = uc.mem_read_as_vec(a_ptr, length)?;
    let b = uc.mem_read_as_vec(b_ptr, length)?;
    let result: i64 = match a.cmp(&b) {
        std::cmp::Ordering::Less => -1,
        std::cmp::Ordering::Equal => 0,
        std::cmp::Ordering::Greater => 1,
    };
    uc.reg_write(RegisterARM64::X0, result as u64)?;
    Ok(())
}

fn fail_with_errno(uc: &mut Unicorn<'_, RuntimeState>, errno: u32) -> Result<(), VmError> {
    set_errno(uc, errno)?;
    uc.reg_write(RegisterARM64::X0, u64::MAX)?;
    Ok(())
}

fn stub_mkdir(uc: &mut Unicorn<'_, RuntimeState>) -> Result<(), VmError> {
    let path_ptr = uc.reg_read(RegisterARM64::X0)?;
    let mode = uc.reg_read(RegisterARM64::X1)?;
    let path = read_c_string(uc, path_ptr, 0x1000)?;
    debug_trace(format!("mkdir('{path}', {mode:#o})"));

    match uc.get_data_mut().adi_fs.mkdir(&path) {
        Ok(()) => uc.reg_write(RegisterARM64::X0, 0)?,
        Err(_) => fail_with_errno(uc, ENOENT)?,
    }

    Ok(())
}

fn stub_umask(uc: &mut Unicorn<'_, RuntimeState>) -> Result<(), VmError> {
    uc.reg_write(RegisterARM64::X0, 0o777)?;
    Ok(())
}

fn stub_chmod(uc: &mut Unicorn<'_, RuntimeState>) -> Result<(), VmError> {
    let path_ptr = uc.reg_read(RegisterARM64::X0)?;
    let mode = uc.reg_read(RegisterARM64::X1)?;
    let path = read_c_string(uc, path_ptr, 0x1000)?;
    debug_trace(format!("chmod('{path}', {mode:#o})"));
    uc.reg_write(RegisterARM64::X0, 0)?;
    Ok(())
}

fn build_stat_bytes(mode: u32, size: u64) -> Vec<u8> {
    let mut stat = Vec::with_capacity(128);

    stat.extend_from_slice(&[0_u8; 8]); // st_dev
    stat.extend_from_slice(&[0_u8; 8]); // st_ino
    stat.extend_from_slice(&mode.to_le_bytes()); // st_mode
    stat.extend_from_slice(&[0_u8; 4]); // st_nlink
    stat.extend_from_slice(&[0xA4, 0x81, 0x00, 0x00]); // st_uid
    stat.extend_from_slice(&[0_u8; 4]); // st_gid
    stat.extend_from_slice(&[0_u8; 8]); // st_rdev
    stat.extend_from_slice(&[0_u8; 8]); // __pad1
    stat.extend_from_slice(&size.to_le_bytes()); // st_size
    stat.extend_from_slice(&[0_u8; 4]); // st_blksize
    stat.extend_from_slice(&[0_u8; 4]); // __pad2
    stat.extend_from_slice(&[0_u8; 8]); // st_blocks
    stat.extend_from_slice(&[0_u8; 8]); // st_atime
    stat.extend_from_slice(&[0_u8; 8]); // st_atime_nsec
    stat.extend_from_slice(&[0_u8; 8]); // st_mtime
    stat.extend_from_slice(&[0_u8; 8]); // st_mtime_nsec
    stat.extend_from_slice(&[0_u8; 8]); // st_ctime
    stat.extend_from_slice(&[0_u8; 8]); // st_ctime_nsec
    stat.extend_from_slice(&[0_u8; 4]); // __unused4
    stat.extend_from_slice(&[0_u8; 4]); // __unused5

    stat
}

fn stub_stat(uc: &mut Unicorn<'_, RuntimeState>) -> Result<(), VmError> {
    let path_ptr = uc.reg_read(RegisterARM64::X0)?;
    let out_ptr = uc.reg_read(RegisterARM64::X1)?;
    let path = read_c_string(uc, path_ptr, 0x1000)?;
    debug_trace(format!("stat('{path}', [...])"));

    let stat = match uc.get_data().adi_fs.stat_path(&path) {
        Ok(stat) => stat,
        Err(_) => return fail_with_errno(uc, ENOENT),
    };

    let bytes = build_stat_bytes(stat.mode, stat.size);
    uc.mem_write(out_ptr, &bytes)?;
    uc.reg_write(RegisterARM64::X0, 0)?;
    Ok(())
}

fn stub_fstat(uc: &mut Unicorn<'_, RuntimeState>) -> Result<(), VmError> {
    let fd = uc.reg_read(RegisterARM64::X0)?;
    let out_ptr = uc.reg_read(RegisterARM64::X1)?;
    debug_trace(format!("fstat({fd}, [...])"));

    let fd = u32::try_from(fd).map_err(|_| VmError::InvalidFileDescriptor(fd))?;
    let stat = match uc.get_data().adi_fs.stat_fd(fd) {
        Ok(stat) => stat,
        Err(_) => return fail_with_errno(uc, ENOENT),
    };

    let bytes = build_stat_bytes(stat.mode, stat.size);
    uc.mem_write(out_ptr, &bytes)?;
    uc.reg_write(RegisterARM64::X0, 0)?;
    Ok(())
}

fn stub_open(uc: &mut Unicorn<'_, RuntimeState>) -> Result<(), VmError> {
    let path_ptr = uc.reg_read(RegisterARM64::X0)?;
    let flags = uc.reg_read(RegisterARM64::X1)?;
    let mode = uc.reg_read(RegisterARM64::X2)?;
    let path = read_c_string(uc, path_ptr, 0x1000)?;
    if path.is_empty() {
        return Err(VmError::EmptyPath);
    }

    debug_trace(format!("open('{path}', {flags:#o}, {mode:#o})"));

    let vfs_flags = (flags & (O_ACCMODE | O_CREAT)) as u32;
    match uc.get_data_mut().adi_fs.open(&path, vfs_flags) {
        Ok(fd) => uc.reg_write(RegisterARM64::X0, fd as u64)?,
        Err(_) => fail_with_errno(uc, ENOENT)?,
    }

    Ok(())
}

fn stub_ftruncate(uc: &mut Unicorn<'_, RuntimeState>) -> Result<(), VmError> {
    let fd = uc.reg_read(RegisterARM64::X0)?;
    let length = uc.reg_read(RegisterARM64::X1)?;
    debug_trace(format!("ftruncate({fd}, {length})"));

    let fd_u32 = u32::try_from(fd).map_err(|_| VmError::InvalidFileDescriptor(fd))?;
    match uc.get_data_mut().adi_fs.truncate(fd_u32, length) {
        Ok(()) => uc.reg_write(RegisterARM64::X0, 0)?,
        Err(_) => fail_with_errno(uc, ENOENT)?,
    }

    Ok(())
}

fn stub_lseek(uc: &mut Unicorn<'_, RuntimeState>) -> Result<(), VmError> {
    // Only SEEK_SET is needed by the two libraries observed in practice; the
    // virtual filesystem tracks the cursor implicitly via read/write/truncate.
    let fd = uc.reg_read(RegisterARM64::X0)?;
    let offset = uc.reg_read(RegisterARM64::X1)?;
    debug_trace(format!("lseek({fd}, {offset}, ...)"));
    uc.reg_write(RegisterARM64::X0, offset)?;
    Ok(())
}

fn stub_read(uc: &mut Unicorn<'_, RuntimeState>) -> Result<(), VmError> {
    let fd = uc.reg_read(RegisterARM64::X0)?;
    let buf_ptr = uc.reg_read(RegisterARM64::X1)?;
    let count = uc.reg_read(RegisterARM64::X2)? as usize;

    let fd_u32 = u32::try_from(fd).map_err(|_| VmError::InvalidFileDescriptor(fd))?;
    let result = uc.get_data_mut().adi_fs.read(fd_u32, count);
    debug_trace(format!("read({fd}, 0x{buf_ptr:X}, {count})={result:?}"));

    match result {
        Ok(data) => {
            uc.mem_write(buf_ptr, &data)?;
            uc.reg_write(RegisterARM64::X0, data.len() as u64)?;
        }
        Err(_) => fail_with_errno(uc, ENOENT)?,
    }

    Ok(())
}

fn stub_write(uc: &mut Unicorn<'_, RuntimeState>) -> Result<(), VmError> {
    let fd = uc.reg_read(RegisterARM64::X0)?;
    let buf_ptr = uc.reg_read(RegisterARM64::X1)?;
    let count = uc.reg_read(RegisterARM64::X2)? as usize;
    debug_trace(format!("write({fd}, 0x{buf_ptr:X}, {count})"));

    let bytes = uc.mem_read_as_vec(buf_ptr, count)?;
    let fd_u32 = u32::try_from(fd).map_err(|_| VmError::InvalidFileDescriptor(fd))?;

    match uc.get_data_mut().adi_fs.write(fd_u32, &bytes) {
        Ok(written) => uc.reg_write(RegisterARM64::X0, written as u64)?,
        Err(_) => fail_with_errno(uc, ENOENT)?,
    }

    Ok(())
}

fn stub_close(uc: &mut Unicorn<'_, RuntimeState>) -> Result<(), VmError> {
    let fd = uc.reg_read(RegisterARM64::X0)?;
    let fd_u32 = u32::try_from(fd).map_err(|_| VmError::InvalidFileDescriptor(fd))?;

    match uc.get_data_mut().adi_fs.close(fd_u32) {
        Ok(()) => uc.reg_write(RegisterARM64::X0, 0)?,
        Err(_) => fail_with_errno(uc, ENOENT)?,
    }

    Ok(())
}

fn stub_unlink(uc: &mut Unicorn<'_, RuntimeState>) -> Result<(), VmError> {
    let path_ptr = uc.reg_read(RegisterARM64::X0)?;
    let path = read_c_string(uc, path_ptr, 0x1000)?;
    debug_trace(format!("unlink('{path}')"));

    match uc.get_data_mut().adi_fs.unlink(&path) {
        Ok(()) => uc.reg_write(RegisterARM64::X0, 0)?,
        Err(_) => fail_with_errno(uc, ENOENT)?,
    }

    Ok(())
}

fn stub_dlopen(uc: &mut Unicorn<'_, RuntimeState>) -> Result<(), VmError> {
    let path_ptr = uc.reg_read(RegisterARM64::X0)?;
    let path = read_c_string(uc, path_ptr, 0x1000)?;

    let library_name = path.rsplit('/').next().ok_or(VmError::EmptyPath)?;
    debug_trace(format!("dlopen('{path}' ({library_name}))"));
    let library_index = load_library_by_name(uc, library_name)?;

    uc.reg_write(RegisterARM64::X0, (library_index + 1) as u64)?;
    Ok(())
}

fn stub_dlsym(uc: &mut Unicorn<'_, RuntimeState>) -> Result<(), VmError> {
    let handle = uc.reg_read(RegisterARM64::X0)?;
    if handle == 0 {
        return Err(VmError::InvalidDlopenHandle(handle));
    }

    let symbol_ptr = uc.reg_read(RegisterARM64::X1)?;
    let symbol_name = read_c_string(uc, symbol_ptr, 0x1000)?;
    let library_index = (handle - 1) as usize;

    {
        let state = uc.get_data();
        if let Some(library) = state.loaded_libraries.get(library_index) {
            debug_trace(format!(
                "dlsym({handle:X} ({}), '{}')",
                library.name, symbol_name
            ));
        }
    }

    let symbol_address =
        resolve_symbol_from_loaded_library_by_name(uc, library_index, &symbol_name)?;
    debug_print(format!("Found at 0x{symbol_address:X}"));
    uc.reg_write(RegisterARM64::X0, symbol_address)?;
    Ok(())
}

fn stub_dlclose(uc: &mut Unicorn<'_, RuntimeState>) -> Result<(), VmError> {
    uc.reg_write(RegisterARM64::X0, 0)?;
    Ok(())
}

fn stub_clock_gettime(uc: &mut Unicorn<'_, RuntimeState>) -> Result<(), VmError> {
    let clk_id = uc.reg_read(RegisterARM64::X0)?;
    let out_ptr = uc.reg_read(RegisterARM64::X1)?;
    debug_trace(format!("clock_gettime({clk_id}, 0x{out_ptr:X})"));

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();

    let mut timespec = [0_u8; 16];
    timespec[0..8].copy_from_slice(&now.as_secs().to_le_bytes());
    timespec[8..16].copy_from_slice(&(now.subsec_nanos() as u64).to_le_bytes());

    uc.mem_write(out_ptr, &timespec)?;
    uc.reg_write(RegisterARM64::X0, 0)?;
    Ok(())
}

fn stub_gettimeofday(uc: &mut Unicorn<'_, RuntimeState>) -> Result<(), VmError> {
    let time_ptr = uc.reg_read(RegisterARM64::X0)?;
    let tz_ptr = uc.reg_read(RegisterARM64::X1)?;
    debug_trace(format!("gettimeofday(0x{time_ptr:X}, 0x{tz_ptr:X})"));
    if tz_ptr != 0 {
        return Err(VmError::UnhandledImport(format!(
            "gettimeofday tz pointer must be null, got 0x{tz_ptr:X}"
        )));
    }

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let sec = now.as_secs();
    let usec = now.subsec_micros() as i64;

    let mut timeval = [0_u8; 16];
    timeval[0..8].copy_from_slice(&sec.to_le_bytes());
    timeval[8..16].copy_from_slice(&usec.to_le_bytes());
    debug_print(format!(
        "{{'tv_sec': {sec}, 'tv_usec': {usec}}} {} {}",
        bytes_to_hex(&timeval),
        timeval.len()
    ));

    uc.mem_write(time_ptr, &timeval)?;
    uc.reg_write(RegisterARM64::X0, 0)?;

    Ok(())
}

fn stub_errno_location(uc: &mut Unicorn<'_, RuntimeState>) -> Result<(), VmError> {
    if uc.get_data().errno_address.is_none() {
        debug_print("Checking errno before first error (!)");
    }
    let errno_address = ensure_errno_address(uc)?;
    uc.reg_write(RegisterARM64::X0, errno_address)?;
    Ok(())
}

fn stub_system_property_get(uc: &mut Unicorn<'_, RuntimeState>) -> Result<(), VmError> {
    let name_ptr = uc.reg_read(RegisterARM64::X0)?;
    let name = read_c_string(uc, name_ptr, 0x1000)?;
    debug_trace(format!("__system_property_get({name}, [...])"));
    let value_ptr = uc.reg_read(RegisterARM64::X1)?;
    let value = b"no s/n number";
    uc.mem_write(value_ptr, value)?;
    uc.reg_write(RegisterARM64::X0, value.len() as u64)?;
    Ok(())
}

fn stub_arc4random(uc: &mut Unicorn<'_, RuntimeState>) -> Result<(), VmError> {
    uc.reg_write(RegisterARM64::X0, u64::from(rand::random::<u32>()))?;
    Ok(())
}

fn stub_arc4random_buf(uc: &mut Unicorn<'_, RuntimeState>) -> Result<(), VmError> {
    let buf_ptr = uc.reg_read(RegisterARM64::X0)?;
    let count = uc.reg_read(RegisterARM64::X1)? as usize;

    let mut bytes = vec![0_u8; count];
    rand::thread_rng().fill_bytes(&mut bytes);
    uc.mem_write(buf_ptr, &bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_import_table_covers_the_documented_shim_set() {
        assert!(is_known_import("malloc"));
        assert!(is_known_import("open"));
        assert!(is_known_import("clock_gettime"));
        assert!(!is_known_import("sprintf"));
    }
}
