//! Production [`InterceptionSeam`]: a word-sized write into a (normally
//! read-only) dispatch table, bracketed by memory-protection changes.

use std::ptr;

use tracing::{debug, warn};

use super::{
    HookError,
    seam::{DispatchTarget, InterceptionSeam, SlotHook},
};

/// Patches slots through the platform's memory-protection API.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtectedSlots;

impl InterceptionSeam for ProtectedSlots {
    unsafe fn install(
        &self,
        target: DispatchTarget,
        replacement: usize,
    ) -> Result<SlotHook, HookError> {
        // SAFETY: the caller guarantees `target` is a live slot.
        let original = unsafe { write_protected(target.slot_ptr(), replacement)? };
        debug!(
            table = format_args!("{:#x}", target.table()),
            slot = target.slot(),
            original = format_args!("{original:#x}"),
            "Dispatch slot swapped"
        );
        Ok(SlotHook::new(target, original, replacement))
    }
}

#[cfg(unix)]
unsafe fn write_protected(slot: *mut usize, value: usize) -> Result<usize, HookError> {
    use libc::{PROT_WRITE, c_void};

    let page_size = page_size();
    let page = (slot as usize) & !(page_size - 1);
    let current = current_protection(slot as usize);
    let writable = current & PROT_WRITE != 0;

    if !writable {
        // SAFETY: `page` is the page containing a live slot.
        let rc = unsafe { libc::mprotect(page as *mut c_void, page_size, current | PROT_WRITE) };
        if rc != 0 {
            return Err(HookError::Protect(std::io::Error::last_os_error().to_string()));
        }
    }

    // SAFETY: the slot is mapped and now writable.
    let original = unsafe { ptr::read_volatile(slot) };
    unsafe { ptr::write_volatile(slot, value) };

    if !writable {
        // SAFETY: as above.
        let rc = unsafe { libc::mprotect(page as *mut c_void, page_size, current) };
        if rc != 0 {
            warn!(
                error = %std::io::Error::last_os_error(),
                "Failed to restore dispatch table protection"
            );
        }
    }
    Ok(original)
}

#[cfg(windows)]
unsafe fn write_protected(slot: *mut usize, value: usize) -> Result<usize, HookError> {
    use windows_sys::Win32::System::Memory::{
        PAGE_EXECUTE_READWRITE, PAGE_PROTECTION_FLAGS, VirtualProtect,
    };

    let size = std::mem::size_of::<usize>();
    let mut previous: PAGE_PROTECTION_FLAGS = 0;
    // SAFETY: `slot` is a live, mapped address.
    let ok = unsafe { VirtualProtect(slot.cast(), size, PAGE_EXECUTE_READWRITE, &raw mut previous) };
    if ok == 0 {
        return Err(HookError::Protect(std::io::Error::last_os_error().to_string()));
    }

    // SAFETY: the slot is now writable.
    let original = unsafe { ptr::read_volatile(slot) };
    unsafe { ptr::write_volatile(slot, value) };

    let mut ignored: PAGE_PROTECTION_FLAGS = 0;
    // SAFETY: as above.
    if unsafe { VirtualProtect(slot.cast(), size, previous, &raw mut ignored) } == 0 {
        warn!(
            error = %std::io::Error::last_os_error(),
            "Failed to restore dispatch table protection"
        );
    }
    Ok(original)
}

#[cfg(unix)]
fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(size).ok().filter(|s| s.is_power_of_two()).unwrap_or(4096)
}

/// Protection of the mapping containing `addr`.
#[cfg(target_os = "linux")]
fn current_protection(addr: usize) -> libc::c_int {
    std::fs::read_to_string("/proc/self/maps")
        .ok()
        .and_then(|maps| protection_from_maps(&maps, addr))
        .unwrap_or(libc::PROT_READ)
}

/// Dispatch tables live in read-only data; assume that where the mapping
/// cannot be queried.
#[cfg(all(unix, not(target_os = "linux")))]
fn current_protection(_addr: usize) -> libc::c_int {
    libc::PROT_READ
}

/// Parses `/proc/<pid>/maps` and returns the protection of the mapping
/// containing `addr`.
#[cfg(target_os = "linux")]
fn protection_from_maps(maps: &str, addr: usize) -> Option<libc::c_int> {
    maps.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        let (start, end) = fields.next()?.split_once('-')?;
        let start = usize::from_str_radix(start, 16).ok()?;
        let end = usize::from_str_radix(end, 16).ok()?;
        if !(start..end).contains(&addr) {
            return None;
        }
        let perms = fields.next()?.as_bytes();
        let mut prot = libc::PROT_NONE;
        if perms.first() == Some(&b'r') {
            prot |= libc::PROT_READ;
        }
        if perms.get(1) == Some(&b'w') {
            prot |= libc::PROT_WRITE;
        }
        if perms.get(2) == Some(&b'x') {
            prot |= libc::PROT_EXEC;
        }
        Some(prot)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_os = "linux")]
    #[test]
    fn test_protection_from_maps() {
        let maps = "\
00400000-00452000 r-xp 00000000 08:02 173521      /usr/bin/host
00651000-00652000 r--p 00051000 08:02 173521      /usr/bin/host
00652000-00655000 rw-p 00052000 08:02 173521      /usr/bin/host
";

        assert_eq!(
            protection_from_maps(maps, 0x0040_1000),
            Some(libc::PROT_READ | libc::PROT_EXEC)
        );
        assert_eq!(protection_from_maps(maps, 0x0065_1008), Some(libc::PROT_READ));
        assert_eq!(
            protection_from_maps(maps, 0x0065_2000),
            Some(libc::PROT_READ | libc::PROT_WRITE)
        );
        assert_eq!(protection_from_maps(maps, 0x0070_0000), None);
    }

    #[test]
    fn test_install_on_writable_table() {
        let table: &'static mut [usize; 4] = Box::leak(Box::new([10, 11, 12, 13]));
        let target = DispatchTarget::new(table.as_ptr() as usize, 2);

        // SAFETY: `table` is leaked and has four entries.
        let hook = unsafe { ProtectedSlots.install(target, 99) }.unwrap();

        assert_eq!(hook.original(), 12);
        assert_eq!(hook.replacement(), 99);
        // SAFETY: as above.
        assert_eq!(unsafe { ptr::read_volatile(target.slot_ptr()) }, 99);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_install_on_read_only_page_restores_protection() {
        let page_size = page_size();
        // SAFETY: anonymous private mapping of one page.
        let page = unsafe {
            libc::mmap(
                ptr::null_mut(),
                page_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert_ne!(page, libc::MAP_FAILED);
        let table = page.cast::<usize>();
        // SAFETY: the page is mapped read-write.
        unsafe {
            table.write(1);
            table.add(1).write(2);
            table.add(2).write(3);
            assert_eq!(libc::mprotect(page, page_size, libc::PROT_READ), 0);
        }
        let target = DispatchTarget::new(table as usize, 1);

        // SAFETY: the slot lies inside the mapping.
        let hook = unsafe { ProtectedSlots.install(target, 42) }.unwrap();

        assert_eq!(hook.original(), 2);
        // SAFETY: the page is still mapped readable.
        assert_eq!(unsafe { table.add(1).read() }, 42);
        assert_eq!(current_protection(table as usize), libc::PROT_READ);
        // SAFETY: unmapping the page created above.
        unsafe { libc::munmap(page, page_size) };
    }
}
