// 内存页面保护属性的读取与修改，通过解析 /proc/self/maps 获取权限
// 只操作数据槽位（指针槽），不涉及代码页，因此无需 icache 维护

use crate::errno::Errno;
use crate::log;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::sync::atomic::{Ordering, fence};

pub(crate) const PROT_READ_FLAG: u32 = 0x1;
pub(crate) const PROT_WRITE_FLAG: u32 = 0x2;
pub(crate) const PROT_EXEC_FLAG: u32 = 0x4;

// 查询单个指针大小地址的保护属性
pub(crate) fn get_addr_protect(addr: usize) -> Result<u32, Errno> {
    scan_maps_for_protect(addr, std::mem::size_of::<usize>())
}

// 逐行扫描 /proc/self/maps，收集覆盖 [addr, addr+len) 的所有段的权限
// 跨段时取权限交集；仅匹配私有映射（perm[3] == 'p'）
fn scan_maps_for_protect(addr: usize, len: usize) -> Result<u32, Errno> {
    let mut start_addr = addr;
    let end_addr = addr.saturating_add(len);
    let mut prot: u32 = 0;
    let mut load0 = true;
    let mut found_all = false;

    let file = File::open("/proc/self/maps").map_err(|_| Errno::BadMaps)?;
    let reader = BufReader::new(file);

    for line in reader.lines() {
        let line = line.map_err(|_| Errno::BadMaps)?;

        let mut parts = line.split_whitespace();
        let range = match parts.next() {
            Some(value) => value,
            None => continue,
        };
        let perm = match parts.next() {
            Some(value) => value,
            None => continue,
        };

        if perm.len() < 4 {
            continue;
        }
        let perm_bytes = perm.as_bytes();
        if perm_bytes[3] != b'p' {
            continue;
        }

        let mut range_parts = range.split('-');
        let start_str = match range_parts.next() {
            Some(value) => value,
            None => continue,
        };
        let end_str = match range_parts.next() {
            Some(value) => value,
            None => continue,
        };
        let start = usize::from_str_radix(start_str, 16).unwrap_or(0);
        let end = usize::from_str_radix(end_str, 16).unwrap_or(0);

        if start_addr < start || start_addr >= end {
            continue;
        }

        if load0 {
            if perm_bytes[0] == b'r' {
                prot |= PROT_READ_FLAG;
            }
            if perm_bytes[1] == b'w' {
                prot |= PROT_WRITE_FLAG;
            }
            if perm_bytes[2] == b'x' {
                prot |= PROT_EXEC_FLAG;
            }
            load0 = false;
        } else {
            if perm_bytes[0] != b'r' {
                prot &= !PROT_READ_FLAG;
            }
            if perm_bytes[1] != b'w' {
                prot &= !PROT_WRITE_FLAG;
            }
            if perm_bytes[2] != b'x' {
                prot &= !PROT_EXEC_FLAG;
            }
        }

        if end_addr <= end {
            found_all = true;
            break;
        }
        start_addr = end;
    }

    if !found_all {
        return Err(Errno::GetProt);
    }

    Ok(prot)
}

// 修改指定地址所在页面的保护属性
pub(crate) fn set_addr_protect(addr: usize, prot: u32) -> Result<(), Errno> {
    let (start, len) = page_bounds(addr);
    let result = unsafe { libc::mprotect(start as *mut libc::c_void, len, prot as i32) };
    if result != 0 {
        let err = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        log::error(format_args!("mprotect failed: {err}"));
        return Err(Errno::SetProt);
    }
    Ok(())
}

// 槽位写入后的全局可见性屏障
pub(crate) fn flush_slot_write(addr: usize) {
    let _ = addr;
    fence(Ordering::SeqCst);
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

// 计算地址所在页面的起始地址和覆盖长度（页对齐）
fn page_bounds(addr: usize) -> (usize, usize) {
    let page_size = page_size();
    if page_size == 0 {
        return (addr, std::mem::size_of::<usize>());
    }
    let page_mask = !(page_size - 1);
    let start = addr & page_mask;
    let end = (addr + std::mem::size_of::<usize>() - 1) & page_mask;
    let end = end + page_size;
    (start, end - start)
}
