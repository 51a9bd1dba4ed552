// 目标格式后端抽象，所有镜像解析和槽位读写都经过这一层
// 当前只有 ELF 实现，接口保持窄以便测试替身

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::engine::memory;
use crate::engine::registry::Module;
use crate::engine::symbols::{dynsym, symtab};
use crate::errno::Errno;
use crate::log;

pub(crate) trait Backend: Send + Sync {
    // 校验镜像可被本后端解析
    fn open_image(&self, module: &Module) -> Result<(), Errno>;
    // 按名字解析符号的运行时地址
    fn resolve_symbol(&self, module: &Module, name: &str) -> Result<usize, Errno>;
    // 读取一个指针槽位的当前值
    fn read_slot(&self, addr: usize) -> Result<usize, Errno>;
    // 原子替换槽位内容，返回旧值
    fn patch_slot(&self, addr: usize, value: usize) -> Result<usize, Errno>;
}

pub(crate) struct ElfBackend;

pub(crate) static ELF_BACKEND: ElfBackend = ElfBackend;

impl Backend for ElfBackend {
    fn open_image(&self, module: &Module) -> Result<(), Errno> {
        dynsym::verify_image(module)
    }

    // 动态符号表优先，查不到再回退磁盘 .symtab
    fn resolve_symbol(&self, module: &Module, name: &str) -> Result<usize, Errno> {
        match dynsym::resolve_in_image(module, name) {
            Ok(addr) => Ok(addr),
            Err(Errno::NotFound) => symtab::resolve_in_file(module, name),
            Err(err) => Err(err),
        }
    }

    fn read_slot(&self, addr: usize) -> Result<usize, Errno> {
        if addr == 0 || addr % std::mem::size_of::<usize>() != 0 {
            return Err(Errno::InvalidArg);
        }
        let prot = memory::get_addr_protect(addr)?;
        if prot & memory::PROT_READ_FLAG == 0 {
            return Err(Errno::GetProt);
        }
        let slot = unsafe { &*(addr as *const AtomicUsize) };
        Ok(slot.load(Ordering::SeqCst))
    }

    // 对齐原子写保证不会出现撕裂的半新半旧槽位
    // 写后回读校验，不一致时回滚旧值
    fn patch_slot(&self, addr: usize, value: usize) -> Result<usize, Errno> {
        if addr == 0 || addr % std::mem::size_of::<usize>() != 0 {
            return Err(Errno::InvalidArg);
        }

        let prot = memory::get_addr_protect(addr)?;
        let need_unprotect = prot & memory::PROT_WRITE_FLAG == 0;
        if need_unprotect {
            memory::set_addr_protect(addr, prot | memory::PROT_WRITE_FLAG)?;
        }

        let slot = unsafe { &*(addr as *const AtomicUsize) };
        let old = slot.swap(value, Ordering::SeqCst);

        let mut result = Ok(old);
        let readback = slot.load(Ordering::SeqCst);
        if readback != value {
            log::error(format_args!(
                "slot verify failed at {addr:#x}: wrote {value:#x} read {readback:#x}"
            ));
            slot.store(old, Ordering::SeqCst);
            result = Err(Errno::SlotVerify);
        }

        if need_unprotect && let Err(err) = memory::set_addr_protect(addr, prot) {
            // 恢复保护失败不回滚写入，只记录
            log::warn(format_args!(
                "restore protection failed at {addr:#x}: {:?}",
                err
            ));
        }
        memory::flush_slot_write(addr);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::{Backend, ELF_BACKEND};
    use crate::errno::Errno;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static SLOT: AtomicUsize = AtomicUsize::new(0x1111);

    #[test]
    fn patch_slot_swaps_and_returns_old_value() {
        SLOT.store(0x1111, Ordering::SeqCst);
        let addr = &SLOT as *const AtomicUsize as usize;

        let old = ELF_BACKEND.patch_slot(addr, 0x2222).unwrap();
        assert_eq!(old, 0x1111);
        assert_eq!(SLOT.load(Ordering::SeqCst), 0x2222);
        assert_eq!(ELF_BACKEND.read_slot(addr).unwrap(), 0x2222);

        ELF_BACKEND.patch_slot(addr, 0x1111).unwrap();
    }

    #[test]
    fn misaligned_slot_is_rejected() {
        let addr = &SLOT as *const AtomicUsize as usize + 1;
        assert_eq!(ELF_BACKEND.read_slot(addr), Err(Errno::InvalidArg));
        assert_eq!(ELF_BACKEND.patch_slot(addr, 0), Err(Errno::InvalidArg));
    }

    #[test]
    fn null_slot_is_rejected() {
        assert_eq!(ELF_BACKEND.read_slot(0), Err(Errno::InvalidArg));
    }
}
