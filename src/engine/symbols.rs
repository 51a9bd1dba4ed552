// 符号解析器：先走内存中的动态符号表，再回退到磁盘上的完整符号表
// 解析结果按 (模块实例键, 符号名) 缓存，模块存活期内幂等
use crate::errno::Errno;
use std::collections::BTreeMap;
use std::sync::Mutex;

use super::backend::Backend;
use super::registry::Module;
use super::state::MutexPoisonRecover;

mod hash;
pub(crate) mod dynsym;
pub(crate) mod symtab;

// ELF header e_ident 相关常量
pub(crate) const EI_NIDENT: usize = 16;
pub(crate) const EI_CLASS: usize = 4;
pub(crate) const EI_DATA: usize = 5;
pub(crate) const EI_VERSION: usize = 6;

pub(crate) const ELFMAG: [u8; 4] = [0x7f, b'E', b'L', b'F'];
pub(crate) const SELFMAG: usize = 4;

pub(crate) const ELFCLASS64: u8 = 2;
pub(crate) const ELFDATA2LSB: u8 = 1;
pub(crate) const EV_CURRENT: u8 = 1;

pub(crate) const ET_EXEC: u16 = 2;
pub(crate) const ET_DYN: u16 = 3;
pub(crate) const SHN_UNDEF: u16 = 0;
pub(crate) const PT_DYNAMIC: u32 = 2;
pub(crate) const SHT_SYMTAB: u32 = 2;

// dynamic section 标签常量
pub(crate) const DT_NULL: i64 = 0;
pub(crate) const DT_HASH: i64 = 4;
pub(crate) const DT_STRTAB: i64 = 5;
pub(crate) const DT_SYMTAB: i64 = 6;
pub(crate) const DT_STRSZ: i64 = 10;
pub(crate) const DT_GNU_HASH: i64 = 0x6ffffef5;

// ELF64 基本类型别名
pub(crate) type ElfAddr = u64;
pub(crate) type ElfOff = u64;
pub(crate) type ElfWord = u32;
pub(crate) type ElfXword = u64;
pub(crate) type ElfHalf = u16;

// ELF64 文件头，与 C 结构体 Elf64_Ehdr 内存布局一致
#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct ElfEhdr {
    pub(crate) e_ident: [u8; EI_NIDENT],
    pub(crate) e_type: ElfHalf,
    pub(crate) e_machine: ElfHalf,
    pub(crate) e_version: ElfWord,
    pub(crate) e_entry: ElfAddr,
    pub(crate) e_phoff: ElfOff,
    pub(crate) e_shoff: ElfOff,
    pub(crate) e_flags: ElfWord,
    pub(crate) e_ehsize: ElfHalf,
    pub(crate) e_phentsize: ElfHalf,
    pub(crate) e_phnum: ElfHalf,
    pub(crate) e_shentsize: ElfHalf,
    pub(crate) e_shnum: ElfHalf,
    pub(crate) e_shstrndx: ElfHalf,
}

// ELF64 符号表项，与 Elf64_Sym 内存布局一致
#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct ElfSym {
    pub(crate) st_name: ElfWord,
    pub(crate) st_info: u8,
    pub(crate) st_other: u8,
    pub(crate) st_shndx: ElfHalf,
    pub(crate) st_value: ElfAddr,
    pub(crate) st_size: ElfXword,
}

// 校验 e_ident：magic、64 位、小端、当前版本
pub(crate) fn check_ident(ident: &[u8; EI_NIDENT]) -> bool {
    ident[..SELFMAG] == ELFMAG
        && ident[EI_CLASS] == ELFCLASS64
        && ident[EI_DATA] == ELFDATA2LSB
        && ident[EI_VERSION] == EV_CURRENT
}

pub struct SymbolResolver {
    backend: &'static dyn Backend,
    cache: Mutex<BTreeMap<(String, String), usize>>,
}

impl SymbolResolver {
    pub(crate) fn new(backend: &'static dyn Backend) -> Self {
        Self {
            backend,
            cache: Mutex::new(BTreeMap::new()),
        }
    }

    // 解析 (module, name) -> 运行时地址
    // 模块存活期内幂等；已卸载模块返回 ModuleUnloaded
    pub fn resolve(&self, module: &Module, name: &str) -> Result<usize, Errno> {
        if module.unloaded {
            return Err(Errno::ModuleUnloaded);
        }
        if name.is_empty() {
            return Err(Errno::InvalidArg);
        }

        let cache_key = (module.key(), name.to_string());
        if let Some(addr) = self.cache.lock_or_poison().get(&cache_key) {
            return Ok(*addr);
        }

        let addr = self.backend.resolve_symbol(module, name)?;
        self.cache.lock_or_poison().insert(cache_key, addr);
        Ok(addr)
    }

    // 清理已卸载模块的缓存条目
    pub(crate) fn prune(&self, alive_keys: &[String]) {
        let mut cache = self.cache.lock_or_poison();
        cache.retain(|(module_key, _), _| alive_keys.iter().any(|key| key == module_key));
    }
}

#[cfg(test)]
mod tests {
    use super::SymbolResolver;
    use crate::engine::backend::Backend;
    use crate::engine::registry::Module;
    use crate::errno::Errno;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingBackend {
        calls: AtomicUsize,
    }

    impl Backend for CountingBackend {
        fn open_image(&self, _module: &Module) -> Result<(), Errno> {
            Ok(())
        }

        fn resolve_symbol(&self, _module: &Module, name: &str) -> Result<usize, Errno> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if name == "missing" {
                Err(Errno::NotFound)
            } else {
                Ok(0x7000_1000)
            }
        }

        fn read_slot(&self, _addr: usize) -> Result<usize, Errno> {
            Err(Errno::ReadElf)
        }

        fn patch_slot(&self, _addr: usize, _value: usize) -> Result<usize, Errno> {
            Err(Errno::InstallFailed)
        }
    }

    fn test_module(unloaded: bool) -> Module {
        Module {
            pathname: "/usr/lib/libfoo.so".to_string(),
            base_addr: 0x7000_0000,
            end_addr: 0x7001_0000,
            load_index: 1,
            unloaded,
        }
    }

    #[test]
    fn resolve_is_idempotent_and_cached() {
        static BACKEND: CountingBackend = CountingBackend {
            calls: AtomicUsize::new(0),
        };
        let resolver = SymbolResolver::new(&BACKEND);
        let module = test_module(false);

        let first = resolver.resolve(&module, "open").unwrap();
        let second = resolver.resolve(&module, "open").unwrap();
        assert_eq!(first, second);
        assert_eq!(BACKEND.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn resolve_reports_not_found_and_unloaded() {
        static BACKEND: CountingBackend = CountingBackend {
            calls: AtomicUsize::new(0),
        };
        let resolver = SymbolResolver::new(&BACKEND);

        assert_eq!(
            resolver.resolve(&test_module(false), "missing"),
            Err(Errno::NotFound)
        );
        assert_eq!(
            resolver.resolve(&test_module(true), "open"),
            Err(Errno::ModuleUnloaded)
        );
    }

    #[test]
    fn prune_drops_dead_module_entries() {
        static BACKEND: CountingBackend = CountingBackend {
            calls: AtomicUsize::new(0),
        };
        let resolver = SymbolResolver::new(&BACKEND);
        let module = test_module(false);
        resolver.resolve(&module, "open").unwrap();

        resolver.prune(&[]);
        resolver.resolve(&module, "open").unwrap();
        // prune 后缓存失效，后端被再次调用
        assert!(BACKEND.calls.load(Ordering::SeqCst) >= 2);
    }
}
