// 内存中动态符号表的解析与查找
// 通过 PT_DYNAMIC 定位 symtab/strtab/hash 表，按 GNU_HASH 优先、DT_HASH 兜底
use crate::errno::Errno;
use std::ffi::CStr;
use std::mem;

use super::hash::{elf_gnu_hash, elf_hash};
use super::{
    DT_GNU_HASH, DT_HASH, DT_NULL, DT_STRSZ, DT_STRTAB, DT_SYMTAB, ElfEhdr, ElfSym, ET_EXEC,
    PT_DYNAMIC, SHN_UNDEF, check_ident,
};
use crate::engine::registry::Module;

// ELF64 程序头，与 Elf64_Phdr 内存布局一致
#[repr(C)]
#[derive(Clone, Copy)]
struct ElfPhdr {
    p_type: u32,
    p_flags: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_paddr: u64,
    p_filesz: u64,
    p_memsz: u64,
    p_align: u64,
}

// ELF64 dynamic 表项，与 Elf64_Dyn 内存布局一致
#[repr(C)]
#[derive(Clone, Copy)]
struct ElfDyn {
    d_tag: i64,
    d_val: u64,
}

// 解析完成的内存镜像视图，指针均已校验落在模块范围内
struct DynImage {
    base: usize,
    end: usize,
    is_exec: bool,
    symtab: *const ElfSym,
    strtab: *const u8,
    strtab_size: usize,
    gnu_hash: Option<GnuHashTable>,
    sysv_hash: Option<SysvHashTable>,
}

struct GnuHashTable {
    bucket_cnt: u32,
    symoffset: u32,
    bloom_sz: u32,
    bloom_shift: u32,
    bloom: *const usize,
    bucket: *const u32,
    chain: *const u32,
}

struct SysvHashTable {
    bucket_cnt: u32,
    chain_cnt: u32,
    bucket: *const u32,
    chain: *const u32,
}

// 校验模块基址处是一个可解析的 64 位小端 ELF 镜像
pub(crate) fn verify_image(module: &Module) -> Result<(), Errno> {
    open_image(module).map(|_| ())
}

// 在内存镜像的动态符号表中查找符号运行时地址
pub(crate) fn resolve_in_image(module: &Module, name: &str) -> Result<usize, Errno> {
    let image = open_image(module)?;
    let symidx = image.find_symidx_by_name(name)?;
    let sym = image.symbol(symidx).ok_or(Errno::ReadElf)?;
    if sym.st_shndx == SHN_UNDEF || sym.st_value == 0 {
        return Err(Errno::NotFound);
    }
    Ok(image.runtime_addr(sym.st_value as usize))
}

fn open_image(module: &Module) -> Result<DynImage, Errno> {
    let base = module.base_addr;
    let end = module.end_addr;
    if base == 0 || end <= base || end - base < mem::size_of::<ElfEhdr>() {
        return Err(Errno::ReadElf);
    }

    let ehdr = unsafe { &*(base as *const ElfEhdr) };
    if !check_ident(&ehdr.e_ident) {
        return Err(Errno::ReadElf);
    }

    // 程序头表必须整体落在镜像范围内
    let phoff = ehdr.e_phoff as usize;
    let phnum = ehdr.e_phnum as usize;
    let phdr_bytes = phnum.checked_mul(mem::size_of::<ElfPhdr>())
        .ok_or(Errno::ReadElf)?;
    if phoff == 0 || phnum == 0 || phoff.saturating_add(phdr_bytes) > end - base {
        return Err(Errno::ReadElf);
    }

    let phdrs = (base + phoff) as *const ElfPhdr;
    let mut dynamic = None;
    for index in 0..phnum {
        let phdr = unsafe { &*phdrs.add(index) };
        if phdr.p_type == PT_DYNAMIC {
            dynamic = Some((phdr.p_vaddr as usize, phdr.p_memsz as usize));
            break;
        }
    }
    let (dyn_vaddr, dyn_size) = dynamic.ok_or(Errno::ReadElf)?;
    // PIE/so 的运行时地址 = base + vaddr，非 PIE 可执行文件 vaddr 即绝对地址
    let bias = if ehdr.e_type == ET_EXEC { 0 } else { base };
    let dyn_addr = bias.checked_add(dyn_vaddr).ok_or(Errno::ReadElf)?;
    if dyn_addr + dyn_size > end {
        return Err(Errno::ReadElf);
    }

    let mut image = DynImage {
        base,
        end,
        is_exec: ehdr.e_type == ET_EXEC,
        symtab: std::ptr::null(),
        strtab: std::ptr::null(),
        strtab_size: 0,
        gnu_hash: None,
        sysv_hash: None,
    };

    // 遍历 dynamic 表。d_val 在部分 linker 下已重定位为绝对地址，
    // 统一按「小于 base 视为相对」修正
    let adjust = |value: usize| -> usize {
        if value < base { bias + value } else { value }
    };
    let dyn_entries = dyn_addr as *const ElfDyn;
    let dyn_count = dyn_size / mem::size_of::<ElfDyn>();
    for index in 0..dyn_count {
        let entry = unsafe { &*dyn_entries.add(index) };
        match entry.d_tag {
            DT_NULL => break,
            DT_SYMTAB => image.symtab = adjust(entry.d_val as usize) as *const ElfSym,
            DT_STRTAB => image.strtab = adjust(entry.d_val as usize) as *const u8,
            DT_STRSZ => image.strtab_size = entry.d_val as usize,
            DT_GNU_HASH => image.gnu_hash = parse_gnu_hash(adjust(entry.d_val as usize), end),
            DT_HASH => image.sysv_hash = parse_sysv_hash(adjust(entry.d_val as usize), end),
            _ => {}
        }
    }

    if image.symtab.is_null() || image.strtab.is_null() {
        return Err(Errno::ReadElf);
    }
    if !image.in_range(image.symtab as usize) || !image.in_range(image.strtab as usize) {
        return Err(Errno::ReadElf);
    }
    if image.gnu_hash.is_none() && image.sysv_hash.is_none() {
        return Err(Errno::ReadElf);
    }
    Ok(image)
}

// GNU_HASH 布局：nbucket, symoffset, bloom_sz, bloom_shift, bloom[], bucket[], chain[]
fn parse_gnu_hash(addr: usize, end: usize) -> Option<GnuHashTable> {
    if addr == 0 || addr + 16 > end {
        return None;
    }
    let header = addr as *const u32;
    let bucket_cnt = unsafe { *header };
    let symoffset = unsafe { *header.add(1) };
    let bloom_sz = unsafe { *header.add(2) };
    let bloom_shift = unsafe { *header.add(3) };
    if bucket_cnt == 0 || bloom_sz == 0 {
        return None;
    }
    let bloom = (addr + 16) as *const usize;
    let bucket = (addr + 16 + bloom_sz as usize * mem::size_of::<usize>()) as *const u32;
    let chain = unsafe { bucket.add(bucket_cnt as usize) };
    Some(GnuHashTable {
        bucket_cnt,
        symoffset,
        bloom_sz,
        bloom_shift,
        bloom,
        bucket,
        chain,
    })
}

// DT_HASH 布局：nbucket, nchain, bucket[], chain[]
fn parse_sysv_hash(addr: usize, end: usize) -> Option<SysvHashTable> {
    if addr == 0 || addr + 8 > end {
        return None;
    }
    let header = addr as *const u32;
    let bucket_cnt = unsafe { *header };
    let chain_cnt = unsafe { *header.add(1) };
    if bucket_cnt == 0 {
        return None;
    }
    let bucket = (addr + 8) as *const u32;
    let chain = unsafe { bucket.add(bucket_cnt as usize) };
    Some(SysvHashTable {
        bucket_cnt,
        chain_cnt,
        bucket,
        chain,
    })
}

impl DynImage {
    fn in_range(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.end
    }

    fn runtime_addr(&self, st_value: usize) -> usize {
        if self.is_exec {
            st_value
        } else {
            self.base + st_value
        }
    }

    fn symbol(&self, index: u32) -> Option<&ElfSym> {
        let addr = unsafe { self.symtab.add(index as usize) } as usize;
        if !self.in_range(addr) {
            return None;
        }
        Some(unsafe { &*(addr as *const ElfSym) })
    }

    fn sym_name(&self, index: u32) -> Option<&str> {
        let sym = self.symbol(index)?;
        let name_off = sym.st_name as usize;
        if self.strtab_size != 0 && name_off >= self.strtab_size {
            return None;
        }
        let name_addr = self.strtab as usize + name_off;
        if !self.in_range(name_addr) {
            return None;
        }
        unsafe { CStr::from_ptr(name_addr as *const libc::c_char) }
            .to_str()
            .ok()
    }

    fn find_symidx_by_name(&self, symbol: &str) -> Result<u32, Errno> {
        if self.gnu_hash.is_some() {
            self.gnu_hash_lookup(symbol)
        } else {
            self.elf_hash_lookup(symbol)
        }
    }

    // 通过 DT_HASH 的 bucket/chain 链表查找符号
    fn elf_hash_lookup(&self, symbol: &str) -> Result<u32, Errno> {
        let Some(table) = &self.sysv_hash else {
            return Err(Errno::NotFound);
        };
        let hash = elf_hash(symbol.as_bytes());
        let mut i = unsafe { *table.bucket.add((hash % table.bucket_cnt) as usize) };
        let mut steps = 0u32;
        while i != 0 && steps <= table.chain_cnt {
            if let Some(name) = self.sym_name(i)
                && name == symbol
            {
                return Ok(i);
            }
            i = unsafe { *table.chain.add(i as usize) };
            steps += 1;
        }
        Err(Errno::NotFound)
    }

    // GNU hash 查找：bloom filter 快速排除 -> bucket 定位 -> chain 遍历
    fn gnu_hash_lookup(&self, symbol: &str) -> Result<u32, Errno> {
        let Some(table) = &self.gnu_hash else {
            return Err(Errno::NotFound);
        };
        let hash = elf_gnu_hash(symbol.as_bytes());
        let elfclass_bits = mem::size_of::<usize>() * 8;
        let bloom_idx = (hash as usize / elfclass_bits) % table.bloom_sz as usize;
        let word = unsafe { *table.bloom.add(bloom_idx) };
        // bloom filter 双位检测，任一位未命中则符号必不存在
        let mask = (1usize << (hash as usize % elfclass_bits))
            | (1usize << ((hash >> table.bloom_shift) as usize % elfclass_bits));
        if (word & mask) != mask {
            return Err(Errno::NotFound);
        }

        let mut i = unsafe { *table.bucket.add((hash % table.bucket_cnt) as usize) };
        if i < table.symoffset {
            return Err(Errno::NotFound);
        }

        // 遍历 chain，hash 低位匹配后再比较符号名；chain 最低位为 1 表示链尾
        loop {
            let symhash = unsafe { *table.chain.add((i - table.symoffset) as usize) };
            if (hash | 1) == (symhash | 1)
                && let Some(name) = self.sym_name(i)
                && name == symbol
            {
                return Ok(i);
            }
            if (symhash & 1) != 0 {
                break;
            }
            i += 1;
        }
        Err(Errno::NotFound)
    }
}
