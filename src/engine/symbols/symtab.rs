// 磁盘 ELF 的 .symtab 全量符号表遍历
// 私有符号不进动态符号表，只能从文件的 section header 侧读取
use crate::errno::Errno;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::mem;

use super::{ET_EXEC, EI_NIDENT, ElfEhdr, SHN_UNDEF, SHT_SYMTAB, check_ident};
use crate::engine::registry::Module;

// 单个 section 的 size 上限，防御损坏的 section header
const SECTION_SIZE_LIMIT: usize = 512 * 1024 * 1024;

const SHDR_SIZE: usize = 64;
const SYM_SIZE: usize = 24;

// 在模块对应的磁盘文件中查找符号，返回运行时地址
pub(crate) fn resolve_in_file(module: &Module, name: &str) -> Result<usize, Errno> {
    let mut file = File::open(&module.pathname).map_err(|_| Errno::ReadElf)?;

    let mut ehdr_bytes = [0u8; mem::size_of::<ElfEhdr>()];
    file.read_exact(&mut ehdr_bytes).map_err(|_| Errno::ReadElf)?;
    let ident: [u8; EI_NIDENT] = ehdr_bytes[..EI_NIDENT].try_into().map_err(|_| Errno::ReadElf)?;
    if !check_ident(&ident) {
        return Err(Errno::ReadElf);
    }
    let e_type = read_u16(&ehdr_bytes, 16);
    let e_shoff = read_u64(&ehdr_bytes, 40) as usize;
    let e_shentsize = read_u16(&ehdr_bytes, 58) as usize;
    let e_shnum = read_u16(&ehdr_bytes, 60) as usize;
    if e_shoff == 0 || e_shnum == 0 || e_shentsize != SHDR_SIZE {
        return Err(Errno::NotFound);
    }

    let shdrs = read_section(&mut file, e_shoff, e_shnum * SHDR_SIZE)?;

    // 定位 SHT_SYMTAB 及其 sh_link 指向的字符串表
    let mut symtab = None;
    for index in 0..e_shnum {
        let shdr = &shdrs[index * SHDR_SIZE..(index + 1) * SHDR_SIZE];
        if read_u32(shdr, 4) == SHT_SYMTAB {
            symtab = Some((
                read_u64(shdr, 24) as usize, // sh_offset
                read_u64(shdr, 32) as usize, // sh_size
                read_u32(shdr, 40) as usize, // sh_link
            ));
            break;
        }
    }
    // 被 strip 的镜像没有 .symtab，按符号缺失处理
    let (sym_off, sym_size, str_index) = symtab.ok_or(Errno::NotFound)?;
    if str_index >= e_shnum {
        return Err(Errno::ReadElf);
    }
    let str_shdr = &shdrs[str_index * SHDR_SIZE..(str_index + 1) * SHDR_SIZE];
    let str_off = read_u64(str_shdr, 24) as usize;
    let str_size = read_u64(str_shdr, 32) as usize;

    let syms = read_section(&mut file, sym_off, sym_size)?;
    let strtab = read_section(&mut file, str_off, str_size)?;

    let target = name.as_bytes();
    for sym in syms.chunks_exact(SYM_SIZE) {
        let st_name = read_u32(sym, 0) as usize;
        let st_shndx = read_u16(sym, 6);
        let st_value = read_u64(sym, 8) as usize;
        if st_shndx == SHN_UNDEF || st_value == 0 {
            continue;
        }
        if !name_matches(&strtab, st_name, target) {
            continue;
        }
        let addr = if e_type == ET_EXEC {
            st_value
        } else {
            module.base_addr + st_value
        };
        return Ok(addr);
    }
    Err(Errno::NotFound)
}

fn read_section(file: &mut File, offset: usize, size: usize) -> Result<Vec<u8>, Errno> {
    if size == 0 || size > SECTION_SIZE_LIMIT {
        return Err(Errno::ReadElf);
    }
    file.seek(SeekFrom::Start(offset as u64))
        .map_err(|_| Errno::ReadElf)?;
    let mut bytes = vec![0u8; size];
    file.read_exact(&mut bytes).map_err(|_| Errno::ReadElf)?;
    Ok(bytes)
}

// 比较 strtab 中 NUL 结尾的名字与目标符号
fn name_matches(strtab: &[u8], offset: usize, target: &[u8]) -> bool {
    let Some(candidate) = strtab.get(offset..offset + target.len()) else {
        return false;
    };
    candidate == target && strtab.get(offset + target.len()) == Some(&0)
}

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(buf)
}
