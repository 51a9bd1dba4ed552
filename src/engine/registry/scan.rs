// 镜像扫描，合并 dl_iterate_phdr 和 /proc/self/maps 两种数据源
use crate::log;
use std::collections::BTreeMap;
use std::ffi::{CStr, c_void};
use std::fs;
use std::ops::Bound;

use super::maps::{MapsModule, enumerate_modules_maps};

// 单次扫描观察到的镜像及其地址范围
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct ScannedModule {
    pub(crate) pathname: String,
    pub(crate) base_addr: usize,
    pub(crate) end_addr: usize,
}

// 扫描结果，complete=false 表示枚举能力受限，仅拿到可观察子集
#[derive(Clone, Debug)]
pub(crate) struct ScanOutcome {
    pub(crate) modules: Vec<ScannedModule>,
    pub(crate) complete: bool,
}

// 模块加载/卸载计数，用于检测模块列表是否发生变化
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct ModuleEpoch {
    pub(crate) adds: u64,
    pub(crate) subs: u64,
}

// 通过 dl_iterate_phdr 获取加载/卸载计数，仅需遍历第一个条目
pub(crate) fn module_epoch() -> Option<ModuleEpoch> {
    unsafe extern "C" fn iterate_cb(
        info: *mut libc::dl_phdr_info,
        _size: usize,
        data: *mut c_void,
    ) -> libc::c_int {
        if info.is_null() || data.is_null() {
            return 1;
        }
        let info = unsafe { &*info };
        let epoch = unsafe { &mut *(data as *mut ModuleEpoch) };
        epoch.adds = info.dlpi_adds;
        epoch.subs = info.dlpi_subs;
        1
    }

    let mut epoch = ModuleEpoch { adds: 0, subs: 0 };
    let ret =
        unsafe { libc::dl_iterate_phdr(Some(iterate_cb), &mut epoch as *mut _ as *mut c_void) };
    if ret == 0 { None } else { Some(epoch) }
}

// 合并 phdr 和 maps 两种数据源
// phdr 提供权威的 PT_LOAD 范围，maps 补充 phdr 看不到的映射并修正路径
pub(crate) fn enumerate_modules() -> ScanOutcome {
    let phdr_modules = enumerate_modules_phdr();
    let maps_modules = enumerate_modules_maps();
    let complete = !phdr_modules.is_empty() || maps_modules.is_some();
    if !complete {
        log::warn(format_args!(
            "no module enumeration source available, registry degraded"
        ));
    }

    let modules = merge_sources(phdr_modules, maps_modules.unwrap_or_default());
    ScanOutcome { modules, complete }
}

fn merge_sources(
    phdr_modules: Vec<ScannedModule>,
    maps_modules: Vec<MapsModule>,
) -> Vec<ScannedModule> {
    let mut modules_by_base = BTreeMap::<usize, ScannedModule>::new();
    let mut order = Vec::new();
    for module in phdr_modules {
        order.push(module.base_addr);
        modules_by_base.insert(module.base_addr, module);
    }

    for module in maps_modules {
        // maps 的文件映射可能不连续，范围延伸在下一个已知基址处截断，避免吞掉邻居
        let next_base = modules_by_base
            .range((Bound::Excluded(module.base_addr), Bound::Unbounded))
            .next()
            .map(|(base, _)| *base);
        let end_addr = match next_base {
            Some(base) => module.end_addr.min(base),
            None => module.end_addr,
        };
        match modules_by_base.get_mut(&module.base_addr) {
            Some(existing) => {
                // maps 路径与内存保护查询一致，优先采用
                if !module.pathname.is_empty() && existing.pathname != module.pathname {
                    existing.pathname = module.pathname.clone();
                }
                existing.end_addr = existing.end_addr.max(end_addr);
            }
            None => {
                order.push(module.base_addr);
                modules_by_base.insert(
                    module.base_addr,
                    ScannedModule {
                        pathname: module.pathname,
                        base_addr: module.base_addr,
                        end_addr,
                    },
                );
            }
        }
    }

    order
        .into_iter()
        .filter_map(|base| modules_by_base.remove(&base))
        .filter(|module| !module.pathname.is_empty() && module.end_addr > module.base_addr)
        .collect()
}

fn enumerate_modules_phdr() -> Vec<ScannedModule> {
    unsafe extern "C" fn iterate_cb(
        info: *mut libc::dl_phdr_info,
        _size: usize,
        data: *mut c_void,
    ) -> libc::c_int {
        let modules = unsafe { &mut *(data as *mut Vec<ScannedModule>) };
        if info.is_null() {
            return 0;
        }
        let info = unsafe { &*info };

        let pathname = if info.dlpi_name.is_null() {
            String::new()
        } else {
            unsafe { CStr::from_ptr(info.dlpi_name) }
                .to_str()
                .unwrap_or("")
                .to_string()
        };
        // 首条目是主可执行文件，dlpi_name 为空，路径从 /proc/self/exe 取
        let pathname = if pathname.is_empty() {
            if modules.is_empty() {
                main_executable_path()
            } else {
                return 0;
            }
        } else {
            pathname
        };
        if pathname.starts_with('[') {
            return 0;
        }

        let Some((start, end)) = load_span(info) else {
            return 0;
        };
        modules.push(ScannedModule {
            pathname,
            base_addr: start,
            end_addr: end,
        });
        0
    }

    let mut modules = Vec::<ScannedModule>::new();
    unsafe {
        libc::dl_iterate_phdr(Some(iterate_cb), &mut modules as *mut _ as *mut c_void);
    }
    modules
}

// 计算镜像全部 PT_LOAD 段覆盖的运行时地址范围
fn load_span(info: &libc::dl_phdr_info) -> Option<(usize, usize)> {
    if info.dlpi_phdr.is_null() || info.dlpi_phnum == 0 {
        return None;
    }
    let base = info.dlpi_addr as usize;
    let mut start = usize::MAX;
    let mut end = 0usize;
    for index in 0..info.dlpi_phnum as usize {
        let phdr = unsafe { &*info.dlpi_phdr.add(index) };
        if phdr.p_type != libc::PT_LOAD {
            continue;
        }
        let seg_start = base.wrapping_add(phdr.p_vaddr as usize);
        let seg_end = seg_start.wrapping_add(phdr.p_memsz as usize);
        if seg_end <= seg_start {
            continue;
        }
        start = start.min(seg_start);
        end = end.max(seg_end);
    }
    if start >= end { None } else { Some((start, end)) }
}

fn main_executable_path() -> String {
    fs::read_link("/proc/self/exe")
        .ok()
        .and_then(|path| path.to_str().map(str::to_string))
        .unwrap_or_default()
}
