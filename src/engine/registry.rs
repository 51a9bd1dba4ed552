// 镜像注册表：记录进程内所有已加载代码模块及其地址范围
// 读多写少：find_module 走读锁的范围检索，写入仅发生在刷新时
use crate::log;
use std::collections::BTreeMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use super::state::RwLockPoisonRecover;
use scan::{ScanOutcome, ScannedModule};

pub(crate) mod maps;
pub(crate) mod scan;

// 进程内的单个代码模块，失效后保留在历史中供诊断
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Module {
    pub pathname: String,
    pub base_addr: usize,
    pub end_addr: usize,
    // 首次观察到的加载顺序，0 为主可执行文件
    pub load_index: usize,
    pub unloaded: bool,
}

impl Module {
    pub fn size(&self) -> usize {
        self.end_addr.saturating_sub(self.base_addr)
    }

    pub fn contains(&self, addr: usize) -> bool {
        !self.unloaded && addr >= self.base_addr && addr < self.end_addr
    }

    // 模块实例键：pathname#base_addr
    pub(crate) fn key(&self) -> String {
        format!("{}#{:x}", self.pathname, self.base_addr)
    }
}

#[derive(Default)]
struct RegistryState {
    // 含已卸载模块的完整历史，load_index 即下标
    modules: Vec<Module>,
    // base_addr -> modules 下标，仅含在载模块，支撑范围检索
    by_base: BTreeMap<usize, usize>,
}

pub struct ImageRegistry {
    state: RwLock<RegistryState>,
    // 枚举数据源退化时置位；下游据此将分类视为可能不精确，而非失败
    capability_limited: AtomicBool,
}

impl ImageRegistry {
    pub(crate) fn new() -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            capability_limited: AtomicBool::new(false),
        }
    }

    // 重新枚举地址空间并合并进注册表
    pub(crate) fn refresh(&self) {
        self.apply_scan(scan::enumerate_modules());
    }

    // 合并一次扫描结果：新模块插入（拒绝范围重叠），消失的模块标记卸载
    pub(crate) fn apply_scan(&self, outcome: ScanOutcome) {
        if !outcome.complete {
            self.capability_limited.store(true, Ordering::Release);
        }

        let mut state = self.state.write_or_poison();
        let scanned_bases: BTreeMap<usize, &ScannedModule> = outcome
            .modules
            .iter()
            .map(|module| (module.base_addr, module))
            .collect();

        // 已注册但本次未观察到的模块视为卸载，保留历史条目
        let dead: Vec<usize> = state
            .by_base
            .iter()
            .filter(|(base, _)| !scanned_bases.contains_key(base))
            .map(|(base, _)| *base)
            .collect();
        for base in dead {
            if let Some(index) = state.by_base.remove(&base) {
                let module = &mut state.modules[index];
                module.unloaded = true;
                log::debug(format_args!(
                    "module unloaded path={} base=0x{:x}",
                    module.pathname, module.base_addr
                ));
            }
        }

        for module in &outcome.modules {
            if state.by_base.contains_key(&module.base_addr) {
                continue;
            }
            if overlaps_registered(&state, module) {
                log::warn(format_args!(
                    "drop overlapping module entry path={} range=0x{:x}-0x{:x}",
                    module.pathname, module.base_addr, module.end_addr
                ));
                continue;
            }
            let load_index = state.modules.len();
            state.modules.push(Module {
                pathname: module.pathname.clone(),
                base_addr: module.base_addr,
                end_addr: module.end_addr,
                load_index,
                unloaded: false,
            });
            state.by_base.insert(module.base_addr, load_index);
            log::debug(format_args!(
                "module registered path={} range=0x{:x}-0x{:x} index={}",
                module.pathname, module.base_addr, module.end_addr, load_index
            ));
        }
    }

    // 在载模块列表，按加载顺序
    pub fn list_modules(&self) -> Vec<Module> {
        let state = self.state.read_or_poison();
        state
            .modules
            .iter()
            .filter(|module| !module.unloaded)
            .cloned()
            .collect()
    }

    // 完整历史（含已卸载），诊断用
    pub fn history(&self) -> Vec<Module> {
        self.state.read_or_poison().modules.clone()
    }

    // 范围检索：找 base <= addr 的最近模块并校验 addr 落在其范围内
    pub fn find_module(&self, addr: usize) -> Option<Module> {
        let state = self.state.read_or_poison();
        let (_, index) = state.by_base.range(..=addr).next_back()?;
        let module = &state.modules[*index];
        if module.contains(addr) {
            Some(module.clone())
        } else {
            None
        }
    }

    pub fn is_capability_limited(&self) -> bool {
        self.capability_limited.load(Ordering::Acquire)
    }

    // 在载模块的实例键集合，供符号缓存清理
    pub(crate) fn alive_keys(&self) -> Vec<String> {
        self.list_modules()
            .iter()
            .map(|module| module.key())
            .collect()
    }
}

// 与任何在载模块范围相交即为重叠
fn overlaps_registered(state: &RegistryState, candidate: &ScannedModule) -> bool {
    // 前驱：base 更小的最近模块
    if let Some((_, index)) = state.by_base.range(..candidate.base_addr).next_back() {
        let module = &state.modules[*index];
        if !module.unloaded && module.end_addr > candidate.base_addr {
            return true;
        }
    }
    // 后继：base 更大的最近模块
    if let Some((succ_base, _)) = state.by_base.range(candidate.base_addr..).next() {
        if candidate.end_addr > *succ_base {
            return true;
        }
    }
    false
}
