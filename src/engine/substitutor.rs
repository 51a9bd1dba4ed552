// 钩子安装器，把间接槽位的内容替换为替换函数地址
// 槽位的新旧切换必须是单次对齐原子写，调用方要么走旧实现要么走新实现

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::engine::backend::Backend;
use crate::engine::registry::ImageRegistry;
use crate::engine::state::MutexPoisonRecover;
use crate::errno::Errno;
use crate::log;

// 可替换的目标位置，两种形态都归结为一个指针槽位
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HookTarget {
    // 普通函数的间接跳转槽（GOT 表项或等价物）
    Function { slot_addr: usize },
    // 对象方法分发表中的一个表项
    MethodSlot { slot_addr: usize },
}

impl HookTarget {
    pub fn slot_addr(&self) -> usize {
        match self {
            HookTarget::Function { slot_addr } => *slot_addr,
            HookTarget::MethodSlot { slot_addr } => *slot_addr,
        }
    }
}

// 安装成功后返回的句柄，stub 单调递增且进程内唯一
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HookHandle {
    pub stub: u64,
    pub target: HookTarget,
}

// 单个已安装钩子的记录
#[derive(Clone, Debug)]
pub(crate) struct HookRecord {
    pub(crate) stub: u64,
    pub(crate) target: HookTarget,
    pub(crate) original: usize,
    pub(crate) replacement: usize,
    pub(crate) group: Option<String>,
    pub(crate) installed_at_ms: u64,
}

pub(crate) struct Substitutor {
    backend: &'static dyn Backend,
    // 以槽位地址为键，持锁覆盖整个安装过程，杜绝同槽并发安装
    records: Mutex<BTreeMap<usize, HookRecord>>,
    next_stub: AtomicU64,
}

impl Substitutor {
    pub(crate) fn new(backend: &'static dyn Backend) -> Self {
        Substitutor {
            backend,
            records: Mutex::new(BTreeMap::new()),
            next_stub: AtomicU64::new(1),
        }
    }

    // 安装钩子并返回原始槽位内容
    // 失败的安装不留任何记录，槽位保持原值
    pub(crate) fn install(
        &self,
        registry: &ImageRegistry,
        group: Option<&str>,
        target: HookTarget,
        replacement: usize,
    ) -> Result<(HookHandle, usize), Errno> {
        let slot_addr = target.slot_addr();
        if slot_addr == 0
            || replacement == 0
            || slot_addr % std::mem::size_of::<usize>() != 0
        {
            return Err(Errno::InvalidTarget);
        }
        // 槽位必须落在某个已注册镜像内
        if registry.find_module(slot_addr).is_none() {
            return Err(Errno::InvalidTarget);
        }

        let mut records = self.records.lock_or_poison();
        if records.contains_key(&slot_addr) {
            return Err(Errno::AlreadyHooked);
        }

        let original = match self.backend.patch_slot(slot_addr, replacement) {
            Ok(value) => value,
            Err(err) => {
                log::warn(format_args!(
                    "hook install failed at {slot_addr:#x}: {:?}",
                    err
                ));
                return Err(Errno::InstallFailed);
            }
        };

        let stub = self.next_stub.fetch_add(1, Ordering::SeqCst);
        let handle = HookHandle { stub, target };
        records.insert(
            slot_addr,
            HookRecord {
                stub,
                target,
                original,
                replacement,
                group: group.map(str::to_string),
                installed_at_ms: SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|duration| duration.as_millis() as u64)
                    .unwrap_or(0),
            },
        );
        log::info(format_args!(
            "hook installed: stub {stub} slot {slot_addr:#x} original {original:#x}"
        ));
        Ok((handle, original))
    }

    pub(crate) fn is_hooked(&self, slot_addr: usize) -> bool {
        self.records.lock_or_poison().contains_key(&slot_addr)
    }

    pub(crate) fn records_snapshot(&self) -> Vec<HookRecord> {
        self.records.lock_or_poison().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::{HookTarget, Substitutor};
    use crate::engine::backend::ELF_BACKEND;
    use crate::engine::registry::ImageRegistry;
    use crate::errno::Errno;
    use std::sync::atomic::{AtomicUsize, Ordering};

    extern "C" fn real_op() -> usize {
        11
    }

    extern "C" fn replacement_op() -> usize {
        22
    }

    type Op = extern "C" fn() -> usize;

    // 静态槽位位于测试二进制的数据段，registry 能找到所属镜像
    static FN_SLOT: AtomicUsize = AtomicUsize::new(0);
    static VT_SLOT: AtomicUsize = AtomicUsize::new(0);

    fn call_through(slot: &AtomicUsize) -> usize {
        let func: Op = unsafe { std::mem::transmute(slot.load(Ordering::SeqCst)) };
        func()
    }

    #[test]
    fn install_redirects_function_slot() {
        FN_SLOT.store(real_op as usize, Ordering::SeqCst);
        let registry = ImageRegistry::new();
        registry.refresh();
        let sub = Substitutor::new(&ELF_BACKEND);

        let slot_addr = &FN_SLOT as *const AtomicUsize as usize;
        let target = HookTarget::Function { slot_addr };
        let (handle, original) = sub
            .install(&registry, Some("fs"), target, replacement_op as usize)
            .unwrap();

        assert_eq!(original, real_op as usize);
        assert_eq!(handle.target, target);
        assert!(handle.stub > 0);
        assert_eq!(call_through(&FN_SLOT), 22);
        assert!(sub.is_hooked(slot_addr));

        // 同一槽位重复安装被拒绝，已生效的钩子不受影响
        assert_eq!(
            sub.install(&registry, None, target, real_op as usize),
            Err(Errno::AlreadyHooked)
        );
        assert_eq!(call_through(&FN_SLOT), 22);
    }

    #[test]
    fn install_redirects_method_slot() {
        VT_SLOT.store(real_op as usize, Ordering::SeqCst);
        let registry = ImageRegistry::new();
        registry.refresh();
        let sub = Substitutor::new(&ELF_BACKEND);

        let slot_addr = &VT_SLOT as *const AtomicUsize as usize;
        let (_, original) = sub
            .install(
                &registry,
                None,
                HookTarget::MethodSlot { slot_addr },
                replacement_op as usize,
            )
            .unwrap();
        assert_eq!(original, real_op as usize);
        assert_eq!(call_through(&VT_SLOT), 22);
    }

    // 不同槽位的并发安装互不干扰；同一槽位恰好一个赢家，槽值无撕裂
    #[test]
    fn concurrent_installs_have_one_winner_per_slot() {
        static PAR_SLOTS: [AtomicUsize; 4] = [
            AtomicUsize::new(0),
            AtomicUsize::new(0),
            AtomicUsize::new(0),
            AtomicUsize::new(0),
        ];
        static CONTESTED_SLOT: AtomicUsize = AtomicUsize::new(0);

        for slot in &PAR_SLOTS {
            slot.store(real_op as usize, Ordering::SeqCst);
        }
        CONTESTED_SLOT.store(real_op as usize, Ordering::SeqCst);

        let registry = ImageRegistry::new();
        registry.refresh();
        let sub = Substitutor::new(&ELF_BACKEND);

        std::thread::scope(|scope| {
            for slot in &PAR_SLOTS {
                let sub = &sub;
                let registry = &registry;
                scope.spawn(move || {
                    let slot_addr = slot as *const AtomicUsize as usize;
                    sub.install(
                        registry,
                        None,
                        HookTarget::Function { slot_addr },
                        replacement_op as usize,
                    )
                    .unwrap();
                });
            }

            let contested_addr = &CONTESTED_SLOT as *const AtomicUsize as usize;
            let racers: Vec<_> = (0..2)
                .map(|_| {
                    let sub = &sub;
                    let registry = &registry;
                    scope.spawn(move || {
                        sub.install(
                            registry,
                            None,
                            HookTarget::Function {
                                slot_addr: contested_addr,
                            },
                            replacement_op as usize,
                        )
                    })
                })
                .collect();
            let results: Vec<_> = racers
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .collect();
            assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
            assert_eq!(
                results
                    .iter()
                    .filter(|result| **result == Err(Errno::AlreadyHooked))
                    .count(),
                1
            );
        });

        // 每个槽位要么旧值要么新值，这里全部已切换且可调用
        for slot in &PAR_SLOTS {
            assert_eq!(slot.load(Ordering::SeqCst), replacement_op as usize);
            assert_eq!(call_through(slot), 22);
        }
        assert_eq!(
            CONTESTED_SLOT.load(Ordering::SeqCst),
            replacement_op as usize
        );
        assert_eq!(call_through(&CONTESTED_SLOT), 22);
        assert_eq!(sub.records_snapshot().len(), PAR_SLOTS.len() + 1);
    }

    #[test]
    fn invalid_targets_are_rejected_without_records() {
        let registry = ImageRegistry::new();
        registry.refresh();
        let sub = Substitutor::new(&ELF_BACKEND);

        assert_eq!(
            sub.install(
                &registry,
                None,
                HookTarget::Function { slot_addr: 0 },
                replacement_op as usize
            ),
            Err(Errno::InvalidTarget)
        );
        let slot_addr = &FN_SLOT as *const AtomicUsize as usize;
        assert_eq!(
            sub.install(&registry, None, HookTarget::Function { slot_addr }, 0),
            Err(Errno::InvalidTarget)
        );
        assert_eq!(
            sub.install(
                &registry,
                None,
                HookTarget::Function {
                    slot_addr: slot_addr + 1
                },
                replacement_op as usize
            ),
            Err(Errno::InvalidTarget)
        );
        assert!(sub.records_snapshot().is_empty());
    }
}
