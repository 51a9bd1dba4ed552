// 钩子组注册表，安装按注册顺序执行且单组失败不中断后续组
// install_all 只会真正执行一次，之后返回首次的报告

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::engine::Engine;
use crate::engine::state::MutexPoisonRecover;
use crate::errno::Errno;
use crate::log;

// 组安装函数，内部自行解析符号并安装本组全部钩子
pub(crate) type GroupInstallFn = fn(&Engine) -> Result<(), Errno>;

#[derive(Clone, Copy)]
struct HookGroup {
    name: &'static str,
    install: GroupInstallFn,
}

// 单个组的安装结果
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct GroupResult {
    pub name: &'static str,
    pub status: Errno,
}

// 一次 install_all 的完整报告，组结果按注册顺序排列
#[derive(Clone, Debug, Default)]
pub struct InstallReport {
    pub results: Vec<GroupResult>,
}

impl InstallReport {
    pub fn ok(&self) -> bool {
        self.results.iter().all(|result| result.status.is_ok())
    }

    pub fn failed(&self) -> Vec<GroupResult> {
        self.results
            .iter()
            .filter(|result| !result.status.is_ok())
            .copied()
            .collect()
    }
}

pub(crate) struct HookGroupRegistry {
    groups: Mutex<Vec<HookGroup>>,
    // install_all 开始执行即置位，注册窗口关闭
    sealed: AtomicBool,
    report: Mutex<Option<InstallReport>>,
}

impl HookGroupRegistry {
    pub(crate) fn new() -> Self {
        HookGroupRegistry {
            groups: Mutex::new(Vec::new()),
            sealed: AtomicBool::new(false),
            report: Mutex::new(None),
        }
    }

    pub(crate) fn register(&self, name: &'static str, install: GroupInstallFn) -> Result<(), Errno> {
        if self.sealed.load(Ordering::Acquire) {
            return Err(Errno::Sealed);
        }
        let mut groups = self.groups.lock_or_poison();
        if groups.iter().any(|group| group.name == name) {
            return Err(Errno::Dup);
        }
        groups.push(HookGroup { name, install });
        Ok(())
    }

    // 逐组安装，失败的组记录状态后继续下一组
    // 安装回调执行期间不持有任何注册表锁，组内再调 register/install_all 不会死锁
    pub(crate) fn install_all(&self, engine: &Engine) -> InstallReport {
        if self.sealed.swap(true, Ordering::SeqCst) {
            return self.report.lock_or_poison().clone().unwrap_or_default();
        }

        let groups: Vec<HookGroup> = self.groups.lock_or_poison().clone();
        let mut report = InstallReport::default();
        for group in &groups {
            let status = match (group.install)(engine) {
                Ok(()) => Errno::Ok,
                Err(err) => {
                    log::warn(format_args!("hook group {} failed: {:?}", group.name, err));
                    err
                }
            };
            report.results.push(GroupResult {
                name: group.name,
                status,
            });
        }
        log::info(format_args!(
            "hook groups installed: {} total, {} failed",
            report.results.len(),
            report.failed().len()
        ));
        *self.report.lock_or_poison() = Some(report.clone());
        report
    }

    pub(crate) fn last_report(&self) -> Option<InstallReport> {
        self.report.lock_or_poison().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::HookGroupRegistry;
    use crate::config::EngineConfig;
    use crate::engine::Engine;
    use crate::errno::Errno;

    fn group_ok(_engine: &Engine) -> Result<(), Errno> {
        Ok(())
    }

    fn group_missing_symbol(_engine: &Engine) -> Result<(), Errno> {
        Err(Errno::NotFound)
    }

    #[test]
    fn failed_group_does_not_stop_later_groups() {
        let engine = Engine::new_detached(EngineConfig::default());
        let registry = HookGroupRegistry::new();
        registry.register("filesystem", group_ok).unwrap();
        registry.register("dlopen", group_missing_symbol).unwrap();
        registry.register("env", group_ok).unwrap();

        let report = registry.install_all(&engine);
        assert_eq!(report.results.len(), 3);
        assert_eq!(report.results[0].name, "filesystem");
        assert!(report.results[0].status.is_ok());
        assert_eq!(report.results[1].status, Errno::NotFound);
        assert!(report.results[2].status.is_ok());
        assert!(!report.ok());
        assert_eq!(report.failed().len(), 1);
    }

    fn group_registers_late(engine: &Engine) -> Result<(), Errno> {
        // 安装进行中注册必须拿到 Sealed，而不是卡死在注册表锁上
        match engine.register_group("late", group_ok) {
            Err(Errno::Sealed) => Ok(()),
            _ => Err(Errno::InvalidArg),
        }
    }

    #[test]
    fn registration_during_install_gets_sealed() {
        let engine = Engine::new_detached(EngineConfig::default());
        engine.register_group("boot", group_registers_late).unwrap();
        let report = engine.install_all();
        assert_eq!(report.results.len(), 1);
        assert!(report.ok());
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let registry = HookGroupRegistry::new();
        registry.register("filesystem", group_ok).unwrap();
        assert_eq!(
            registry.register("filesystem", group_ok),
            Err(Errno::Dup)
        );
    }

    #[test]
    fn registration_is_sealed_after_install() {
        let engine = Engine::new_detached(EngineConfig::default());
        let registry = HookGroupRegistry::new();
        registry.register("filesystem", group_ok).unwrap();

        let first = registry.install_all(&engine);
        assert!(first.ok());
        assert_eq!(
            registry.register("late", group_ok),
            Err(Errno::Sealed)
        );

        // 二次调用不重复执行，返回首次报告
        let second = registry.install_all(&engine);
        assert_eq!(second.results.len(), first.results.len());
        assert_eq!(registry.last_report().unwrap().results.len(), 1);
    }
}
