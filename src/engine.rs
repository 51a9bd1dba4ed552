// 引擎装配层，持有全部子系统并暴露操作入口
// 除监控线程回查锚点外，所有调用都走显式 &Engine 引用

use std::sync::Mutex;

use crate::config::EngineConfig;
use crate::errno::Errno;
use crate::log;
use crate::version;

mod backend;
pub(crate) mod classify;
pub(crate) mod groups;
mod memory;
mod monitor;
mod record;
pub(crate) mod registry;
pub(crate) mod settings;
mod state;
pub(crate) mod substitutor;
pub(crate) mod symbols;

use backend::ELF_BACKEND;
use classify::{CallerClass, CallerClassifier};
use groups::{GroupInstallFn, HookGroupRegistry, InstallReport};
use monitor::LoadMonitor;
use record::RecordState;
use registry::{ImageRegistry, Module};
use settings::{SettingsEngine, SettingsMap};
use state::MutexPoisonRecover;
use substitutor::{HookHandle, HookTarget, Substitutor};
use symbols::SymbolResolver;

pub struct Engine {
    registry: ImageRegistry,
    resolver: SymbolResolver,
    installer: Substitutor,
    classifier: CallerClassifier,
    settings: SettingsEngine,
    groups: HookGroupRegistry,
    records: Mutex<RecordState>,
    monitor: Mutex<Option<LoadMonitor>>,
}

impl Engine {
    fn build(config: EngineConfig) -> Result<Engine, Errno> {
        if config.suite.is_empty() {
            return Err(Errno::InitErrInvalidArg);
        }
        Ok(Engine {
            registry: ImageRegistry::new(),
            resolver: SymbolResolver::new(&ELF_BACKEND),
            installer: Substitutor::new(&ELF_BACKEND),
            classifier: CallerClassifier::new(config.return_addr_mask, &config.trusted_patterns),
            settings: SettingsEngine::new(
                &config.suite,
                config.store_path.as_deref(),
                config.defaults,
            ),
            groups: HookGroupRegistry::new(),
            records: Mutex::new(RecordState::new()),
            monitor: Mutex::new(None),
        })
    }

    // 进程内只允许初始化一次，重复调用返回 Dup
    pub fn bootstrap(mut config: EngineConfig) -> Result<&'static Engine, Errno> {
        config.apply_env_overrides();
        log::set_debug_enabled(config.debug);
        let auto_monitor = config.auto_monitor;

        let engine: &'static Engine = Box::leak(Box::new(Engine::build(config)?));
        engine.refresh();
        if engine.registry.is_capability_limited() {
            log::warn(format_args!(
                "module scan incomplete, registry degraded status {:?}",
                Errno::CapabilityLimited
            ));
        }

        if state::ENGINE.set(engine).is_err() {
            return Err(Errno::Dup);
        }

        if auto_monitor {
            let monitor = LoadMonitor::start(move || engine.refresh())?;
            *engine.monitor.lock_or_poison() = Some(monitor);
        }

        log::info(format_args!("{} initialized", version::version_str_full()));
        Ok(engine)
    }

    // 回查锚点，仅供无法携带上下文的调用点使用
    pub fn get() -> Option<&'static Engine> {
        state::ENGINE.get().copied()
    }

    // 重新扫描镜像列表并清理卸载模块的符号缓存
    pub fn refresh(&self) {
        self.registry.refresh();
        self.resolver.prune(&self.registry.alive_keys());
    }

    pub fn list_modules(&self) -> Vec<Module> {
        self.registry.list_modules()
    }

    pub fn find_module(&self, addr: usize) -> Option<Module> {
        self.registry.find_module(addr)
    }

    pub fn is_capability_limited(&self) -> bool {
        self.registry.is_capability_limited()
    }

    pub fn resolve(&self, module: &Module, name: &str) -> Result<usize, Errno> {
        self.resolver.resolve(module, name)
    }

    // 安装单个钩子，无论成败都落一条审计记录
    pub fn install(
        &self,
        group: Option<&str>,
        target: HookTarget,
        replacement: usize,
    ) -> Result<HookHandle, Errno> {
        self.install_with_original(group, target, replacement)
            .map(|(handle, _)| handle)
    }

    // 安装钩子并返回原始槽位内容，供替换函数透传调用
    pub fn install_with_original(
        &self,
        group: Option<&str>,
        target: HookTarget,
        replacement: usize,
    ) -> Result<(HookHandle, usize), Errno> {
        let original = self
            .installer
            .install(&self.registry, group, target, replacement);
        let (status, stub) = match &original {
            Ok((handle, _)) => (Errno::Ok, handle.stub),
            Err(err) => (*err, 0),
        };
        record::add_hook_record(
            &mut self.records.lock_or_poison(),
            status.as_i32(),
            group.unwrap_or(""),
            &format!("slot {:#x}", target.slot_addr()),
            target.slot_addr(),
            stub,
        );
        original
    }

    pub fn is_hooked(&self, slot_addr: usize) -> bool {
        self.installer.is_hooked(slot_addr)
    }

    pub fn classify(&self, return_addr: usize) -> CallerClass {
        self.classifier.classify(&self.registry, return_addr)
    }

    pub fn register_group(&self, name: &'static str, install: GroupInstallFn) -> Result<(), Errno> {
        self.groups.register(name, install)
    }

    // 按注册顺序安装全部钩子组，每组结果各落一条审计记录
    pub fn install_all(&self) -> InstallReport {
        let already_ran = self.groups.last_report().is_some();
        let report = self.groups.install_all(self);
        if !already_ran {
            let mut records = self.records.lock_or_poison();
            for result in &report.results {
                record::add_group_record(&mut records, result.status.as_i32(), result.name);
            }
        }
        report
    }

    pub fn effective_settings(&self, app_id: Option<&str>) -> SettingsMap {
        self.settings.effective_settings(app_id)
    }

    pub fn reload_settings(&self) {
        self.settings.reload();
    }

    pub fn set_recordable(&self, recordable: bool) {
        self.records.lock_or_poison().recordable = recordable;
    }

    pub fn get_records(&self, item_flags: u32) -> Option<String> {
        record::get_records_text(&self.records.lock_or_poison(), item_flags)
    }

    pub fn dump_records(&self, fd: i32, item_flags: u32) -> Result<(), Errno> {
        let Some(text) = self.get_records(item_flags) else {
            return Err(Errno::NotFound);
        };
        record::dump_records_text(fd, &text)
    }

    // 测试用：不挂全局锚点、不起监控线程的独立实例
    #[cfg(test)]
    pub(crate) fn new_detached(config: EngineConfig) -> Engine {
        let engine = Engine::build(config).unwrap();
        engine.refresh();
        engine
    }
}
