use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::errno::Errno;
use crate::version;

// 操作记录字段掩码
pub const RECORD_ITEM_ALL: u32 = 0xFF;
pub const RECORD_ITEM_TIMESTAMP: u32 = 1 << 0;
pub const RECORD_ITEM_GROUP: u32 = 1 << 1;
pub const RECORD_ITEM_OP: u32 = 1 << 2;
pub const RECORD_ITEM_DETAIL: u32 = 1 << 3;
pub const RECORD_ITEM_ADDR: u32 = 1 << 4;
pub const RECORD_ITEM_ERRNO: u32 = 1 << 5;
pub const RECORD_ITEM_STUB: u32 = 1 << 6;

pub fn get_version() -> String {
    version::version_str_full()
}

// 初始化引擎，进程生命周期内只允许一次
// 返回的引用在进程存活期间始终有效，由调用方传递给各 hook 组
pub fn bootstrap(config: EngineConfig) -> Result<&'static Engine, Errno> {
    Engine::bootstrap(config)
}

// 回查已初始化的引擎，供 C ABI 替换函数等无法携带上下文的调用点使用
pub fn engine() -> Option<&'static Engine> {
    Engine::get()
}

// 手动触发一次镜像重扫，未初始化时报 Uninit
pub fn refresh() -> Result<(), Errno> {
    let Some(engine) = Engine::get() else {
        return Err(Errno::Uninit);
    };
    engine.refresh();
    Ok(())
}
