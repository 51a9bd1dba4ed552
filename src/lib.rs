#![allow(dead_code)]
#![allow(unsafe_op_in_unsafe_fn)]
#![allow(clippy::missing_safety_doc)]

#[cfg(all(
    not(any(target_os = "linux", target_os = "android")),
    not(any(clippy, test, doc))
))]
compile_error!("veil_core supports Linux and Android only (use cargo clippy/test/doc on other hosts)");

#[cfg(not(any(target_arch = "aarch64", target_arch = "x86_64")))]
compile_error!("veil_core supports only 64-bit architectures: aarch64 and x86_64");

// 公共 API 层，提供引擎初始化与回查入口
mod api;
// 引擎配置与环境变量覆盖
mod config;
// 核心引擎：镜像注册表、符号解析、hook 安装、调用方分类、设置合并
mod engine;
// 错误码定义
mod errno;
// 日志输出，Android 使用 logcat，其余平台写 stderr
mod log;
// 版本信息
mod version;

pub use api::{
    RECORD_ITEM_ADDR, RECORD_ITEM_ALL, RECORD_ITEM_DETAIL, RECORD_ITEM_ERRNO, RECORD_ITEM_GROUP,
    RECORD_ITEM_OP, RECORD_ITEM_STUB, RECORD_ITEM_TIMESTAMP, bootstrap, engine, get_version,
    refresh,
};
pub use config::EngineConfig;
pub use engine::classify::CallerClass;
pub use engine::groups::{GroupResult, InstallReport};
pub use engine::registry::Module;
pub use engine::settings::{KILL_SWITCH_KEY, SettingsMap};
pub use engine::substitutor::{HookHandle, HookTarget};
pub use engine::Engine;
pub use errno::Errno;
