// 锁 poison 恢复扩展与引擎全局锚点
use once_cell::sync::OnceCell;
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::Engine;

// bootstrap 成功后写入，仅供监控线程与无法携带上下文的调用点回查
// 组件间传递一律使用显式引用，不依赖此锚点
pub(crate) static ENGINE: OnceCell<&'static Engine> = OnceCell::new();

// Mutex/RwLock poison 恢复扩展，避免持锁线程 panic 后引发连锁 panic
pub(crate) trait MutexPoisonRecover<T> {
    fn lock_or_poison(&self) -> MutexGuard<'_, T>;
}

pub(crate) trait RwLockPoisonRecover<T> {
    fn read_or_poison(&self) -> RwLockReadGuard<'_, T>;
    fn write_or_poison(&self) -> RwLockWriteGuard<'_, T>;
}

impl<T> MutexPoisonRecover<T> for Mutex<T> {
    fn lock_or_poison(&self) -> MutexGuard<'_, T> {
        self.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<T> RwLockPoisonRecover<T> for RwLock<T> {
    fn read_or_poison(&self) -> RwLockReadGuard<'_, T> {
        self.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_or_poison(&self) -> RwLockWriteGuard<'_, T> {
        self.write().unwrap_or_else(|e| e.into_inner())
    }
}
