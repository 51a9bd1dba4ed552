// 持久化偏好存储，JSON 文件按 mtime 缓存
// 文件缺失或损坏都不是致命错误，引擎回退内置默认值

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, TryLockError};
use std::time::SystemTime;

use serde::Deserialize;

use crate::engine::settings::SettingsMap;
use crate::errno::Errno;
use crate::log;

// 文件的两层结构：全局层和按应用标识的覆盖层
#[derive(Clone, Debug, Default, Deserialize)]
pub(crate) struct StoreSnapshot {
    #[serde(default, rename = "Global")]
    pub(crate) global: SettingsMap,
    #[serde(default, rename = "Apps")]
    pub(crate) apps: BTreeMap<String, SettingsMap>,
}

struct StoreCache {
    snapshot: Option<StoreSnapshot>,
    mtime: Option<SystemTime>,
}

pub(crate) struct PreferenceStore {
    path: PathBuf,
    cache: RwLock<StoreCache>,
}

impl PreferenceStore {
    pub(crate) fn open(suite: &str, explicit: Option<&Path>) -> Self {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => suite_path(suite),
        };
        PreferenceStore {
            path,
            cache: RwLock::new(StoreCache {
                snapshot: None,
                mtime: None,
            }),
        }
    }

    // 读取当前快照，文件 mtime 未变时直接复用缓存
    // None 表示存储不可用（文件缺失或解析失败）
    pub(crate) fn snapshot(&self) -> Option<StoreSnapshot> {
        let mtime = fs::metadata(&self.path)
            .and_then(|meta| meta.modified())
            .ok();

        {
            let cache = match self.cache.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if mtime.is_some() && cache.mtime == mtime {
                return cache.snapshot.clone();
            }
        }

        // 热路径不阻塞：拿不到写锁就用别人刚刷新的结果
        let mut cache = match self.cache.try_write() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                let cache = match self.cache.read() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                return cache.snapshot.clone();
            }
        };

        cache.snapshot = read_file(&self.path).ok();
        cache.mtime = mtime;
        cache.snapshot.clone()
    }

    // 丢弃缓存，下次 snapshot 强制重读文件
    pub(crate) fn reload(&self) {
        let mut cache = match self.cache.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        cache.snapshot = None;
        cache.mtime = None;
    }
}

fn read_file(path: &Path) -> Result<StoreSnapshot, Errno> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) => {
            log::debug(format_args!(
                "preference store unreadable {}: {err} status {:?}",
                path.display(),
                Errno::StorageUnavailable
            ));
            return Err(Errno::StorageUnavailable);
        }
    };
    match serde_json::from_slice::<StoreSnapshot>(&bytes) {
        Ok(snapshot) => Ok(snapshot),
        Err(err) => {
            log::warn(format_args!(
                "preference store corrupt {}: {err} status {:?}",
                path.display(),
                Errno::StorageUnavailable
            ));
            Err(Errno::StorageUnavailable)
        }
    }
}

// 默认存储位置，android 下用全局可写目录
fn suite_path(suite: &str) -> PathBuf {
    #[cfg(target_os = "android")]
    {
        PathBuf::from(format!("/data/local/tmp/{suite}.json"))
    }
    #[cfg(not(target_os = "android"))]
    {
        let home = std::env::var_os("HOME").unwrap_or_else(|| "/tmp".into());
        let mut path = PathBuf::from(home);
        path.push(".config");
        path.push(format!("{suite}.json"));
        path
    }
}
