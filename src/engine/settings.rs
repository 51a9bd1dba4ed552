// 三层设置引擎：内置默认 < 全局层 < 应用覆盖层
// 输出永远是全量映射，调用方查任意已知键都有值

use std::collections::BTreeMap;
use std::path::Path;

use serde_json::Value;

pub(crate) mod store;

use store::PreferenceStore;

// 全局开关，关掉后所有布尔功能项强制为 false
pub const KILL_SWITCH_KEY: &str = "Global_Enabled";

pub type SettingsMap = BTreeMap<String, Value>;

pub(crate) struct SettingsEngine {
    defaults: SettingsMap,
    store: PreferenceStore,
}

impl SettingsEngine {
    pub(crate) fn new(suite: &str, store_path: Option<&Path>, defaults: SettingsMap) -> Self {
        SettingsEngine {
            defaults,
            store: PreferenceStore::open(suite, store_path),
        }
    }

    pub(crate) fn reload(&self) {
        self.store.reload();
    }

    // 计算某个应用标识的生效设置
    // 存储不可用时只剩内置默认值，键集不缩水
    pub(crate) fn effective_settings(&self, app_id: Option<&str>) -> SettingsMap {
        let mut effective = self.defaults.clone();

        let Some(snapshot) = self.store.snapshot() else {
            return effective;
        };

        // 总开关关闭时无视应用层，所有布尔项归零
        if snapshot.global.get(KILL_SWITCH_KEY) == Some(&Value::Bool(false)) {
            for value in effective.values_mut() {
                if value.is_boolean() {
                    *value = Value::Bool(false);
                }
            }
            effective.insert(KILL_SWITCH_KEY.to_string(), Value::Bool(false));
            return effective;
        }

        for (key, value) in &snapshot.global {
            effective.insert(key.clone(), value.clone());
        }
        if let Some(app_id) = app_id
            && let Some(overrides) = snapshot.apps.get(app_id)
        {
            for (key, value) in overrides {
                effective.insert(key.clone(), value.clone());
            }
        }
        effective
    }
}
