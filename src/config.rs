// 引擎配置定义与环境变量覆盖
use serde_json::Value;
use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;

// 偏好文件路径覆盖
const ENV_PREFS_PATH: &str = "VEIL_CORE_PREFS";
// 返回地址元数据位掩码覆盖（十六进制），用于指针认证方案不一致的机型
const ENV_ADDR_MASK: &str = "VEIL_CORE_ADDR_MASK";
const ENV_DEBUG: &str = "VEIL_CORE_DEBUG";

// 调用方分类默认信任的系统库路径模式
pub(crate) const DEFAULT_TRUSTED_PATTERNS: &[&str] = &[
    "^/system/",
    "^/system_ext/",
    "^/apex/",
    "^/vendor/",
    "^/usr/lib",
    "^/lib",
    "/linker64?$",
];

#[derive(Clone, Debug)]
pub struct EngineConfig {
    // 偏好存储 suite 标识，决定默认偏好文件位置
    pub suite: String,
    // 显式偏好文件路径，优先于 suite 推导
    pub store_path: Option<PathBuf>,
    pub debug: bool,
    // 返回地址规范化掩码，None 使用架构默认值
    pub return_addr_mask: Option<usize>,
    // 可信系统库路径正则，命中即归类为 Internal
    pub trusted_patterns: Vec<String>,
    // Default 层：所有 feature 键的基线取值，保证合并结果总是完整
    pub defaults: BTreeMap<String, Value>,
    // 是否启动模块加载监控线程
    pub auto_monitor: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            suite: "veil".to_string(),
            store_path: None,
            debug: false,
            return_addr_mask: None,
            trusted_patterns: DEFAULT_TRUSTED_PATTERNS
                .iter()
                .map(|pattern| pattern.to_string())
                .collect(),
            defaults: default_settings(),
            auto_monitor: true,
        }
    }
}

impl EngineConfig {
    // 应用环境变量覆盖，bootstrap 时调用
    pub(crate) fn apply_env_overrides(&mut self) {
        if let Ok(path) = env::var(ENV_PREFS_PATH)
            && !path.is_empty()
        {
            self.store_path = Some(PathBuf::from(path));
        }
        if let Ok(mask) = env::var(ENV_ADDR_MASK)
            && let Some(mask) = parse_hex_mask(&mask)
        {
            self.return_addr_mask = Some(mask);
        }
        if let Ok(debug) = env::var(ENV_DEBUG)
            && let Some(debug) = parse_bool_value(&debug)
        {
            self.debug = debug;
        }
    }
}

// 内置 Default 层，无用户配置时的兜底取值
pub(crate) fn default_settings() -> BTreeMap<String, Value> {
    let mut defaults = BTreeMap::new();
    defaults.insert("Global_Enabled".to_string(), Value::Bool(true));
    defaults.insert("Hook_Filesystem".to_string(), Value::Bool(true));
    defaults.insert("Hook_DynamicLibraries".to_string(), Value::Bool(true));
    defaults.insert("Hook_EnvVars".to_string(), Value::Bool(true));
    defaults.insert("Hook_SymbolLookup".to_string(), Value::Bool(true));
    defaults.insert("Hook_ProcessInfo".to_string(), Value::Bool(false));
    defaults.insert("Hook_Network".to_string(), Value::Bool(false));
    defaults
}

fn parse_hex_mask(value: &str) -> Option<usize> {
    let trimmed = value.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if digits.is_empty() || !digits.bytes().all(|byte| byte.is_ascii_hexdigit()) {
        return None;
    }
    usize::from_str_radix(digits, 16).ok()
}

fn parse_bool_value(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
