// 调用者分类，按返回地址判定来源镜像的信任级别
// 纯查询，不改任何状态，可在钩子替换函数内高频调用

use regex::Regex;

use crate::engine::registry::ImageRegistry;
use crate::log;

// 钩子自身所在动态库的文件名，按路径后缀识别
const SELF_IMAGE_SUFFIX: &str = "libveil_core.so";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CallerClass {
    // 主可执行镜像、自身镜像或可信路径下的镜像
    Internal,
    // 已注册但不可信的镜像
    External,
    // 地址不落在任何已注册镜像内
    Unknown,
}

pub(crate) struct CallerClassifier {
    // 指针认证等签名位先剥离再查找
    return_addr_mask: usize,
    trusted: Vec<Regex>,
}

// aarch64 高位可能携带 PAC 签名，只保留低 48 位虚拟地址
#[cfg(target_arch = "aarch64")]
const DEFAULT_ADDR_MASK: usize = (1usize << 48) - 1;
#[cfg(not(target_arch = "aarch64"))]
const DEFAULT_ADDR_MASK: usize = usize::MAX;

impl CallerClassifier {
    pub(crate) fn new(mask_override: Option<usize>, patterns: &[String]) -> Self {
        let mut trusted = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            match Regex::new(pattern) {
                Ok(regex) => trusted.push(regex),
                Err(err) => {
                    // 坏模式丢弃，不让一条配置拖垮整个分类器
                    log::warn(format_args!("bad trusted pattern {pattern:?}: {err}"));
                }
            }
        }
        CallerClassifier {
            return_addr_mask: mask_override.unwrap_or(DEFAULT_ADDR_MASK),
            trusted,
        }
    }

    // 剥离地址高位的签名内容
    pub(crate) fn canonicalize(&self, addr: usize) -> usize {
        addr & self.return_addr_mask
    }

    pub(crate) fn classify(&self, registry: &ImageRegistry, return_addr: usize) -> CallerClass {
        let addr = self.canonicalize(return_addr);
        if addr == 0 {
            return CallerClass::Unknown;
        }
        let Some(module) = registry.find_module(addr) else {
            return CallerClass::Unknown;
        };
        // 主可执行镜像始终视为内部调用
        if module.load_index == 0 {
            return CallerClass::Internal;
        }
        if module.pathname.ends_with(SELF_IMAGE_SUFFIX) {
            return CallerClass::Internal;
        }
        if self
            .trusted
            .iter()
            .any(|regex| regex.is_match(&module.pathname))
        {
            return CallerClass::Internal;
        }
        CallerClass::External
    }
}

#[cfg(test)]
mod tests {
    use super::{CallerClass, CallerClassifier};
    use crate::config;
    use crate::engine::registry::ImageRegistry;
    use crate::engine::registry::scan::{ScanOutcome, ScannedModule};

    fn synthetic_registry() -> ImageRegistry {
        let registry = ImageRegistry::new();
        registry.apply_scan(ScanOutcome {
            modules: vec![
                ScannedModule {
                    pathname: "/opt/app/main".to_string(),
                    base_addr: 0x10_0000,
                    end_addr: 0x20_0000,
                },
                ScannedModule {
                    pathname: "/system/lib64/libc.so".to_string(),
                    base_addr: 0x30_0000,
                    end_addr: 0x40_0000,
                },
                ScannedModule {
                    pathname: "/data/app/libdetector.so".to_string(),
                    base_addr: 0x50_0000,
                    end_addr: 0x60_0000,
                },
                ScannedModule {
                    pathname: "/data/app/libveil_core.so".to_string(),
                    base_addr: 0x70_0000,
                    end_addr: 0x80_0000,
                },
            ],
            complete: true,
        });
        registry
    }

    fn classifier() -> CallerClassifier {
        CallerClassifier::new(None, &config::EngineConfig::default().trusted_patterns)
    }

    #[test]
    fn main_executable_is_internal() {
        let registry = synthetic_registry();
        assert_eq!(
            classifier().classify(&registry, 0x10_1000),
            CallerClass::Internal
        );
    }

    #[test]
    fn trusted_path_is_internal() {
        let registry = synthetic_registry();
        assert_eq!(
            classifier().classify(&registry, 0x30_1000),
            CallerClass::Internal
        );
    }

    #[test]
    fn own_image_is_internal() {
        let registry = synthetic_registry();
        assert_eq!(
            classifier().classify(&registry, 0x70_1000),
            CallerClass::Internal
        );
    }

    #[test]
    fn unregistered_region_is_unknown() {
        let registry = synthetic_registry();
        let classifier = classifier();
        assert_eq!(classifier.classify(&registry, 0), CallerClass::Unknown);
        assert_eq!(
            classifier.classify(&registry, 0x90_0000),
            CallerClass::Unknown
        );
    }

    #[test]
    fn untrusted_library_is_external() {
        let registry = synthetic_registry();
        assert_eq!(
            classifier().classify(&registry, 0x50_1000),
            CallerClass::External
        );
    }

    // 高位携带签名的地址剥离后仍可分类
    #[test]
    fn signed_address_is_canonicalized() {
        let registry = synthetic_registry();
        let classifier = CallerClassifier::new(Some((1usize << 48) - 1), &[]);
        let signed = 0x50_1000usize | (0xa5usize << 56);
        assert_eq!(classifier.canonicalize(signed), 0x50_1000);
        assert_eq!(
            classifier.classify(&registry, signed),
            CallerClass::External
        );
    }

    #[test]
    fn bad_patterns_are_dropped() {
        let classifier = CallerClassifier::new(None, &["[broken".to_string()]);
        let registry = synthetic_registry();
        assert_eq!(
            classifier.classify(&registry, 0x30_1000),
            CallerClass::External
        );
    }

    // 分类是只读操作，重复调用结果一致
    #[test]
    fn classification_is_pure() {
        let registry = synthetic_registry();
        let classifier = classifier();
        for _ in 0..3 {
            assert_eq!(
                classifier.classify(&registry, 0x50_1000),
                CallerClass::External
            );
        }
        assert_eq!(registry.list_modules().len(), 4);
    }
}
