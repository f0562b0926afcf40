//! Human app name → package-id resolution (spec §4.3).
//!
//! A static, process-wide name→package map, built on the same
//! substring-matching convention as app-priority lookups elsewhere in this
//! codebase, plus whatever extra entries the deployment's config layers in.

use crate::config::AppRegistryConfig;
use std::collections::HashMap;

const BUILTIN: &[(&str, &str)] = &[
    ("微信", "com.tencent.mm"),
    ("wechat", "com.tencent.mm"),
    ("qq", "com.tencent.mobileqq"),
    ("淘宝", "com.taobao.taobao"),
    ("taobao", "com.taobao.taobao"),
    ("支付宝", "com.eg.android.AlipayGphone"),
    ("alipay", "com.eg.android.AlipayGphone"),
    ("抖音", "com.ss.android.ugc.aweme"),
    ("douyin", "com.ss.android.ugc.aweme"),
    ("tiktok", "com.zhiliaoapp.musically"),
    ("美团", "com.sankuai.meituan"),
    ("meituan", "com.sankuai.meituan"),
    ("高德地图", "com.autonavi.minimap"),
    ("amap", "com.autonavi.minimap"),
    ("chrome", "com.android.chrome"),
    ("gmail", "com.google.android.gm"),
    ("maps", "com.google.android.apps.maps"),
    ("youtube", "com.google.android.youtube"),
    ("settings", "com.android.settings"),
    ("设置", "com.android.settings"),
    ("camera", "com.android.camera"),
    ("相机", "com.android.camera"),
    ("gallery", "com.android.gallery3d"),
    ("相册", "com.android.gallery3d"),
];

/// Immutable, loaded once at process start.
#[derive(Debug, Clone)]
pub struct AppRegistry {
    table: HashMap<String, String>,
}

impl AppRegistry {
    pub fn new(extra: &AppRegistryConfig) -> Self {
        let mut table = HashMap::with_capacity(BUILTIN.len() + extra.extra.len());
        for (name, pkg) in BUILTIN {
            table.insert(name.to_lowercase(), pkg.to_string());
        }
        for (name, pkg) in &extra.extra {
            table.insert(name.to_lowercase(), pkg.clone());
        }
        Self { table }
    }

    pub fn resolve(&self, name: &str) -> Option<String> {
        self.table.get(&name.trim().to_lowercase()).cloned()
    }

    pub fn list_supported(&self) -> Vec<String> {
        let mut names: Vec<String> = self.table.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_worked_example() {
        let registry = AppRegistry::new(&AppRegistryConfig::default());
        assert_eq!(registry.resolve("微信").as_deref(), Some("com.tencent.mm"));
    }

    #[test]
    fn resolve_is_case_insensitive() {
        let registry = AppRegistry::new(&AppRegistryConfig::default());
        assert_eq!(registry.resolve("WeChat").as_deref(), Some("com.tencent.mm"));
    }

    #[test]
    fn unknown_app_resolves_to_none() {
        let registry = AppRegistry::new(&AppRegistryConfig::default());
        assert_eq!(registry.resolve("not a real app"), None);
    }

    #[test]
    fn extra_config_entries_are_merged() {
        let mut extra = AppRegistryConfig::default();
        extra.extra.insert("myapp".into(), "com.example.myapp".into());
        let registry = AppRegistry::new(&extra);
        assert_eq!(registry.resolve("myapp").as_deref(), Some("com.example.myapp"));
    }
}
