//! # config 模块说明
//!
//! ## 角色定位（Why）
//! - 部署方通过环境变量对协议栈做运行期覆盖（日志级别、MDNS 绑定接口、
//!   IPv4 开关等）；统一在进程启动时收集一次，形成只读快照，避免运行中
//!   反复读取环境造成行为漂移；
//! - 点分路径方案使任意配置项都可以通过 `MATTER_<PATH>` 覆盖，新增配置
//!   无需扩展解析代码。
//!
//! ## 核心契约（What）
//! - 变量名转换规则：去掉 `MATTER_` 前缀、转小写、`_` 替换为 `.`，
//!   例如 `MATTER_MDNS_NETWORK_INTERFACE` → `mdns.network.interface`；
//! - 同一路径后写覆盖先写；快照构造后不可变。

use std::collections::BTreeMap;

use crate::environment::EnvironmentService;

/// 环境变量覆盖快照。
#[derive(Clone, Debug, Default)]
pub struct CoreVars {
    entries: BTreeMap<String, String>,
}

impl CoreVars {
    /// 从进程环境收集所有 `MATTER_*` 变量。
    pub fn from_env() -> Self {
        Self::from_entries(std::env::vars())
    }

    /// 从显式键值对构造（测试用）。带 `MATTER_` 前缀的键按转换规则归一，
    /// 其余键忽略。
    pub fn from_entries(entries: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut map = BTreeMap::new();
        for (key, value) in entries {
            if let Some(rest) = key.strip_prefix("MATTER_") {
                map.insert(rest.to_ascii_lowercase().replace('_', "."), value);
            }
        }
        Self { entries: map }
    }

    /// 读取点分路径的原始字符串值。
    pub fn get(&self, path: &str) -> Option<&str> {
        self.entries.get(path).map(String::as_str)
    }

    /// 读取布尔值；接受 `1/true/on/yes`（不区分大小写）为真。
    pub fn get_bool(&self, path: &str) -> Option<bool> {
        self.get(path).map(|raw| {
            matches!(
                raw.to_ascii_lowercase().as_str(),
                "1" | "true" | "on" | "yes"
            )
        })
    }

    /// 读取整数值；解析失败视为未设置。
    pub fn get_u64(&self, path: &str) -> Option<u64> {
        self.get(path).and_then(|raw| raw.parse().ok())
    }

    /// 日志级别（`MATTER_LOG_LEVEL`），供 `tracing-subscriber` 的
    /// EnvFilter 初始化使用。
    pub fn log_level(&self) -> Option<&str> {
        self.get("log.level")
    }

    /// 日志格式（`MATTER_LOG_FORMAT`）：`plain` 或 `json`。
    pub fn log_format(&self) -> Option<&str> {
        self.get("log.format")
    }

    /// MDNS 绑定的网络接口名（`MATTER_MDNS_NETWORK_INTERFACE`）。
    pub fn mdns_interface(&self) -> Option<&str> {
        self.get("mdns.network.interface")
    }

    /// 是否同时在 IPv4 上广告（`MATTER_MDNS_IPV4`），默认开。
    pub fn mdns_ipv4(&self) -> bool {
        self.get_bool("mdns.ipv4").unwrap_or(true)
    }
}

impl EnvironmentService for CoreVars {}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(entries: &[(&str, &str)]) -> CoreVars {
        CoreVars::from_entries(
            entries
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned())),
        )
    }

    #[test]
    fn dotted_path_translation() {
        let vars = vars(&[
            ("MATTER_LOG_LEVEL", "debug"),
            ("MATTER_MDNS_NETWORK_INTERFACE", "eth0"),
            ("PATH", "/usr/bin"),
        ]);
        assert_eq!(vars.log_level(), Some("debug"));
        assert_eq!(vars.mdns_interface(), Some("eth0"));
        assert_eq!(vars.get("path"), None, "non MATTER_ keys are ignored");
    }

    #[test]
    fn ipv4_defaults_on_and_parses_switch() {
        assert!(vars(&[]).mdns_ipv4());
        assert!(!vars(&[("MATTER_MDNS_IPV4", "0")]).mdns_ipv4());
        assert!(vars(&[("MATTER_MDNS_IPV4", "true")]).mdns_ipv4());
    }
}
