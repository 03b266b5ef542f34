//! 弹性层注册表：按依赖名（provider 或工具类别）懒创建 ResilienceGuard
//!
//! 启动时构建一次，以 `Arc` 传入协调器与运行时；同名依赖共享同一个池与熔断器。

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::config::{GuardSettings, ResilienceSection};
use crate::resilience::guard::{GuardSnapshot, ResilienceGuard};

pub struct ResilienceRegistry {
    defaults: GuardSettings,
    overrides: HashMap<String, GuardSettings>,
    guards: RwLock<HashMap<String, Arc<ResilienceGuard>>>,
}

impl ResilienceRegistry {
    pub fn new(defaults: GuardSettings) -> Self {
        Self {
            defaults,
            overrides: HashMap::new(),
            guards: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_config(section: &ResilienceSection) -> Self {
        Self {
            defaults: section.defaults.clone(),
            overrides: section.overrides.clone(),
            guards: RwLock::new(HashMap::new()),
        }
    }

    /// 为某个依赖名单独配置；需在该依赖首次使用前调用
    pub fn with_override(mut self, name: &str, settings: GuardSettings) -> Self {
        self.overrides.insert(name.to_string(), settings);
        self
    }

    /// 获取（或创建）依赖对应的 guard
    pub fn guard(&self, name: &str) -> Arc<ResilienceGuard> {
        if let Some(guard) = self
            .guards
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
        {
            return guard.clone();
        }

        let mut guards = self.guards.write().unwrap_or_else(|e| e.into_inner());
        guards
            .entry(name.to_string())
            .or_insert_with(|| {
                let settings = self.overrides.get(name).unwrap_or(&self.defaults);
                tracing::debug!(dependency = name, ?settings, "creating resilience guard");
                Arc::new(ResilienceGuard::from_settings(name, settings))
            })
            .clone()
    }

    /// 所有已创建 guard 的快照，按名称排序
    pub fn snapshots(&self) -> Vec<GuardSnapshot> {
        let guards = self.guards.read().unwrap_or_else(|e| e.into_inner());
        let mut snapshots: Vec<_> = guards.values().map(|g| g.snapshot()).collect();
        snapshots.sort_by(|a, b| a.pool.name.cmp(&b.pool.name));
        snapshots
    }

    /// 手动恢复所有熔断器
    pub fn reset_breakers(&self) {
        let guards = self.guards.read().unwrap_or_else(|e| e.into_inner());
        for guard in guards.values() {
            guard.breaker().reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_is_shared_per_name() {
        let registry = ResilienceRegistry::new(GuardSettings::default());
        let a = registry.guard("openai");
        let b = registry.guard("openai");
        let c = registry.guard("sandbox");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(registry.snapshots().len(), 2);
    }

    #[test]
    fn test_override_applies_to_named_dependency() {
        let registry = ResilienceRegistry::new(GuardSettings::default()).with_override(
            "sandbox",
            GuardSettings {
                max_connections: 1,
                ..GuardSettings::default()
            },
        );
        assert_eq!(registry.guard("sandbox").pool().config().max_connections, 1);
        assert_eq!(registry.guard("openai").pool().config().max_connections, 4);
    }
}
