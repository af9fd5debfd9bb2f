use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::tunnel::Tunnel;

/// 活动隧道注册表，维护 connection id -> Tunnel 的映射
#[derive(Debug, Default)]
pub struct TunnelRegistry {
    tunnels: RwLock<HashMap<u64, Arc<Tunnel>>>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册隧道；id 已存在时保留原条目并返回 false
    pub fn add(&self, tunnel: Arc<Tunnel>) -> bool {
        let id = tunnel.id();
        let mut tunnels = self.tunnels.write();
        if tunnels.contains_key(&id) {
            warn!("Tunnel {} is already registered", id);
            return false;
        }
        tunnels.insert(id, tunnel);
        debug!("Tunnel {} registered ({} active)", id, tunnels.len());
        true
    }

    /// 移除隧道，不存在时为空操作
    pub fn remove(&self, id: u64) -> Option<Arc<Tunnel>> {
        let removed = self.tunnels.write().remove(&id);
        if removed.is_some() {
            debug!("Tunnel {} unregistered", id);
        }
        removed
    }

    pub fn get(&self, id: u64) -> Option<Arc<Tunnel>> {
        self.tunnels.read().get(&id).cloned()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.tunnels.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.tunnels.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.read().is_empty()
    }

    /// 当前隧道的描述快照（id -> 描述）
    ///
    /// 只在读锁内克隆引用，格式化在锁外进行，不影响转发。
    pub fn snapshot(&self) -> BTreeMap<u64, String> {
        let tunnels: Vec<Arc<Tunnel>> = self.tunnels.read().values().cloned().collect();
        tunnels
            .into_iter()
            .map(|tunnel| (tunnel.id(), tunnel.describe()))
            .collect()
    }

    /// 注册隧道并返回在 drop 时自动注销的守卫
    pub fn register(self: &Arc<Self>, tunnel: Arc<Tunnel>) -> Option<RegistryGuard> {
        let id = tunnel.id();
        self.add(tunnel).then(|| RegistryGuard {
            registry: Arc::clone(self),
            id,
        })
    }
}

/// RAII guard: drop 时从注册表移除隧道
#[derive(Debug)]
pub struct RegistryGuard {
    registry: Arc<TunnelRegistry>,
    id: u64,
}

impl RegistryGuard {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for RegistryGuard {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::TransferCounter;

    fn tunnel(id: u64) -> Arc<Tunnel> {
        let counter = Arc::new(TransferCounter::open(0, std::env::temp_dir()));
        Arc::new(Tunnel::new(
            id,
            "127.0.0.1:50000".parse().unwrap(),
            None,
            "example.com".to_string(),
            443,
            counter,
        ))
    }

    #[test]
    fn test_add_and_remove() {
        let registry = TunnelRegistry::new();
        assert!(registry.is_empty());

        assert!(registry.add(tunnel(1)));
        assert!(registry.add(tunnel(2)));
        assert_eq!(registry.len(), 2);
        assert!(registry.contains(1));

        assert!(registry.remove(1).is_some());
        assert!(!registry.contains(1));
        // 重复移除为空操作
        assert!(registry.remove(1).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_duplicate_id_rejected_and_reusable_after_removal() {
        let registry = TunnelRegistry::new();
        let first = tunnel(7);
        assert!(registry.add(first.clone()));
        assert!(!registry.add(tunnel(7)));
        assert!(Arc::ptr_eq(&registry.get(7).unwrap(), &first));

        registry.remove(7);
        assert!(registry.add(tunnel(7)));
    }

    #[test]
    fn test_snapshot_is_independent_copy() {
        let registry = TunnelRegistry::new();
        registry.add(tunnel(3));
        registry.add(tunnel(1));

        let snapshot = registry.snapshot();
        registry.remove(1);
        registry.remove(3);

        assert_eq!(snapshot.keys().copied().collect::<Vec<_>>(), vec![1, 3]);
        assert!(snapshot[&1].contains("example.com:443"));
        assert!(snapshot[&1].contains("127.0.0.1:50000"));
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn test_guard_removes_on_drop() {
        let registry = Arc::new(TunnelRegistry::new());
        {
            let guard = registry.register(tunnel(9)).unwrap();
            assert_eq!(guard.id(), 9);
            assert!(registry.contains(9));
            // 提前手动移除后，guard drop 不会出错
            registry.remove(9);
        }
        assert!(!registry.contains(9));

        let guard = registry.register(tunnel(10)).unwrap();
        assert!(registry.register(tunnel(10)).is_none());
        drop(guard);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_concurrent_add_remove() {
        let registry = Arc::new(TunnelRegistry::new());
        let handles: Vec<_> = (0..8u64)
            .map(|t| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for i in 0..100u64 {
                        let id = t * 1000 + i;
                        assert!(registry.add(tunnel(id)));
                        let _ = registry.snapshot();
                        assert!(registry.remove(id).is_some());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(registry.is_empty());
    }
}
