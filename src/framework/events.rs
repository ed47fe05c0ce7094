//! 生命周期事件分发
//!
//! 状态机按迁移顺序产生事件，先在框架状态中排队，再由持锁的操作按顺序分发：
//! 同步监听器逐个调用，随后发布到广播通道。事件不会被重排或合并。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, trace, warn};

use crate::bundle::BundleId;

/// 广播通道容量
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// 生命周期事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BundleEventKind {
    Installed,
    Resolved,
    Starting,
    Started,
    Stopping,
    Stopped,
    Updated,
    Unresolved,
    Uninstalled,
}

/// 生命周期事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleEvent {
    pub kind: BundleEventKind,
    pub bundle: BundleId,
    pub location: String,
    pub symbolic_name: String,
    pub timestamp: DateTime<Utc>,
    /// 全局递增的序号，按产生顺序分配
    pub sequence: u64,
}

/// 监听器标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// 事件回调函数类型
pub type EventCallback = Arc<dyn Fn(&BundleEvent) + Send + Sync>;

#[derive(Clone)]
struct ListenerEntry {
    id: ListenerId,
    /// 注册监听器的模块包，停止时移除
    owner: Option<BundleId>,
    callback: EventCallback,
}

/// 事件分发器
#[derive(Clone)]
pub struct EventDispatcher {
    listeners: Arc<RwLock<Vec<ListenerEntry>>>,
    sender: broadcast::Sender<BundleEvent>,
    next_listener: Arc<AtomicU64>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            listeners: Arc::new(RwLock::new(Vec::new())),
            sender,
            next_listener: Arc::new(AtomicU64::new(1)),
        }
    }

    /// 添加监听器；`owner` 为 `Some` 时该监听器归属于模块包
    pub async fn add_listener(&self, owner: Option<BundleId>, callback: EventCallback) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().await.push(ListenerEntry { id, owner, callback });
        debug!(listener = id.0, owner = ?owner, "添加生命周期监听器");
        id
    }

    /// 移除监听器
    pub async fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().await;
        let before = listeners.len();
        listeners.retain(|entry| entry.id != id);
        before != listeners.len()
    }

    /// 移除某个模块包注册的全部监听器
    pub async fn remove_owned(&self, bundle: BundleId) -> usize {
        let mut listeners = self.listeners.write().await;
        let before = listeners.len();
        listeners.retain(|entry| entry.owner != Some(bundle));
        let removed = before - listeners.len();
        if removed > 0 {
            debug!(bundle_id = %bundle, removed, "移除模块包的监听器");
        }
        removed
    }

    pub async fn listener_count(&self) -> usize {
        self.listeners.read().await.len()
    }

    /// 订阅广播通道
    pub fn subscribe(&self) -> broadcast::Receiver<BundleEvent> {
        self.sender.subscribe()
    }

    /// 按顺序分发一组事件
    ///
    /// 单个监听器 panic 不影响其他监听器与后续事件。
    pub async fn dispatch(&self, events: Vec<BundleEvent>) {
        if events.is_empty() {
            return;
        }
        let listeners = self.listeners.read().await.clone();

        for event in events {
            trace!(bundle_id = %event.bundle, kind = ?event.kind, sequence = event.sequence, "分发生命周期事件");
            for entry in &listeners {
                let callback = entry.callback.clone();
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    callback(&event);
                }));
                if result.is_err() {
                    warn!(listener = entry.id.0, bundle_id = %event.bundle, "生命周期监听器 panic");
                }
            }
            // 没有订阅者时发送失败，忽略即可
            let _ = self.sender.send(event);
        }
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
