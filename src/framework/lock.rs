//! 生命周期锁
//!
//! 整个框架只有一把锁，串行化所有结构性修改。模块包上的进行中操作
//! （`pending`）表示某个状态变更独占该模块包；其他变更在锁的通知上有界等待，
//! 超时后以 [`CoreError::StateChangeInProgress`] 失败。

use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard, Notify};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace};

use super::registry::FrameworkState;
use crate::bundle::{BundleId, PendingOperation};
use crate::utils::{CoreError, Result};

/// 生命周期锁
pub struct LifecycleLock {
    state: Mutex<FrameworkState>,
    released: Notify,
}

impl LifecycleLock {
    pub fn new(state: FrameworkState) -> Self {
        Self {
            state: Mutex::new(state),
            released: Notify::new(),
        }
    }

    /// 获取锁，不占用任何模块包
    pub async fn lock(&self) -> MutexGuard<'_, FrameworkState> {
        self.state.lock().await
    }

    /// 获取锁并占用模块包
    ///
    /// 模块包已有进行中操作时在 `wait` 内等待其结束。`abort_in_flight` 为真时
    /// 会先设置进行中激活/停用的中止标志。
    pub async fn claim(
        &self,
        bundle: BundleId,
        operation: PendingOperation,
        wait: Duration,
        abort_in_flight: bool,
    ) -> Result<MutexGuard<'_, FrameworkState>> {
        let (guard, _) = self
            .claim_many(|_| Ok(vec![bundle]), operation, wait, abort_in_flight)
            .await?;
        Ok(guard)
    }

    /// 获取锁并一次占用一组模块包
    ///
    /// 每次重试都会重新计算这组模块包，返回实际占用的集合。
    pub async fn claim_many<F>(
        &self,
        select: F,
        operation: PendingOperation,
        wait: Duration,
        abort_in_flight: bool,
    ) -> Result<(MutexGuard<'_, FrameworkState>, Vec<BundleId>)>
    where
        F: Fn(&FrameworkState) -> Result<Vec<BundleId>>,
    {
        let deadline = Instant::now() + wait;

        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            // 先登记再检查，避免错过检查与等待之间的释放
            notified.as_mut().enable();

            let busy = {
                let mut guard = self.state.lock().await;
                let ids = select(&*guard)?;

                let mut busy = None;
                for id in &ids {
                    let bundle = guard.bundle(*id)?;
                    if bundle.pending != PendingOperation::None {
                        if abort_in_flight && bundle.pending.is_abortable() {
                            if let Some(flag) = &bundle.abort {
                                flag.store(true, Ordering::SeqCst);
                                debug!(bundle_id = %id, pending = ?bundle.pending, "已请求中止进行中的操作");
                            }
                        }
                        busy = Some((*id, bundle.pending));
                        break;
                    }
                }

                match busy {
                    None => {
                        for id in &ids {
                            guard.bundle_mut(*id)?.pending = operation;
                        }
                        trace!(bundles = ?ids, operation = ?operation, "占用模块包");
                        return Ok((guard, ids));
                    }
                    Some(busy) => busy,
                }
            };

            trace!(bundle_id = %busy.0, pending = ?busy.1, "等待进行中的操作结束");
            if timeout_at(deadline, notified).await.is_err() {
                return Err(CoreError::StateChangeInProgress {
                    bundle: busy.0,
                    operation: busy.1,
                });
            }
        }
    }

    /// 结束对模块包的占用并唤醒等待者
    pub fn release(&self, mut guard: MutexGuard<'_, FrameworkState>, bundles: &[BundleId]) {
        for id in bundles {
            if let Ok(bundle) = guard.bundle_mut(*id) {
                bundle.pending = PendingOperation::None;
                bundle.abort = None;
            }
        }
        drop(guard);
        self.released.notify_waiters();
    }
}
