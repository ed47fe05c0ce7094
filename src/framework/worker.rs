//! 激活器与模块包线程池
//!
//! 用户的激活/停用代码不在生命周期锁内执行，而是交给一个由信号量限流的
//! tokio 任务池。结果经 oneshot 通道送回；中止是协作式的，只在激活器返回后
//! 检查中止标志，从不强行终止任务。

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, warn};

use super::events::{EventCallback, ListenerId};
use super::Framework;
use crate::bundle::BundleId;
use crate::utils::Result;

/// 模块包激活器
///
/// `start` 失败会触发回滚；`stop` 在停止与回滚时都会被尽力调用。
#[async_trait]
pub trait BundleActivator: Send + Sync {
    /// 启动模块包
    async fn start(&self, context: &BundleContext) -> Result<()>;

    /// 停止模块包
    async fn stop(&self, context: &BundleContext) -> Result<()>;
}

/// 激活器看到的模块包上下文
#[derive(Clone)]
pub struct BundleContext {
    bundle_id: BundleId,
    framework: Framework,
}

impl BundleContext {
    pub(crate) fn new(bundle_id: BundleId, framework: Framework) -> Self {
        Self {
            bundle_id,
            framework,
        }
    }

    /// 所属模块包
    pub fn bundle_id(&self) -> BundleId {
        self.bundle_id
    }

    /// 框架句柄
    pub fn framework(&self) -> &Framework {
        &self.framework
    }

    /// 添加归属于本模块包的生命周期监听器，模块包停止时自动移除
    pub async fn add_listener(&self, callback: EventCallback) -> ListenerId {
        self.framework
            .dispatcher()
            .add_listener(Some(self.bundle_id), callback)
            .await
    }
}

impl fmt::Debug for BundleContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BundleContext")
            .field("bundle_id", &self.bundle_id)
            .finish()
    }
}

/// 激活器阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivatorPhase {
    Start,
    Stop,
}

/// 激活器执行结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkOutcome {
    Completed,
    Failed(String),
    /// 激活器返回时中止标志已被设置，结果作废
    Aborted,
}

/// 模块包线程池
#[derive(Clone)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// 当前空闲的线程数
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// 在池中执行一次激活器调用并等待其返回
    ///
    /// `timeout` 到期时设置中止标志，但仍等待激活器自行返回。
    pub async fn run(
        &self,
        activator: Arc<dyn BundleActivator>,
        context: BundleContext,
        phase: ActivatorPhase,
        abort: Arc<AtomicBool>,
        timeout: Option<Duration>,
    ) -> WorkOutcome {
        let bundle_id = context.bundle_id();
        let permit = match self.semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return WorkOutcome::Failed("模块包线程池已关闭".to_string()),
        };

        let (tx, mut rx) = oneshot::channel();
        tokio::spawn(async move {
            let _permit = permit;
            let result = match phase {
                ActivatorPhase::Start => activator.start(&context).await,
                ActivatorPhase::Stop => activator.stop(&context).await,
            };
            let _ = tx.send(result);
        });

        let received = match timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut rx).await {
                Ok(received) => received,
                Err(_) => {
                    warn!(bundle_id = %bundle_id, phase = ?phase, timeout_ms = limit.as_millis() as u64, "激活器执行超时，已标记中止");
                    abort.store(true, Ordering::SeqCst);
                    rx.await
                }
            },
            None => rx.await,
        };

        let outcome = match received {
            Ok(Ok(())) if abort.load(Ordering::SeqCst) => WorkOutcome::Aborted,
            Ok(Ok(())) => WorkOutcome::Completed,
            Ok(Err(e)) => WorkOutcome::Failed(e.to_string()),
            // 发送端被丢弃：激活器 panic 或任务被取消
            Err(_) => WorkOutcome::Failed("激活器异常终止".to_string()),
        };
        debug!(bundle_id = %bundle_id, phase = ?phase, outcome = ?outcome, "激活器执行结束");
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RuntimeConfig;
    use crate::utils::CoreError;

    struct Sleepy(Duration);

    #[async_trait]
    impl BundleActivator for Sleepy {
        async fn start(&self, _context: &BundleContext) -> Result<()> {
            tokio::time::sleep(self.0).await;
            Ok(())
        }

        async fn stop(&self, _context: &BundleContext) -> Result<()> {
            Err(CoreError::Internal("stop failed".to_string()))
        }
    }

    struct Panicky;

    #[async_trait]
    impl BundleActivator for Panicky {
        async fn start(&self, _context: &BundleContext) -> Result<()> {
            panic!("activator panic");
        }

        async fn stop(&self, _context: &BundleContext) -> Result<()> {
            Ok(())
        }
    }

    fn context() -> BundleContext {
        let framework = Framework::new(RuntimeConfig::default()).unwrap();
        BundleContext::new(BundleId(1), framework)
    }

    #[tokio::test]
    async fn test_run_completes() {
        let pool = WorkerPool::new(2);
        let outcome = pool
            .run(
                Arc::new(Sleepy(Duration::from_millis(1))),
                context(),
                ActivatorPhase::Start,
                Arc::new(AtomicBool::new(false)),
                None,
            )
            .await;
        assert_eq!(outcome, WorkOutcome::Completed);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_run_reports_failure() {
        let pool = WorkerPool::new(1);
        let outcome = pool
            .run(
                Arc::new(Sleepy(Duration::from_millis(1))),
                context(),
                ActivatorPhase::Stop,
                Arc::new(AtomicBool::new(false)),
                None,
            )
            .await;
        assert!(matches!(outcome, WorkOutcome::Failed(reason) if reason.contains("stop failed")));
    }

    #[tokio::test]
    async fn test_panic_is_failure() {
        let pool = WorkerPool::new(1);
        let outcome = pool
            .run(
                Arc::new(Panicky),
                context(),
                ActivatorPhase::Start,
                Arc::new(AtomicBool::new(false)),
                None,
            )
            .await;
        assert!(matches!(outcome, WorkOutcome::Failed(_)));
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_timeout_marks_aborted() {
        let pool = WorkerPool::new(1);
        let abort = Arc::new(AtomicBool::new(false));
        let outcome = pool
            .run(
                Arc::new(Sleepy(Duration::from_millis(100))),
                context(),
                ActivatorPhase::Start,
                abort.clone(),
                Some(Duration::from_millis(10)),
            )
            .await;
        assert_eq!(outcome, WorkOutcome::Aborted);
        assert!(abort.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_abort_raised_during_run() {
        let pool = WorkerPool::new(1);
        let abort = Arc::new(AtomicBool::new(false));
        let flag = abort.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            flag.store(true, Ordering::SeqCst);
        });
        let outcome = pool
            .run(
                Arc::new(Sleepy(Duration::from_millis(50))),
                context(),
                ActivatorPhase::Start,
                abort,
                None,
            )
            .await;
        assert_eq!(outcome, WorkOutcome::Aborted);
    }
}
