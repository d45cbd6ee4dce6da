//! 可取消、可观察的异步任务
//!
//! 每个耗时的传输操作都返回一个 `ProgressTask`：
//! - 状态机：Pending → Running → {Succeeded, Failed, Cancelled}
//! - 进度是 [0,1] 内单调不减的比例
//! - 进入终态后不再发出任何进度或完成事件
//! - 取消时丢弃内部 future，关闭底层连接和文件句柄

use crate::error::{DriveError, DriveResult};
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// 任务状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// 等待中
    Pending,
    /// 执行中
    Running,
    /// 已成功
    Succeeded,
    /// 失败（错误信息）
    Failed(String),
    /// 已取消
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed(_) | TaskState::Cancelled
        )
    }
}

/// 任务快照（状态 + 进度）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSnapshot {
    pub state: TaskState,
    pub progress: f64,
}

impl Default for TaskSnapshot {
    fn default() -> Self {
        Self {
            state: TaskState::Pending,
            progress: 0.0,
        }
    }
}

/// 进度上报器
///
/// 交给操作本身使用，所有写入都经过单调性和终态检查
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tx: watch::Sender<TaskSnapshot>,
    cancel: CancellationToken,
}

impl ProgressReporter {
    /// 上报进度
    ///
    /// 超出 [0,1] 的值会被截断；不大于当前值的进度被忽略；终态后为空操作
    pub fn report(&self, fraction: f64) {
        if fraction.is_nan() {
            return;
        }
        let fraction = fraction.clamp(0.0, 1.0);
        self.tx.send_if_modified(|snap| {
            if snap.state != TaskState::Running || fraction <= snap.progress {
                return false;
            }
            snap.progress = fraction;
            true
        });
    }

    /// 按字节数上报进度（total 为 0 时忽略）
    pub fn report_bytes(&self, done: u64, total: u64) {
        if total > 0 {
            self.report(done as f64 / total as f64);
        }
    }

    /// 当前进度
    pub fn current(&self) -> f64 {
        self.tx.borrow().progress
    }

    /// 任务的取消令牌（用于派生子任务）
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn transition(&self, state: TaskState) {
        self.tx.send_if_modified(|snap| {
            if snap.state.is_terminal() {
                return false;
            }
            if state == TaskState::Succeeded {
                snap.progress = 1.0;
            }
            snap.state = state;
            true
        });
    }
}

/// 可观察的异步任务
///
/// 实现了 `Future`，可以直接 `.await` 获取结果
pub struct ProgressTask<T> {
    id: String,
    rx: watch::Receiver<TaskSnapshot>,
    cancel: CancellationToken,
    handle: JoinHandle<DriveResult<T>>,
}

impl<T: Send + 'static> ProgressTask<T> {
    /// 在当前 tokio 运行时上启动任务
    pub fn spawn<F, Fut>(op: F) -> Self
    where
        F: FnOnce(ProgressReporter) -> Fut,
        Fut: Future<Output = DriveResult<T>> + Send + 'static,
    {
        Self::spawn_with_token(CancellationToken::new(), op)
    }

    /// 作为父任务的子任务启动（父任务取消时一并取消）
    pub fn spawn_child<F, Fut>(parent: &CancellationToken, op: F) -> Self
    where
        F: FnOnce(ProgressReporter) -> Fut,
        Fut: Future<Output = DriveResult<T>> + Send + 'static,
    {
        Self::spawn_with_token(parent.child_token(), op)
    }

    fn spawn_with_token<F, Fut>(cancel: CancellationToken, op: F) -> Self
    where
        F: FnOnce(ProgressReporter) -> Fut,
        Fut: Future<Output = DriveResult<T>> + Send + 'static,
    {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = watch::channel(TaskSnapshot::default());
        let reporter = ProgressReporter {
            tx,
            cancel: cancel.clone(),
        };
        let fut = op(reporter.clone());
        let task_id = id.clone();

        let handle = tokio::spawn(async move {
            reporter.transition(TaskState::Running);
            let token = reporter.cancel.clone();
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!("任务已取消: {}", task_id);
                    reporter.transition(TaskState::Cancelled);
                    Err(DriveError::Cancelled)
                }
                result = fut => {
                    match &result {
                        Ok(_) => reporter.transition(TaskState::Succeeded),
                        Err(DriveError::Cancelled) => reporter.transition(TaskState::Cancelled),
                        Err(e) => reporter.transition(TaskState::Failed(e.to_string())),
                    }
                    result
                }
            }
        });

        Self {
            id,
            rx,
            cancel,
            handle,
        }
    }
}

impl<T> ProgressTask<T> {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        self.rx.borrow().clone()
    }

    pub fn state(&self) -> TaskState {
        self.rx.borrow().state.clone()
    }

    pub fn progress(&self) -> f64 {
        self.rx.borrow().progress
    }

    pub fn is_finished(&self) -> bool {
        self.rx.borrow().state.is_terminal()
    }

    /// 订阅状态变化
    pub fn subscribe(&self) -> watch::Receiver<TaskSnapshot> {
        self.rx.clone()
    }

    /// 取消任务
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// 注册进度观察者
    ///
    /// 每次进度前进时回调；任务取消后不再回调
    pub fn on_progress<F>(&self, mut callback: F) -> &Self
    where
        F: FnMut(f64) + Send + 'static,
    {
        let mut rx = self.rx.clone();
        tokio::spawn(async move {
            let mut last = -1.0;
            loop {
                let snap = rx.borrow_and_update().clone();
                if snap.state == TaskState::Cancelled {
                    break;
                }
                if snap.progress > last {
                    last = snap.progress;
                    callback(snap.progress);
                }
                if snap.state.is_terminal() {
                    break;
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
        });
        self
    }
}

impl<T> Future for ProgressTask<T> {
    type Output = DriveResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.handle).poll(cx).map(|joined| match joined {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(DriveError::Cancelled),
            Err(e) => {
                warn!("任务异常退出: {}", e);
                Err(DriveError::transport(format!("任务异常: {}", e)))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[tokio::test]
    async fn test_success_sets_full_progress() {
        let task = ProgressTask::spawn(|reporter| async move {
            reporter.report(0.5);
            Ok(42u32)
        });
        let rx = task.subscribe();
        assert_eq!(task.await.unwrap(), 42);
        let snap = rx.borrow().clone();
        assert_eq!(snap.state, TaskState::Succeeded);
        assert_eq!(snap.progress, 1.0);
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_and_clamped() {
        let (gate_tx, gate_rx) = tokio::sync::oneshot::channel::<()>();
        let task = ProgressTask::spawn(|reporter| async move {
            reporter.report(0.6);
            reporter.report(0.3);
            reporter.report(7.0);
            let after = reporter.current();
            let _ = gate_rx.await;
            Ok(after)
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(task.progress(), 1.0);
        assert_eq!(task.state(), TaskState::Running);
        gate_tx.send(()).unwrap();
        let after = task.await.unwrap();
        assert_eq!(after, 1.0);
    }

    #[tokio::test]
    async fn test_failure_state() {
        let task: ProgressTask<()> =
            ProgressTask::spawn(|_| async move { Err(DriveError::NotFound("abc".into())) });
        let rx = task.subscribe();
        let result = task.await;
        assert!(matches!(result, Err(DriveError::NotFound(_))));
        assert!(matches!(rx.borrow().state, TaskState::Failed(_)));
    }

    #[tokio::test]
    async fn test_cancel_stops_observers() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let task: ProgressTask<()> = ProgressTask::spawn(|reporter| async move {
            reporter.report(0.1);
            tokio::time::sleep(Duration::from_secs(30)).await;
            reporter.report(0.9);
            Ok(())
        });
        let seen_clone = seen.clone();
        task.on_progress(move |p| seen_clone.lock().unwrap().push(p));
        tokio::time::sleep(Duration::from_millis(20)).await;

        task.cancel();
        let rx = task.subscribe();
        let result = task.await;
        assert!(matches!(result, Err(DriveError::Cancelled)));
        assert_eq!(rx.borrow().state, TaskState::Cancelled);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let seen = seen.lock().unwrap();
        assert!(seen.iter().all(|p| *p < 0.9));
    }

    #[tokio::test]
    async fn test_child_cancelled_with_parent() {
        let parent = CancellationToken::new();
        let child: ProgressTask<()> = ProgressTask::spawn_child(&parent, |_| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        });
        parent.cancel();
        assert!(matches!(child.await, Err(DriveError::Cancelled)));
    }

    #[tokio::test]
    async fn test_no_progress_after_terminal() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let task = ProgressTask::spawn(|reporter| async move {
            let _ = tx.send(reporter.clone());
            reporter.report(0.2);
            Ok(())
        });
        let reporter = rx.await.unwrap();
        let watcher = task.subscribe();
        task.await.unwrap();
        reporter.report(0.5);
        let snap = watcher.borrow().clone();
        assert_eq!(snap.state, TaskState::Succeeded);
        assert_eq!(snap.progress, 1.0);
    }
}
