// 测试用后端桩
//
// 记录 configure/destroy 调用次数，把 upload 挂起在 pending 表里，
// 由测试代码驱动完成信号与进度事件。

use super::{
    BackendError, CompletionSender, UploadBackend, UploadOutcome, UploadProgressEvent,
    UploadRequest,
};
use crate::config::NativeConfig;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// 挂起的上传
pub(crate) struct PendingUpload {
    pub completion: CompletionSender,
    pub cancel: CancellationToken,
}

/// 可编程的后端桩
pub(crate) struct MockBackend {
    pub configure_calls: AtomicUsize,
    pub destroy_calls: AtomicUsize,
    /// 为 true 时拒绝 configure
    pub fail_configure: AtomicBool,
    /// configure 前的人为延迟，用于拉大并发窗口
    pub configure_delay: Option<Duration>,
    pub live: DashMap<String, NativeConfig>,
    pub pending: DashMap<String, PendingUpload>,
    progress_tx: broadcast::Sender<UploadProgressEvent>,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Self::build(None)
    }

    pub fn with_configure_delay(delay: Duration) -> Arc<Self> {
        Self::build(Some(delay))
    }

    fn build(configure_delay: Option<Duration>) -> Arc<Self> {
        let (progress_tx, _) = broadcast::channel(64);
        Arc::new(Self {
            configure_calls: AtomicUsize::new(0),
            destroy_calls: AtomicUsize::new(0),
            fail_configure: AtomicBool::new(false),
            configure_delay,
            live: DashMap::new(),
            pending: DashMap::new(),
            progress_tx,
        })
    }

    /// 向共享事件流推一条进度
    pub fn emit(&self, key: &str, percent: f64) {
        let _ = self.progress_tx.send(UploadProgressEvent {
            key: key.to_string(),
            percent,
        });
    }

    /// 给挂起的上传发终态，返回是否命中
    pub fn complete(&self, key: &str, outcome: UploadOutcome) -> bool {
        match self.pending.remove(key) {
            Some((_, pending)) => pending.completion.send(outcome).is_ok(),
            None => false,
        }
    }

    /// 丢弃挂起的上传的完成信号发送端（模拟后端异常退出）
    pub fn drop_pending(&self, key: &str) -> bool {
        self.pending.remove(key).is_some()
    }

    /// 挂起上传的取消令牌是否已被置位
    pub fn is_cancel_requested(&self, key: &str) -> bool {
        self.pending
            .get(key)
            .map(|pending| pending.cancel.is_cancelled())
            .unwrap_or(false)
    }

    /// 轮询等待某个上传抵达后端
    pub async fn wait_pending(&self, key: &str) {
        for _ in 0..200 {
            if self.pending.contains_key(key) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("等待上传抵达后端超时: {}", key);
    }
}

#[async_trait]
impl UploadBackend for MockBackend {
    async fn configure(&self, instance_id: &str, config: &NativeConfig) -> Result<(), BackendError> {
        if let Some(delay) = self.configure_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_configure.load(Ordering::SeqCst) {
            return Err(BackendError::Configure("桩后端拒绝配置".to_string()));
        }
        self.configure_calls.fetch_add(1, Ordering::SeqCst);
        self.live.insert(instance_id.to_string(), config.clone());
        Ok(())
    }

    async fn destroy(&self, instance_id: &str) {
        self.destroy_calls.fetch_add(1, Ordering::SeqCst);
        self.live.remove(instance_id);
    }

    async fn upload(
        &self,
        _instance_id: &str,
        request: UploadRequest,
        completion: CompletionSender,
        cancel: CancellationToken,
    ) {
        self.pending
            .insert(request.key.clone(), PendingUpload { completion, cancel });
    }

    fn subscribe_progress(&self) -> broadcast::Receiver<UploadProgressEvent> {
        self.progress_tx.subscribe()
    }
}
