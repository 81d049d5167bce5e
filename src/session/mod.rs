// 上传会话管理
//
// 每次 upload 调用对应一个会话：登记取消令牌、把后端的推送式
// 完成/进度信号桥接为调用方可等待的结果，并保证任何退出路径都
// 收敛到同一套清理逻辑。会话按调用方提供的对象键关联，内部另挂
// 一个不透明的会话 ID，确保清理只移除自己的登记。

use crate::backend::{
    ResponseInfo, UploadBackend, UploadOutcome, UploadProgressEvent, UploadRequest,
    STATUS_UNEXPECTED,
};
use crate::error::ClientError;
use crate::instance::InstanceManager;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 进度回调
pub type ProgressHandler = Arc<dyn Fn(UploadProgressEvent) + Send + Sync>;

/// 在途会话登记项
struct SessionEntry {
    /// 内部会话标识
    session_id: Uuid,
    /// 取消令牌
    token: CancellationToken,
}

/// 上传会话管理器
pub struct SessionManager {
    backend: Arc<dyn UploadBackend>,
    instances: Arc<InstanceManager>,
    /// 在途上传（对象键 → 会话登记）
    entries: DashMap<String, SessionEntry>,
}

impl SessionManager {
    pub fn new(backend: Arc<dyn UploadBackend>, instances: Arc<InstanceManager>) -> Self {
        Self {
            backend,
            instances,
            entries: DashMap::new(),
        }
    }

    /// 发起一次上传并等待终态
    ///
    /// 成功时返回服务端响应体；失败（含取消）以 `ClientError::Upload`
    /// 携带后端诊断信息。无论结果如何，取消令牌登记与进度订阅都在
    /// 结果落定之前清理完毕。
    pub async fn start_upload(
        &self,
        instance_id: &str,
        request: UploadRequest,
        on_progress: Option<ProgressHandler>,
    ) -> Result<serde_json::Value, ClientError> {
        if !self.instances.is_live(instance_id).await {
            return Err(ClientError::InstanceNotConfigured(instance_id.to_string()));
        }
        if request.key.is_empty() {
            return Err(ClientError::InvalidOptions("key 不能为空"));
        }
        if request.token.is_empty() {
            return Err(ClientError::InvalidOptions("token 不能为空"));
        }
        if request.file_path.as_os_str().is_empty() {
            return Err(ClientError::InvalidOptions("filePath 不能为空"));
        }

        let key = request.key.clone();
        let session_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        match self.entries.entry(key.clone()) {
            // 同 key 在途时快速失败，而不是静默顶掉对方的令牌
            Entry::Occupied(_) => return Err(ClientError::KeyAlreadyInFlight(key)),
            Entry::Vacant(vacant) => {
                vacant.insert(SessionEntry {
                    session_id,
                    token: cancel.clone(),
                });
            }
        }

        let stop = CancellationToken::new();
        let mut guard = SessionGuard {
            entries: &self.entries,
            key: key.clone(),
            session_id,
            stop: stop.clone(),
            forwarder: None,
            finished: false,
        };

        // 先订阅再派发，最早的进度事件也不会漏
        if let Some(handler) = on_progress {
            let rx = self.backend.subscribe_progress();
            guard.forwarder = Some(spawn_forwarder(key.clone(), rx, handler, stop));
        }

        let (completion_tx, completion_rx) = oneshot::channel();
        debug!("派发上传: instance_id={}, key={}", instance_id, key);
        self.backend
            .upload(instance_id, request, completion_tx, cancel.clone())
            .await;

        let outcome = match completion_rx.await {
            Ok(outcome) => outcome,
            // 后端丢弃了完成信号发送端；合成终态，保证恰好一次落定
            Err(_) => UploadOutcome::failed(ResponseInfo::failed(
                STATUS_UNEXPECTED,
                "后端未发送完成信号",
            )),
        };

        // 清理先于结果落定
        guard.finish().await;

        if outcome.info.is_ok() {
            info!("上传完成: key={}", key);
            Ok(outcome.response)
        } else {
            info!("上传失败: key={}, {}", key, outcome.info);
            Err(ClientError::Upload { info: outcome.info })
        }
    }

    /// 请求取消某个 key 的在途上传
    ///
    /// 取消是请求而非保证：这里只置位令牌并立即移除登记，后端
    /// 自行决定多快停下，最终仍会送达一次完成信号走正常清理。
    /// 未命中任何在途上传时静默忽略。
    pub fn cancel(&self, key: &str) {
        if let Some((_, entry)) = self.entries.remove(key) {
            entry.token.cancel();
            info!("已请求取消上传: key={}", key);
        } else {
            debug!("取消请求未命中在途上传: key={}", key);
        }
    }

    /// 在途会话数（诊断用）
    pub fn in_flight(&self) -> usize {
        self.entries.len()
    }
}

/// 启动进度转发任务
///
/// 从共享事件流里只转发 key 匹配的事件，顺序与后端发出的一致。
/// select 偏向事件分支：停止信号到来时先把已经到达的事件消费完
/// 再退出。
fn spawn_forwarder(
    key: String,
    mut rx: broadcast::Receiver<UploadProgressEvent>,
    handler: ProgressHandler,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                event = rx.recv() => match event {
                    Ok(event) if event.key == key => handler(event),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("进度事件消费滞后，跳过 {} 条: key={}", skipped, key);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = stop.cancelled() => break,
            }
        }
    })
}

/// 会话清理守卫
///
/// 正常路径走 `finish()`：移除令牌登记、停止并等待转发任务，
/// 保证已经到达的进度事件全部送达后结果才落定。`Drop` 作为兜底，
/// 覆盖调用方中途丢弃 future 的退出路径。两条路径都幂等。
struct SessionGuard<'a> {
    entries: &'a DashMap<String, SessionEntry>,
    key: String,
    session_id: Uuid,
    stop: CancellationToken,
    forwarder: Option<JoinHandle<()>>,
    finished: bool,
}

impl SessionGuard<'_> {
    fn cleanup_entry(&self) {
        // 只移除本会话自己的登记：key 可能已被后续会话重新占用
        self.entries
            .remove_if(&self.key, |_, entry| entry.session_id == self.session_id);
    }

    async fn finish(mut self) {
        self.cleanup_entry();
        self.stop.cancel();
        if let Some(handle) = self.forwarder.take() {
            if let Err(e) = handle.await {
                warn!("进度转发任务异常退出: key={}, {}", self.key, e);
            }
        }
        self.finished = true;
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.cleanup_entry();
        self.stop.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::MockBackend;
    use crate::backend::STATUS_CANCELLED;
    use crate::config::{ClientConfig, Zone};
    use std::path::PathBuf;
    use std::sync::Mutex;

    fn request(key: &str) -> UploadRequest {
        UploadRequest {
            key: key.to_string(),
            token: "ak:sign:policy".to_string(),
            file_path: PathBuf::from("/tmp/data.bin"),
        }
    }

    async fn setup() -> (Arc<MockBackend>, Arc<SessionManager>, String) {
        let backend = MockBackend::new();
        let instances = Arc::new(InstanceManager::new(backend.clone()));
        let sessions = Arc::new(SessionManager::new(backend.clone(), instances.clone()));
        let config = ClientConfig {
            zone: Some(Zone::Auto),
            ..Default::default()
        };
        let instance_id = instances.acquire(&config).await.unwrap();
        (backend, sessions, instance_id)
    }

    fn collector() -> (ProgressHandler, Arc<Mutex<Vec<UploadProgressEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let handler: ProgressHandler = Arc::new(move |event: UploadProgressEvent| {
            sink.lock().unwrap().push(event);
        });
        (handler, events)
    }

    #[tokio::test]
    async fn test_upload_success_resolves_with_response() {
        let (backend, sessions, instance_id) = setup().await;

        let task = {
            let sessions = sessions.clone();
            tokio::spawn(async move {
                sessions.start_upload(&instance_id, request("k1"), None).await
            })
        };
        backend.wait_pending("k1").await;
        assert_eq!(sessions.in_flight(), 1);

        let response = serde_json::json!({"key": "k1", "hash": "h"});
        assert!(backend.complete("k1", UploadOutcome::ok(ResponseInfo::ok(), response.clone())));

        let result = task.await.unwrap().unwrap();
        assert_eq!(result, response);
        assert_eq!(sessions.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_upload_failure_carries_diagnostics() {
        let (backend, sessions, instance_id) = setup().await;

        let task = {
            let sessions = sessions.clone();
            tokio::spawn(async move {
                sessions.start_upload(&instance_id, request("k1"), None).await
            })
        };
        backend.wait_pending("k1").await;
        backend.complete(
            "k1",
            UploadOutcome::failed(ResponseInfo::failed(599, "服务端拒绝")),
        );

        let err = task.await.unwrap().unwrap_err();
        match err {
            ClientError::Upload { info } => {
                assert_eq!(info.status_code, 599);
                assert_eq!(info.error.as_deref(), Some("服务端拒绝"));
            }
            other => panic!("意外的错误类型: {:?}", other),
        }
        assert_eq!(sessions.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_upload_validates_options() {
        let (_backend, sessions, instance_id) = setup().await;

        assert!(matches!(
            sessions.start_upload(&instance_id, request(""), None).await,
            Err(ClientError::InvalidOptions(_))
        ));

        let mut empty_token = request("k");
        empty_token.token = String::new();
        assert!(matches!(
            sessions.start_upload(&instance_id, empty_token, None).await,
            Err(ClientError::InvalidOptions(_))
        ));

        let mut empty_path = request("k");
        empty_path.file_path = PathBuf::new();
        assert!(matches!(
            sessions.start_upload(&instance_id, empty_path, None).await,
            Err(ClientError::InvalidOptions(_))
        ));

        assert_eq!(sessions.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_upload_requires_live_instance() {
        let (_backend, sessions, _instance_id) = setup().await;
        let err = sessions.start_upload("ghost", request("k"), None).await;
        assert!(matches!(err, Err(ClientError::InstanceNotConfigured(_))));
    }

    #[tokio::test]
    async fn test_progress_routed_by_key() {
        let (backend, sessions, instance_id) = setup().await;
        let (handler1, events1) = collector();
        let (handler2, events2) = collector();

        let task1 = {
            let sessions = sessions.clone();
            let instance_id = instance_id.clone();
            tokio::spawn(async move {
                sessions
                    .start_upload(&instance_id, request("k1"), Some(handler1))
                    .await
            })
        };
        let task2 = {
            let sessions = sessions.clone();
            let instance_id = instance_id.clone();
            tokio::spawn(async move {
                sessions
                    .start_upload(&instance_id, request("k2"), Some(handler2))
                    .await
            })
        };
        backend.wait_pending("k1").await;
        backend.wait_pending("k2").await;

        backend.emit("k1", 0.3);
        backend.emit("k2", 0.5);
        backend.emit("k1", 0.9);

        backend.complete(
            "k1",
            UploadOutcome::ok(ResponseInfo::ok(), serde_json::json!({})),
        );
        backend.complete(
            "k2",
            UploadOutcome::ok(ResponseInfo::ok(), serde_json::json!({})),
        );
        task1.await.unwrap().unwrap();
        task2.await.unwrap().unwrap();

        let seen1: Vec<f64> = events1.lock().unwrap().iter().map(|e| e.percent).collect();
        let seen2: Vec<f64> = events2.lock().unwrap().iter().map(|e| e.percent).collect();
        assert_eq!(seen1, vec![0.3, 0.9]);
        assert_eq!(seen2, vec![0.5]);
        assert!(events1.lock().unwrap().iter().all(|e| e.key == "k1"));
        assert!(events2.lock().unwrap().iter().all(|e| e.key == "k2"));
    }

    #[tokio::test]
    async fn test_cancel_marks_token_and_cleans_entry() {
        let (backend, sessions, instance_id) = setup().await;

        let task = {
            let sessions = sessions.clone();
            tokio::spawn(async move {
                sessions.start_upload(&instance_id, request("k1"), None).await
            })
        };
        backend.wait_pending("k1").await;

        sessions.cancel("k1");
        assert_eq!(sessions.in_flight(), 0);
        assert!(backend.is_cancel_requested("k1"));

        // 后端随后送达取消终态，会话照常收尾
        backend.complete("k1", UploadOutcome::failed(ResponseInfo::cancelled()));
        let err = task.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
        match err {
            ClientError::Upload { info } => assert_eq!(info.status_code, STATUS_CANCELLED),
            other => panic!("意外的错误类型: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_unknown_key_is_noop() {
        let (_backend, sessions, _instance_id) = setup().await;
        sessions.cancel("nonexistent-key");
        assert_eq!(sessions.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_key_fails_fast() {
        let (backend, sessions, instance_id) = setup().await;

        let task = {
            let sessions = sessions.clone();
            let instance_id = instance_id.clone();
            tokio::spawn(async move {
                sessions.start_upload(&instance_id, request("k1"), None).await
            })
        };
        backend.wait_pending("k1").await;

        let err = sessions
            .start_upload(&instance_id, request("k1"), None)
            .await;
        assert!(matches!(err, Err(ClientError::KeyAlreadyInFlight(_))));
        // 快速失败不影响在途会话
        assert_eq!(sessions.in_flight(), 1);

        backend.complete(
            "k1",
            UploadOutcome::ok(ResponseInfo::ok(), serde_json::json!({})),
        );
        task.await.unwrap().unwrap();
        assert_eq!(sessions.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_dropped_completion_settles_exactly_once() {
        let (backend, sessions, instance_id) = setup().await;

        let task = {
            let sessions = sessions.clone();
            tokio::spawn(async move {
                sessions.start_upload(&instance_id, request("k1"), None).await
            })
        };
        backend.wait_pending("k1").await;
        backend.drop_pending("k1");

        let err = task.await.unwrap().unwrap_err();
        match err {
            ClientError::Upload { info } => {
                assert_eq!(info.status_code, STATUS_UNEXPECTED);
            }
            other => panic!("意外的错误类型: {:?}", other),
        }
        assert_eq!(sessions.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let (backend, sessions, instance_id) = setup().await;

        let task = {
            let sessions = sessions.clone();
            tokio::spawn(async move {
                sessions.start_upload(&instance_id, request("k1"), None).await
            })
        };
        backend.wait_pending("k1").await;
        backend.complete(
            "k1",
            UploadOutcome::ok(ResponseInfo::ok(), serde_json::json!({})),
        );
        task.await.unwrap().unwrap();

        // 会话已收尾，再取消同一个 key 是无害操作
        sessions.cancel("k1");
        sessions.cancel("k1");
        assert_eq!(sessions.in_flight(), 0);
    }
}
