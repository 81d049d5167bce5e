// 客户端外观
//
// UploadService 持有后端与两个管理器，是进程级共享状态的显式
// 生命周期载体；KodoClient 是对一个后端实例引用的轻量句柄，
// 等价配置的多个客户端共享同一个实例。

use crate::backend::{UploadBackend, UploadRequest};
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::instance::InstanceManager;
use crate::session::{ProgressHandler, SessionManager};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// 单次上传选项
pub struct UploadOptions {
    /// 本地文件路径（不要带 file:// 前缀，URI 需先行解码）
    pub file_path: PathBuf,
    /// 对象键
    pub key: String,
    /// 上传凭证
    pub token: String,
    /// 进度回调（可选）
    pub on_progress: Option<ProgressHandler>,
}

impl UploadOptions {
    pub fn new(
        file_path: impl Into<PathBuf>,
        key: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            file_path: file_path.into(),
            key: key.into(),
            token: token.into(),
            on_progress: None,
        }
    }

    pub fn with_progress(mut self, handler: ProgressHandler) -> Self {
        self.on_progress = Some(handler);
        self
    }
}

/// 上传服务
pub struct UploadService {
    instances: Arc<InstanceManager>,
    sessions: Arc<SessionManager>,
}

impl UploadService {
    pub fn new(backend: Arc<dyn UploadBackend>) -> Arc<Self> {
        let instances = Arc::new(InstanceManager::new(backend.clone()));
        let sessions = Arc::new(SessionManager::new(backend, instances.clone()));
        Arc::new(Self {
            instances,
            sessions,
        })
    }

    /// 用逻辑配置创建一个客户端
    ///
    /// 等价配置（规范化后结构相等）共享同一个后端实例；配置错误
    /// 与后端 configure 失败都在这里同步返回。
    pub async fn create_client(self: &Arc<Self>, config: ClientConfig) -> Result<KodoClient, ClientError> {
        let instance_id = self.instances.acquire(&config).await?;
        debug!("客户端已创建: instance_id={}", instance_id);
        Ok(KodoClient {
            service: self.clone(),
            instance_id,
            destroyed: AtomicBool::new(false),
        })
    }

    /// 按 key 取消在途上传
    ///
    /// 取消按对象键寻址，与任何客户端实例无关；未命中时静默忽略。
    pub fn cancel(&self, key: &str) {
        self.sessions.cancel(key);
    }

    /// 实例注册表（诊断与测试用）
    pub fn instances(&self) -> &Arc<InstanceManager> {
        &self.instances
    }
}

/// 上传客户端
///
/// 一个客户端持有恰好一份实例引用；`destroy` 释放引用，引用归零
/// 时后端实例随之销毁。
pub struct KodoClient {
    service: Arc<UploadService>,
    instance_id: String,
    destroyed: AtomicBool,
}

impl KodoClient {
    /// 底层实例 ID
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// 上传一个文件，完成时返回服务端响应体
    pub async fn upload(&self, options: UploadOptions) -> Result<serde_json::Value, ClientError> {
        let UploadOptions {
            file_path,
            key,
            token,
            on_progress,
        } = options;
        let request = UploadRequest {
            key,
            token,
            file_path,
        };
        self.service
            .sessions
            .start_upload(&self.instance_id, request, on_progress)
            .await
    }

    /// 按 key 取消在途上传（与本客户端绑定的实例无关）
    pub fn cancel(&self, key: &str) {
        self.service.cancel(key);
    }

    /// 释放实例引用；引用归零时销毁后端实例。重复调用无害
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.service.instances.release(&self.instance_id).await;
    }
}
