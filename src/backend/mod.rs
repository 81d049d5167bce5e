// 上传后端抽象
//
// 真正的传输引擎（分片、重试、选路）只通过这组窄接口暴露：
// configure / upload / destroy，外加一条全实例共享的进度事件流。
// 上层编排不关心引擎内部如何实现。

use crate::config::NativeConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;

pub mod memory;

#[cfg(test)]
pub(crate) mod testing;

/// 成功
pub const STATUS_OK: i32 = 200;
/// 后端未给出终态（通道中断等），由会话层合成
pub const STATUS_UNEXPECTED: i32 = -1;
/// 用户取消
pub const STATUS_CANCELLED: i32 = -2;
/// 文件不可读
pub const STATUS_INVALID_FILE: i32 = -3;
/// 上传凭证格式错误
pub const STATUS_INVALID_TOKEN: i32 = -5;
/// 实例未配置或已销毁
pub const STATUS_INSTANCE_MISSING: i32 = -6;

/// 上传进度事件
///
/// 全部实例、全部上传共用一条事件流，靠 `key` 区分归属。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadProgressEvent {
    /// 对象键
    pub key: String,
    /// 进度，0.0 ~ 1.0
    pub percent: f64,
}

/// 单次上传的请求参数
#[derive(Debug, Clone)]
pub struct UploadRequest {
    /// 对象键，同时作为进度与取消的路由键
    pub key: String,
    /// 上传凭证
    pub token: String,
    /// 本地文件路径（不要带 file:// 前缀，URI 需先行解码）
    pub file_path: PathBuf,
}

/// 后端完成信号携带的诊断信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseInfo {
    /// 状态码，200 表示成功
    pub status_code: i32,
    /// 请求 ID（如有）
    pub req_id: Option<String>,
    /// 错误描述（如有）
    pub error: Option<String>,
}

impl ResponseInfo {
    pub fn ok() -> Self {
        Self {
            status_code: STATUS_OK,
            req_id: None,
            error: None,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            status_code: STATUS_CANCELLED,
            req_id: None,
            error: Some("用户取消上传".to_string()),
        }
    }

    pub fn failed(status_code: i32, error: impl Into<String>) -> Self {
        Self {
            status_code,
            req_id: None,
            error: Some(error.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status_code == STATUS_OK
    }

    pub fn is_cancelled(&self) -> bool {
        self.status_code == STATUS_CANCELLED
    }
}

impl fmt::Display for ResponseInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "status_code={}", self.status_code)?;
        if let Some(req_id) = &self.req_id {
            write!(f, ", req_id={}", req_id)?;
        }
        if let Some(error) = &self.error {
            write!(f, ", error={}", error)?;
        }
        Ok(())
    }
}

/// 一次上传的终态
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    /// 诊断信息
    pub info: ResponseInfo,
    /// 服务端响应体，失败时为 Null
    pub response: serde_json::Value,
}

impl UploadOutcome {
    pub fn ok(info: ResponseInfo, response: serde_json::Value) -> Self {
        Self { info, response }
    }

    pub fn failed(info: ResponseInfo) -> Self {
        Self {
            info,
            response: serde_json::Value::Null,
        }
    }
}

/// 完成信号发送端，每次上传恰好触发一次
pub type CompletionSender = oneshot::Sender<UploadOutcome>;

/// 后端错误（configure 阶段）
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("后端配置失败: {0}")]
    Configure(String),
    #[error("实例已存在: {0}")]
    AlreadyConfigured(String),
}

/// 上传后端
///
/// 实现方负责真正的传输；本层只做编排。取消令牌是建议性质的：
/// 后端自行决定多快响应，但被取消的上传最终仍须恰好发出一次
/// 完成信号。
#[async_trait]
pub trait UploadBackend: Send + Sync {
    /// 按规范配置创建一个后端实例
    async fn configure(&self, instance_id: &str, config: &NativeConfig) -> Result<(), BackendError>;

    /// 销毁后端实例，释放其资源
    async fn destroy(&self, instance_id: &str);

    /// 发起一次上传
    ///
    /// 立即返回；完成信号经 `completion` 送达，进度事件在完成前
    /// 推送零次或多次。
    async fn upload(
        &self,
        instance_id: &str,
        request: UploadRequest,
        completion: CompletionSender,
        cancel: CancellationToken,
    );

    /// 订阅共享进度事件流
    fn subscribe_progress(&self) -> broadcast::Receiver<UploadProgressEvent>;
}
