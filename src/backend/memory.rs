// 内存后端
//
// 在进程内完整实现上传后端契约，用于本地开发与测试：按分片读取
// 本地文件、推送进度、在分片之间轮询取消令牌，最终把对象写入
// 内存并返回 Kodo 风格的响应体（key / hash / fsize）。

use super::{
    BackendError, CompletionSender, ResponseInfo, UploadBackend, UploadOutcome,
    UploadProgressEvent, UploadRequest, STATUS_INSTANCE_MISSING, STATUS_INVALID_FILE,
    STATUS_INVALID_TOKEN,
};
use crate::config::NativeConfig;
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sha1::{Digest, Sha1};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 默认分片大小（2MB，与原生引擎默认值一致）
pub const DEFAULT_CHUNK_SIZE: u64 = 2 * 1024 * 1024;

/// 分片间的节拍，模拟传输耗时，让取消有机会被观察到
const CHUNK_PACE: Duration = Duration::from_millis(2);

/// 进度事件通道容量
const PROGRESS_CHANNEL_CAPACITY: usize = 256;

/// 已存储的对象
#[derive(Debug, Clone)]
pub struct StoredObject {
    /// 对象键
    pub key: String,
    /// 对象内容
    pub data: Vec<u8>,
    /// Kodo etag
    pub hash: String,
    /// 上传完成时间
    pub uploaded_at: DateTime<Utc>,
}

/// 内存后端
pub struct MemoryBackend {
    /// 已配置的实例（instance_id → 规范配置）
    instances: Arc<DashMap<String, NativeConfig>>,
    /// 已完成上传的对象（key → 对象）
    objects: Arc<DashMap<String, StoredObject>>,
    /// 共享进度事件流
    progress_tx: broadcast::Sender<UploadProgressEvent>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (progress_tx, _) = broadcast::channel(PROGRESS_CHANNEL_CAPACITY);
        Self {
            instances: Arc::new(DashMap::new()),
            objects: Arc::new(DashMap::new()),
            progress_tx,
        }
    }

    /// 取出已上传的对象
    pub fn object(&self, key: &str) -> Option<StoredObject> {
        self.objects.get(key).map(|entry| entry.clone())
    }

    /// 已存储对象数量
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// 存活实例数量
    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// 执行一次上传，返回终态
    async fn execute(
        instances: Arc<DashMap<String, NativeConfig>>,
        objects: Arc<DashMap<String, StoredObject>>,
        progress_tx: &broadcast::Sender<UploadProgressEvent>,
        instance_id: &str,
        request: &UploadRequest,
        cancel: &CancellationToken,
    ) -> UploadOutcome {
        let config = match instances.get(instance_id) {
            Some(entry) => entry.clone(),
            None => {
                // 持有方并发销毁了实例才会竞态走到这里
                return UploadOutcome::failed(ResponseInfo::failed(
                    STATUS_INSTANCE_MISSING,
                    format!("实例未配置: {}", instance_id),
                ));
            }
        };

        // 凭证形状检查：AK:签名:编码策略
        if request.token.splitn(3, ':').count() != 3 {
            return UploadOutcome::failed(ResponseInfo::failed(
                STATUS_INVALID_TOKEN,
                "上传凭证格式错误",
            ));
        }

        let data = match tokio::fs::read(&request.file_path).await {
            Ok(data) => data,
            Err(e) => {
                return UploadOutcome::failed(ResponseInfo::failed(
                    STATUS_INVALID_FILE,
                    format!("读取文件失败: {}", e),
                ));
            }
        };

        let chunk_size = config.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE) as usize;
        let total = data.len();
        let emit = |percent: f64| {
            // 没有订阅者时发送失败是正常情况
            let _ = progress_tx.send(UploadProgressEvent {
                key: request.key.clone(),
                percent,
            });
        };

        if total == 0 {
            emit(1.0);
        } else {
            let mut uploaded = 0usize;
            while uploaded < total {
                if cancel.is_cancelled() {
                    info!("上传已取消: key={}, 进度 {}/{}", request.key, uploaded, total);
                    return UploadOutcome::failed(ResponseInfo::cancelled());
                }
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("上传已取消: key={}, 进度 {}/{}", request.key, uploaded, total);
                        return UploadOutcome::failed(ResponseInfo::cancelled());
                    }
                    _ = tokio::time::sleep(CHUNK_PACE) => {}
                }
                uploaded = (uploaded + chunk_size).min(total);
                emit(uploaded as f64 / total as f64);
            }
        }

        let hash = qiniu_etag(&data);
        objects.insert(
            request.key.clone(),
            StoredObject {
                key: request.key.clone(),
                data,
                hash: hash.clone(),
                uploaded_at: Utc::now(),
            },
        );

        let mut info = ResponseInfo::ok();
        info.req_id = Some(Uuid::new_v4().to_string());
        let response = serde_json::json!({
            "key": request.key,
            "hash": hash,
            "fsize": total,
        });
        debug!("上传完成: key={}, fsize={}", request.key, total);
        UploadOutcome::ok(info, response)
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UploadBackend for MemoryBackend {
    async fn configure(&self, instance_id: &str, config: &NativeConfig) -> Result<(), BackendError> {
        if self.instances.contains_key(instance_id) {
            return Err(BackendError::AlreadyConfigured(instance_id.to_string()));
        }
        self.instances.insert(instance_id.to_string(), config.clone());
        info!("内存后端实例已配置: id={}", instance_id);
        Ok(())
    }

    async fn destroy(&self, instance_id: &str) {
        if self.instances.remove(instance_id).is_some() {
            info!("内存后端实例已销毁: id={}", instance_id);
        } else {
            warn!("销毁未知实例: id={}", instance_id);
        }
    }

    async fn upload(
        &self,
        instance_id: &str,
        request: UploadRequest,
        completion: CompletionSender,
        cancel: CancellationToken,
    ) {
        let instances = self.instances.clone();
        let objects = self.objects.clone();
        let progress_tx = self.progress_tx.clone();
        let instance_id = instance_id.to_string();
        tokio::spawn(async move {
            let outcome =
                Self::execute(instances, objects, &progress_tx, &instance_id, &request, &cancel)
                    .await;
            if completion.send(outcome).is_err() {
                // 接收端已放弃等待，终态无人消费
                debug!("完成信号无人接收: key={}", request.key);
            }
        });
    }

    fn subscribe_progress(&self) -> broadcast::Receiver<UploadProgressEvent> {
        self.progress_tx.subscribe()
    }
}

/// 计算 Kodo etag
///
/// 4MB 以内：`0x16 + sha1(data)`；超过 4MB：按 4MB 分块，对各块
/// sha1 的拼接再取一次 sha1，前缀换成 `0x96`；结果做 URL 安全
/// base64 编码（21 字节恰好 28 个字符，无填充）。
pub fn qiniu_etag(data: &[u8]) -> String {
    const BLOCK_SIZE: usize = 4 * 1024 * 1024;
    let digest = if data.len() <= BLOCK_SIZE {
        let mut bytes = vec![0x16u8];
        bytes.extend_from_slice(&Sha1::digest(data));
        bytes
    } else {
        let mut block_hashes = Vec::with_capacity((data.len() / BLOCK_SIZE + 1) * 20);
        for block in data.chunks(BLOCK_SIZE) {
            block_hashes.extend_from_slice(&Sha1::digest(block));
        }
        let mut bytes = vec![0x96u8];
        bytes.extend_from_slice(&Sha1::digest(&block_hashes));
        bytes
    };
    URL_SAFE_NO_PAD.encode(digest)
}
