// 实例注册表
//
// 把逻辑配置映射到后端实例并按引用计数复用：结构相等的配置共享
// 同一个昂贵的后端实例，引用归零时销毁。全部状态由一把异步锁
// 串行化，锁跨越 configure/destroy 的等待，保证同配置并发 acquire
// 不会重复创建，也保证 release 不会销毁一个刚被复用的实例。

use crate::backend::UploadBackend;
use crate::config::ClientConfig;
use crate::error::ClientError;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 实例条目
struct InstanceEntry {
    /// 创建该实例的配置键。enforce_new_instance 创建的实例不进入
    /// 键缓存，此处为 None，也永远不会被后续 acquire 复用
    config_key: Option<String>,
    /// 引用计数
    ref_count: usize,
}

#[derive(Default)]
struct RegistryState {
    /// 配置键 → 实例 ID
    by_key: HashMap<String, String>,
    /// 实例 ID → 条目
    entries: HashMap<String, InstanceEntry>,
}

/// 实例注册表
pub struct InstanceManager {
    backend: Arc<dyn UploadBackend>,
    state: Mutex<RegistryState>,
}

impl InstanceManager {
    pub fn new(backend: Arc<dyn UploadBackend>) -> Self {
        Self {
            backend,
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// 获取一个实例引用
    ///
    /// 配置先规范化再参与身份比较；复用命中时递增引用计数，
    /// 未命中（或要求强制新建）时调用后端 configure 创建。
    /// configure 失败原样上抛，注册表不留任何半成品状态。
    pub async fn acquire(&self, config: &ClientConfig) -> Result<String, ClientError> {
        let native = config.normalize()?;
        let key = native.cache_key();

        let mut state = self.state.lock().await;
        if !config.enforce_new_instance {
            if let Some(instance_id) = state.by_key.get(&key).cloned() {
                if let Some(entry) = state.entries.get_mut(&instance_id) {
                    entry.ref_count += 1;
                    debug!(
                        "复用后端实例: id={}, ref_count={}",
                        instance_id, entry.ref_count
                    );
                    return Ok(instance_id);
                }
            }
        }

        let instance_id = Uuid::new_v4().to_string();
        self.backend.configure(&instance_id, &native).await?;
        state.entries.insert(
            instance_id.clone(),
            InstanceEntry {
                config_key: (!config.enforce_new_instance).then(|| key.clone()),
                ref_count: 1,
            },
        );
        if !config.enforce_new_instance {
            state.by_key.insert(key, instance_id.clone());
        }
        info!("创建后端实例: id={}", instance_id);
        Ok(instance_id)
    }

    /// 释放一个实例引用，归零时销毁后端实例
    ///
    /// 释放未知实例是无害操作，只记日志。
    pub async fn release(&self, instance_id: &str) {
        let mut state = self.state.lock().await;
        let reached_zero = match state.entries.get_mut(instance_id) {
            Some(entry) => {
                entry.ref_count -= 1;
                debug!(
                    "释放实例引用: id={}, ref_count={}",
                    instance_id, entry.ref_count
                );
                entry.ref_count == 0
            }
            None => {
                warn!("释放未知实例: id={}", instance_id);
                return;
            }
        };

        if reached_zero {
            if let Some(entry) = state.entries.remove(instance_id) {
                if let Some(key) = entry.config_key {
                    state.by_key.remove(&key);
                }
            }
            self.backend.destroy(instance_id).await;
            info!("实例引用归零，已销毁: id={}", instance_id);
        }
    }

    /// 实例是否存活
    pub async fn is_live(&self, instance_id: &str) -> bool {
        self.state.lock().await.entries.contains_key(instance_id)
    }

    /// 实例当前引用计数
    pub async fn ref_count(&self, instance_id: &str) -> Option<usize> {
        self.state
            .lock()
            .await
            .entries
            .get(instance_id)
            .map(|entry| entry.ref_count)
    }

    /// 存活实例数（诊断用）
    pub async fn instance_count(&self) -> usize {
        self.state.lock().await.entries.len()
    }
}
