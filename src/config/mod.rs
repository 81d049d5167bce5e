// 配置管理模块
//
// 负责把用户侧的逻辑配置（ClientConfig）规范化为后端可直接消费的
// 规范配置（NativeConfig）。规范化是纯函数：非法形状在这里拒绝，
// 未设置的选项保持缺省，交给后端自己的默认值。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tokio::fs;

/// 已知的存储区域 ID，与服务端的区域枚举一致
pub const REGION_IDS: &[&str] = &[
    "z0",              // 华东-浙江
    "cn-east-2",       // 华东-浙江2
    "z1",              // 华北-河北
    "z2",              // 华南-广东
    "cn-northwest-1",  // 西北-陕西1
    "na0",             // 北美-洛杉矶
    "as0",             // 亚太-新加坡
    "ap-southeast-2",  // 亚太-河内
    "ap-southeast-3",  // 亚太-胡志明
];

/// 上传区域选择
///
/// `Region` 与 `CustomDomains` 对应固定区域，`Auto` 与
/// `CustomUcServers` 对应自动选路。四种形状互斥。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Zone {
    /// 根据网络状况自动选择最优上传区域
    Auto,
    /// 固定区域（按区域 ID）
    Region { id: String },
    /// 自定义上传域名列表（建议由业务服务端下发，不要硬编码）
    CustomDomains { domains: Vec<String> },
    /// 自定义 UC 服务器列表（私有云场景）
    CustomUcServers { uc_servers: Vec<String> },
}

/// 断点续传协议版本
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResumeUploadVersion {
    V1,
    V2,
}

/// 客户端逻辑配置
///
/// 除 `zone` 与 `enforce_new_instance` 外全部为透传选项：设置了就
/// 原样交给后端，没设置就让后端用自己的默认值。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// 上传区域选择。必填：缺失会在规范化时报错，不会静默回退到 auto
    pub zone: Option<Zone>,
    /// 分片上传阈值（字节）
    pub put_threshold: Option<u64>,
    /// 是否并发续传分片
    pub use_concurrent_resume_upload: Option<bool>,
    /// 断点续传协议版本
    pub resume_upload_version: Option<ResumeUploadVersion>,
    /// 上传加速。仅自动选路时有意义，但这里不做组合校验，原样透传
    pub accelerate_uploading: Option<bool>,
    /// 为 true 时总是创建新的后端实例，不参与同配置实例复用
    pub enforce_new_instance: bool,
    /// 分片大小（字节）
    pub chunk_size: Option<u64>,
    /// 最大重试次数
    pub retry_max: Option<u32>,
    /// 重试间隔（毫秒）
    pub retry_interval: Option<u32>,
    /// 超时时间（秒）
    pub timeout_interval: Option<u32>,
    /// 是否使用 HTTPS
    pub use_https: Option<bool>,
    /// 是否允许备用域名
    pub allow_backup_host: Option<bool>,
    /// 并发任务数
    pub concurrent_task_count: Option<u32>,
}

/// 规范配置，后端 configure 操作的入参
///
/// 区域选择已经展开为三个互斥字段（都缺省即自动选路）。字段顺序
/// 固定且未设置的字段不参与序列化，因此 `cache_key` 对结构相等的
/// 配置必然相同。`enforce_new_instance` 只影响注册表行为，不属于
/// 配置身份，已在规范化时剥离。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeConfig {
    /// 自定义上传域名（固定区域）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domains: Option<Vec<String>>,
    /// 自定义 UC 服务器（自动选路）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uc_servers: Option<Vec<String>>,
    /// 区域 ID（固定区域）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub put_threshold: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_concurrent_resume_upload: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_upload_version: Option<ResumeUploadVersion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accelerate_uploading: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_max: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_interval: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_interval: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_https: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_backup_host: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrent_task_count: Option<u32>,
}

/// 配置错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// zone 完全缺失。历史行为是报错而非回退 auto，保持不变
    #[error("必须指定 zone：auto、区域 ID、自定义域名或自定义 UC 服务器")]
    MissingZone,
    #[error("无效的区域 ID: {0}")]
    InvalidRegion(String),
    #[error("自定义上传域名列表不能为空")]
    EmptyCustomDomains,
    #[error("自定义 UC 服务器列表不能为空")]
    EmptyUcServers,
}

impl ClientConfig {
    /// 规范化为后端配置
    ///
    /// 区域解析优先级：自定义域名 > 自定义 UC 服务器 > 区域 ID > auto。
    /// 枚举本身保证了互斥，这里只做形状校验。
    pub fn normalize(&self) -> Result<NativeConfig, ConfigError> {
        let mut native = NativeConfig {
            put_threshold: self.put_threshold,
            use_concurrent_resume_upload: self.use_concurrent_resume_upload,
            resume_upload_version: self.resume_upload_version,
            accelerate_uploading: self.accelerate_uploading,
            chunk_size: self.chunk_size,
            retry_max: self.retry_max,
            retry_interval: self.retry_interval,
            timeout_interval: self.timeout_interval,
            use_https: self.use_https,
            allow_backup_host: self.allow_backup_host,
            concurrent_task_count: self.concurrent_task_count,
            ..Default::default()
        };

        match &self.zone {
            Some(Zone::CustomDomains { domains }) => {
                if domains.is_empty() {
                    return Err(ConfigError::EmptyCustomDomains);
                }
                native.domains = Some(domains.clone());
            }
            Some(Zone::CustomUcServers { uc_servers }) => {
                if uc_servers.is_empty() {
                    return Err(ConfigError::EmptyUcServers);
                }
                native.uc_servers = Some(uc_servers.clone());
            }
            Some(Zone::Region { id }) => {
                if !REGION_IDS.contains(&id.as_str()) {
                    return Err(ConfigError::InvalidRegion(id.clone()));
                }
                native.zone = Some(id.clone());
            }
            Some(Zone::Auto) => {}
            None => return Err(ConfigError::MissingZone),
        }

        Ok(native)
    }

    /// 从 TOML 文件加载配置
    pub async fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("读取配置文件失败: {}", path.display()))?;

        let config: ClientConfig =
            toml::from_str(&content).context("解析配置文件失败")?;

        Ok(config)
    }
}

impl NativeConfig {
    /// 序列化为实例缓存键
    ///
    /// 结构相等的配置得到相同的键，等价于按内容去重。
    pub fn cache_key(&self) -> String {
        serde_json::to_string(self).expect("纯数据结构序列化不会失败")
    }
}
