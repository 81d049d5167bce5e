// Qiniu Kodo Rust Client
// 七牛云对象存储上传客户端核心库

// 配置管理模块
pub mod config;

// 上传后端抽象
pub mod backend;

// 实例注册表模块
pub mod instance;

// 上传会话模块
pub mod session;

// 客户端外观模块
pub mod client;

// 上传凭证模块
pub mod token;

// 错误类型
pub mod error;

// 日志初始化
pub mod logging;

// 导出常用类型
pub use backend::memory::{qiniu_etag, MemoryBackend, StoredObject, DEFAULT_CHUNK_SIZE};
pub use backend::{
    BackendError, CompletionSender, ResponseInfo, UploadBackend, UploadOutcome,
    UploadProgressEvent, UploadRequest,
};
pub use client::{KodoClient, UploadOptions, UploadService};
pub use config::{
    ClientConfig, ConfigError, NativeConfig, ResumeUploadVersion, Zone, REGION_IDS,
};
pub use error::ClientError;
pub use instance::InstanceManager;
pub use session::{ProgressHandler, SessionManager};
pub use token::{sign_upload_token, UploadPolicy};
