// 错误类型定义
//
// 构造阶段的错误（配置、后端 configure）同步抛出；上传阶段的错误
// 通过 upload 的返回值落定。除“取消未命中 key”这个文档化的静默
// 忽略外，任何错误都不吞掉。本层不做重试。

use crate::backend::{BackendError, ResponseInfo};
use crate::config::ConfigError;
use thiserror::Error;

/// 客户端统一错误
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// 逻辑配置不合法，构造阶段即失败
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// 实例未配置或已销毁
    #[error("实例未配置: {0}")]
    InstanceNotConfigured(String),
    /// 上传参数缺失或为空
    #[error("上传参数无效: {0}")]
    InvalidOptions(&'static str),
    /// 同一 key 已有在途上传
    #[error("相同 key 的上传正在进行: {0}")]
    KeyAlreadyInFlight(String),
    /// 后端 configure 操作失败
    #[error(transparent)]
    Backend(#[from] BackendError),
    /// 上传失败（含取消），携带后端诊断信息
    #[error("上传失败: {info}")]
    Upload { info: ResponseInfo },
}

impl ClientError {
    /// 是否因取消而失败
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ClientError::Upload { info } if info.is_cancelled())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelled_predicate() {
        let err = ClientError::Upload {
            info: ResponseInfo::cancelled(),
        };
        assert!(err.is_cancelled());
        assert!(!ClientError::InvalidOptions("key 不能为空").is_cancelled());
    }

    #[test]
    fn test_config_error_converts() {
        let err: ClientError = ConfigError::MissingZone.into();
        assert!(matches!(err, ClientError::Config(_)));
    }
}
