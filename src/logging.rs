//! 日志初始化
//!
//! 库本身只通过 tracing 宏输出，不安装订阅器；这里提供给示例与
//! 测试用的控制台订阅器入口，按 RUST_LOG 过滤，未设置时用传入的
//! 默认级别。

use anyhow::{anyhow, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// 安装控制台日志订阅器
///
/// 进程内只能安装一次，重复安装会返回错误。
pub fn init(default_level: &str) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init()
        .map_err(|e| anyhow!("安装日志订阅器失败: {}", e))
}
