//! 日志初始化
//!
//! 所有 crate 都通过 `tracing` 输出日志；应用启动时调用一次 [`init_logging`]。
//! 过滤规则依次取自 `MKS_LOG`、`RUST_LOG`，都未设置时使用默认指令。
//! 依赖 `log` crate 的第三方库输出经 `tracing-log` 桥接到同一个订阅器。

use std::sync::OnceLock;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

/// 覆盖过滤规则的环境变量
pub const LOG_ENV: &str = "MKS_LOG";

/// 未设置环境变量时的默认过滤规则
pub const DEFAULT_DIRECTIVE: &str = "info,mks_driver=info,mks_can=warn";

static INITIALIZED: OnceLock<()> = OnceLock::new();

#[derive(Error, Debug)]
pub enum LoggingError {
    /// 进程中已经安装了其他全局订阅器
    #[error("Failed to install tracing subscriber: {0}")]
    Subscriber(#[from] tracing::subscriber::SetGlobalDefaultError),

    #[error("Failed to install log bridge: {0}")]
    LogBridge(#[from] tracing_log::log_tracer::SetLoggerError),
}

/// 以默认规则初始化日志（重复调用直接返回 `Ok`）
pub fn init_logging() -> Result<(), LoggingError> {
    init_logging_with(DEFAULT_DIRECTIVE)
}

/// 以给定默认规则初始化日志
///
/// 整个进程只尝试安装一次：并发调用方等待第一次安装结束后返回 `Ok`，
/// 安装失败的错误只返回给执行安装的那一个调用方。
pub fn init_logging_with(default_directive: &str) -> Result<(), LoggingError> {
    let mut outcome = Ok(());
    INITIALIZED.get_or_init(|| outcome = install(default_directive));
    outcome
}

fn install(default_directive: &str) -> Result<(), LoggingError> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter(default_directive))
        .with_target(true)
        .with_thread_names(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    tracing_log::LogTracer::init()?;

    tracing::debug!("logging initialised");
    Ok(())
}

/// 解析过滤规则：`MKS_LOG` > `RUST_LOG` > `default_directive`
pub fn env_filter(default_directive: &str) -> EnvFilter {
    let fallback = || EnvFilter::try_new(default_directive).unwrap_or_else(|_| EnvFilter::new("info"));

    match std::env::var(LOG_ENV) {
        Ok(directive) => EnvFilter::try_new(&directive).unwrap_or_else(|err| {
            eprintln!("invalid {LOG_ENV} directive ({err}); using default");
            fallback()
        }),
        Err(_) => EnvFilter::try_from_default_env().unwrap_or_else(|_| fallback()),
    }
}
