//! # bootstrap：进程级默认设置
//!
//! ## 意图（Why）
//! - 日志订阅器与 rustls 默认加密后端都是进程全局状态，不应在工厂构造时被隐式改写；
//!   因此单独暴露一个显式、幂等的入口，由 [`TransportFactory::create`](crate::TransportFactory::create) 或宿主主动调用。
//!
//! ## 逻辑（How）
//! 1. 若外部尚未设置全局 Subscriber，则组装 `fmt + EnvFilter` 并设为全局默认；
//! 2. 默认过滤指令在 debug 构建下为 `info`、release 构建下为 `warn`，`RUST_LOG` 优先；
//! 3. 安装 ring 作为 rustls 的进程默认 `CryptoProvider`，已安装时保持原状。
//!
//! ## 契约（What）
//! - 以 `OnceLock` 保证只执行一次，重复调用返回首次的结果；
//! - 任何一步“已被他人设置”都不视为错误，只在返回值中标记。

use std::sync::OnceLock;

use tracing::dispatcher;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt};

/// 进程级默认设置的安装结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProcessDefaults {
    /// 本次是否由工厂安装了全局日志订阅器。
    pub subscriber_installed: bool,
    /// 本次是否由工厂安装了 rustls 默认加密后端。
    pub crypto_provider_installed: bool,
}

static DEFAULTS: OnceLock<ProcessDefaults> = OnceLock::new();

/// 安装进程级默认设置，幂等。
pub fn initialize_process_defaults() -> ProcessDefaults {
    *DEFAULTS.get_or_init(|| {
        let subscriber_installed = install_subscriber();
        let crypto_provider_installed = rustls::crypto::ring::default_provider()
            .install_default()
            .is_ok();
        tracing::debug!(
            subscriber_installed,
            crypto_provider_installed,
            "process defaults initialized"
        );
        ProcessDefaults {
            subscriber_installed,
            crypto_provider_installed,
        }
    })
}

fn install_subscriber() -> bool {
    if dispatcher::has_been_set() {
        return false;
    }
    let subscriber = tracing_subscriber::registry()
        .with(build_env_filter())
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr));
    tracing::subscriber::set_global_default(subscriber).is_ok()
}

fn build_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive()))
}

/// 未设置 `RUST_LOG` 时的默认过滤指令。
pub fn default_directive() -> &'static str {
    if cfg!(debug_assertions) { "info" } else { "warn" }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_initialization_returns_first_outcome() {
        let first = initialize_process_defaults();
        let second = initialize_process_defaults();
        assert_eq!(first, second);
        assert!(rustls::crypto::CryptoProvider::get_default().is_some());
    }

    #[test]
    fn debug_builds_default_to_info() {
        if cfg!(debug_assertions) {
            assert_eq!(default_directive(), "info");
        } else {
            assert_eq!(default_directive(), "warn");
        }
    }
}
