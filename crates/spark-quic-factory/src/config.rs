//! # config：工厂配置
//!
//! ## 意图（Why）
//! - 线程命名、绑定地址、ALPN 与 QUIC 传输参数在不同部署间存在差异，统一收敛为可由 TOML 装载的结构；
//! - 缺省值与历史行为保持一致：I/O 与事件线程沿用 `quic_transport_*_thread` 命名，拥塞控制默认 BBR。
//!
//! ## 契约（What）
//! - 所有字段均带 `serde(default)`，空文档即得到 [`FactoryConfig::default`]；
//! - [`FactoryConfig::validate`] 在工厂启动前执行，失败以 [`FactoryError::Config`] 返回。

use std::{
    fs,
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::error::FactoryError;

/// 拥塞控制算法选择。
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CongestionController {
    /// BBR。
    #[default]
    Bbr,
    /// CUBIC。
    Cubic,
    /// NewReno。
    NewReno,
}

/// QUIC 传输层参数。
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct TransportSettings {
    /// 空闲超时（毫秒）；`0` 表示不设置。
    pub idle_timeout_ms: u64,
    /// 保活间隔（毫秒）。
    pub keep_alive_interval_ms: Option<u64>,
    /// 拥塞控制算法。
    pub congestion_controller: CongestionController,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 30_000,
            keep_alive_interval_ms: None,
            congestion_controller: CongestionController::Bbr,
        }
    }
}

impl TransportSettings {
    /// 空闲超时；`None` 表示沿用引擎默认值。
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms))
    }

    /// 保活间隔。
    pub fn keep_alive_interval(&self) -> Option<Duration> {
        self.keep_alive_interval_ms.map(Duration::from_millis)
    }
}

/// 工厂配置。
///
/// # 教案式说明
/// - **意图 (Why)**：把工厂生命周期内不变的参数集中在一处，工厂构造后只读共享给服务端与客户端；
/// - **契约 (What)**：`server_bind_host` 必须是 IP 字面量，`client_bind_addr` 必须是 `ip:port`；
///   `alpn_protocols` 不可为空，否则 QUIC 握手无法协商应用协议；
/// - **风险 (Trade-offs)**：`trusted_root_certificates` 仅在客户端未配置指纹时生效，
///   配置了指纹的客户端只做固定证书校验。
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct FactoryConfig {
    /// I/O 执行上下文名称。
    pub io_thread_name: String,
    /// 事件执行上下文名称。
    pub event_thread_name: String,
    /// 工作线程栈大小（字节）。
    pub thread_stack_size: Option<usize>,
    /// 服务端监听的主机地址。
    pub server_bind_host: String,
    /// 客户端本地绑定地址。
    pub client_bind_addr: String,
    /// ALPN 协议列表，按优先级排序。
    pub alpn_protocols: Vec<String>,
    /// 未配置指纹的客户端额外信任的根证书（PEM 路径）。
    pub trusted_root_certificates: Vec<PathBuf>,
    /// 传输层参数。
    pub transport: TransportSettings,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            io_thread_name: "quic_transport_io_thread".to_owned(),
            event_thread_name: "quic_transport_event_thread".to_owned(),
            thread_stack_size: None,
            server_bind_host: "0.0.0.0".to_owned(),
            client_bind_addr: "0.0.0.0:0".to_owned(),
            alpn_protocols: vec!["h3".to_owned()],
            trusted_root_certificates: Vec::new(),
            transport: TransportSettings::default(),
        }
    }
}

impl FactoryConfig {
    /// 从 TOML 文本解析并校验。
    pub fn from_toml_str(text: &str) -> Result<Self, FactoryError> {
        let config: FactoryConfig =
            toml::from_str(text).map_err(|err| FactoryError::config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// 从 TOML 文件加载并校验。
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, FactoryError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|err| {
            FactoryError::config(format!("cannot read `{}`: {err}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    /// 校验字段间约束。
    pub fn validate(&self) -> Result<(), FactoryError> {
        if self.io_thread_name.trim().is_empty() || self.event_thread_name.trim().is_empty() {
            return Err(FactoryError::config("thread names must not be empty"));
        }
        if self.io_thread_name == self.event_thread_name {
            return Err(FactoryError::config(
                "io and event contexts must use distinct thread names",
            ));
        }
        if self.alpn_protocols.is_empty() || self.alpn_protocols.iter().any(String::is_empty) {
            return Err(FactoryError::config("alpn_protocols must list at least one protocol"));
        }
        self.server_bind_ip()?;
        self.client_bind_socket()?;
        Ok(())
    }

    /// 服务端监听 IP。
    pub fn server_bind_ip(&self) -> Result<IpAddr, FactoryError> {
        self.server_bind_host.parse().map_err(|_| {
            FactoryError::config(format!(
                "server_bind_host `{}` is not an ip address",
                self.server_bind_host
            ))
        })
    }

    /// 客户端本地绑定地址。
    pub fn client_bind_socket(&self) -> Result<SocketAddr, FactoryError> {
        self.client_bind_addr.parse().map_err(|_| {
            FactoryError::config(format!(
                "client_bind_addr `{}` is not a socket address",
                self.client_bind_addr
            ))
        })
    }

    pub(crate) fn alpn_bytes(&self) -> Vec<Vec<u8>> {
        self.alpn_protocols
            .iter()
            .map(|protocol| protocol.as_bytes().to_vec())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = FactoryConfig::from_toml_str("").expect("defaults");
        assert_eq!(config, FactoryConfig::default());
        assert_eq!(
            config.transport.congestion_controller,
            CongestionController::Bbr
        );
        assert_eq!(config.transport.idle_timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn overrides_are_applied() {
        let config = FactoryConfig::from_toml_str(
            r#"
            io_thread_name = "edge-io"
            event_thread_name = "edge-events"
            alpn_protocols = ["h3", "wq-vvv-01"]

            [transport]
            idle_timeout_ms = 0
            keep_alive_interval_ms = 5000
            congestion_controller = "cubic"
            "#,
        )
        .expect("parse");
        assert_eq!(config.io_thread_name, "edge-io");
        assert_eq!(config.alpn_bytes()[1], b"wq-vvv-01".to_vec());
        assert_eq!(config.transport.idle_timeout(), None);
        assert_eq!(
            config.transport.keep_alive_interval(),
            Some(Duration::from_secs(5))
        );
        assert_eq!(
            config.transport.congestion_controller,
            CongestionController::Cubic
        );
    }

    #[test]
    fn invalid_values_are_rejected() {
        for document in [
            "alpn_protocols = []",
            "server_bind_host = \"localhost\"",
            "client_bind_addr = \"0.0.0.0\"",
            "io_thread_name = \"same\"\nevent_thread_name = \"same\"",
            "unknown_field = 1",
        ] {
            let err = FactoryConfig::from_toml_str(document).expect_err(document);
            assert_eq!(err.code(), "spark.quic.factory.config");
        }
    }
}
