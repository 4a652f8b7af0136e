//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 集中定义工厂对外暴露的全部失败语义：证书供给、跨线程构造、执行上下文可用性以及调用契约违例；
//! - 每个错误携带稳定的点分错误码（`spark.quic.factory.*`），便于日志检索与告警聚合。
//!
//! ## 设计要求（What）
//! - 所有错误类型派生 `thiserror::Error`，可跨线程传递（`Send + Sync + 'static`）；
//! - 可恢复错误（证书、构造）在产生它的调用点就地返回，不跨越工厂边界向外“抛出”；
//! - 契约违例（重复释放、跨工厂句柄、重入阻塞）通过 [`FactoryError::is_contract_violation`] 单独归类。
//!
//! ## 风险提示（Trade-offs）
//! - `quinn` 与 `rustls` 的底层错误统一折叠为字符串描述，牺牲了结构化匹配能力，换取错误类型的稳定性。

use std::{io, path::PathBuf};

use thiserror::Error;

/// 证书材料初始化失败。
///
/// # 教案式说明
/// - **意图 (Why)**：PEM 与 PKCS#12 两种来源共享同一失败语义，调用方无需关心证书是如何供给的；
/// - **契约 (What)**：
///   - `Unreadable`：路径不可读（不存在、权限不足等），保留底层 `io::Error`；
///   - `InvalidMaterial`：解析失败、私钥与证书不匹配、密码错误或证书包格式损坏；
/// - **风险 (Trade-offs)**：密码错误与证书包损坏在 PKCS#12 层面无法可靠区分，均归入 `InvalidMaterial`。
#[derive(Debug, Error)]
pub enum CredentialError {
    /// 证书或私钥文件无法读取。
    #[error("credential file `{}` is unreadable: {source}", path.display())]
    Unreadable {
        /// 读取失败的路径。
        path: PathBuf,
        /// 底层 IO 错误。
        source: io::Error,
    },

    /// 证书材料无法转换为可用的 TLS 凭据。
    #[error("credential material in `{}` is invalid: {reason}", path.display())]
    InvalidMaterial {
        /// 引发失败的材料路径。
        path: PathBuf,
        /// 人类可读的失败原因。
        reason: String,
    },
}

impl CredentialError {
    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            CredentialError::Unreadable { .. } => "spark.quic.factory.credential.unreadable",
            CredentialError::InvalidMaterial { .. } => {
                "spark.quic.factory.credential.invalid_material"
            }
        }
    }

    pub(crate) fn invalid(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        CredentialError::InvalidMaterial {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// 在执行上下文内构造客户端时发生的失败。
///
/// # 教案式说明
/// - **意图 (Why)**：构造闭包运行在 I/O 线程上，失败必须经由完成单元（completion cell）原样带回调用线程；
/// - **契约 (What)**：除 `Abandoned` 外，所有变体均由构造闭包主动返回；`Abandoned` 表示闭包在写入结果前被销毁
///   （例如在工作线程上 panic），调用方据此得到确定性的失败而非无限等待。
#[derive(Debug, Error)]
pub enum ConstructionError {
    /// URL 无法解析。
    #[error("url `{url}` is malformed: {reason}")]
    InvalidUrl {
        /// 原始 URL 文本。
        url: String,
        /// 解析器给出的原因。
        reason: String,
    },

    /// URL 协议不受支持。
    #[error("url scheme `{scheme}` is not supported, expected `https` or `quic-transport`")]
    UnsupportedScheme {
        /// 实际出现的协议。
        scheme: String,
    },

    /// URL 缺少主机名。
    #[error("url `{url}` does not name a host")]
    MissingHost {
        /// 原始 URL 文本。
        url: String,
    },

    /// 底层 UDP 端点创建失败。
    #[error("failed to bind client endpoint: {source}")]
    Endpoint {
        /// 底层 IO 错误。
        source: io::Error,
    },

    /// TLS 配置组装失败。
    #[error("failed to assemble tls configuration: {reason}")]
    Tls {
        /// 失败原因。
        reason: String,
    },

    /// 构造闭包在交付结果前被丢弃。
    #[error("construction closure was dropped before it produced a result")]
    Abandoned,
}

impl ConstructionError {
    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            ConstructionError::InvalidUrl { .. } => "spark.quic.factory.construct.invalid_url",
            ConstructionError::UnsupportedScheme { .. } => {
                "spark.quic.factory.construct.unsupported_scheme"
            }
            ConstructionError::MissingHost { .. } => "spark.quic.factory.construct.missing_host",
            ConstructionError::Endpoint { .. } => "spark.quic.factory.construct.endpoint",
            ConstructionError::Tls { .. } => "spark.quic.factory.construct.tls",
            ConstructionError::Abandoned => "spark.quic.factory.construct.abandoned",
        }
    }
}

/// 工厂边界上的统一错误类型。
///
/// # 教案式说明
/// - **意图 (Why)**：所有公开操作都以 `Result<_, FactoryError>` 内联返回结果，避免异常语义穿越线程边界；
/// - **契约 (What)**：
///   - `Credential`/`Construction` 为可恢复错误，工厂保持可用；
///   - `ContextUnavailable` 表示调用方在工厂关闭后继续使用，属于编程错误；
///   - `ServerNotFound`/`ForeignHandle`/`ReentrantCall` 为调用契约违例；
/// - **风险 (Trade-offs)**：契约违例同样以 `Err` 返回而不是 panic，调用方若忽略返回值将无法察觉缺陷，
///   因此这些路径在返回前都会输出 ERROR 级别日志。
#[derive(Debug, Error)]
pub enum FactoryError {
    /// 目标执行上下文已停止或正在停止。
    #[error("execution context `{context}` is unavailable")]
    ContextUnavailable {
        /// 上下文名称。
        context: String,
    },

    /// 执行上下文的工作线程或运行时创建失败。
    #[error("failed to start execution context `{context}`: {source}")]
    ContextSpawn {
        /// 上下文名称。
        context: String,
        /// 底层 IO 错误。
        source: io::Error,
    },

    /// 证书材料初始化失败。
    #[error(transparent)]
    Credential(#[from] CredentialError),

    /// 跨线程构造失败。
    #[error(transparent)]
    Construction(#[from] ConstructionError),

    /// 句柄对应的服务端不存在（已释放或从未登记）。
    #[error("server {id} is not registered with this factory")]
    ServerNotFound {
        /// 服务端标识。
        id: u64,
    },

    /// 句柄由其他工厂实例签发。
    #[error("server handle {id} was issued by factory {issuer}, not by factory {factory}")]
    ForeignHandle {
        /// 服务端标识。
        id: u64,
        /// 签发句柄的工厂。
        issuer: u64,
        /// 当前工厂。
        factory: u64,
    },

    /// 句柄所指向的服务端已被释放。
    #[error("server {id} has already been released")]
    ServerReleased {
        /// 服务端标识。
        id: u64,
    },

    /// 服务端重复启动。
    #[error("server {id} is already started")]
    AlreadyStarted {
        /// 服务端标识。
        id: u64,
    },

    /// 在目标上下文自身的工作线程上发起阻塞等待，必然死锁。
    #[error("blocking call on `{context}` issued from its own worker thread")]
    ReentrantCall {
        /// 上下文名称。
        context: String,
    },

    /// 服务端端点绑定失败。
    #[error("failed to bind server endpoint on {addr}: {reason}")]
    Bind {
        /// 目标地址。
        addr: String,
        /// 失败原因。
        reason: String,
    },

    /// 配置加载或校验失败。
    #[error("invalid factory configuration: {reason}")]
    Config {
        /// 失败原因。
        reason: String,
    },
}

impl FactoryError {
    /// 稳定错误码，沿用 `spark.quic.factory.*` 命名约定。
    pub fn code(&self) -> &'static str {
        match self {
            FactoryError::ContextUnavailable { .. } => "spark.quic.factory.context_unavailable",
            FactoryError::ContextSpawn { .. } => "spark.quic.factory.context_spawn",
            FactoryError::Credential(err) => err.code(),
            FactoryError::Construction(err) => err.code(),
            FactoryError::ServerNotFound { .. } => "spark.quic.factory.server_not_found",
            FactoryError::ForeignHandle { .. } => "spark.quic.factory.foreign_handle",
            FactoryError::ServerReleased { .. } => "spark.quic.factory.server_released",
            FactoryError::AlreadyStarted { .. } => "spark.quic.factory.already_started",
            FactoryError::ReentrantCall { .. } => "spark.quic.factory.reentrant_call",
            FactoryError::Bind { .. } => "spark.quic.factory.bind",
            FactoryError::Config { .. } => "spark.quic.factory.config",
        }
    }

    /// 是否属于调用契约违例（调用方缺陷，而非瞬时故障）。
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            FactoryError::ContextUnavailable { .. }
                | FactoryError::ServerNotFound { .. }
                | FactoryError::ForeignHandle { .. }
                | FactoryError::ServerReleased { .. }
                | FactoryError::ReentrantCall { .. }
        )
    }

    pub(crate) fn config(reason: impl Into<String>) -> Self {
        FactoryError::Config {
            reason: reason.into(),
        }
    }
}

/// 客户端建连阶段的失败，经由事件上下文投递给 [`ClientVisitor`](crate::client::ClientVisitor)。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ClientError {
    /// 目标主机名解析失败或没有可用地址。
    #[error("failed to resolve `{host}`: {reason}")]
    Resolve {
        /// 主机名。
        host: String,
        /// 失败原因。
        reason: String,
    },

    /// 握手发起阶段失败（配置缺失、地址非法等）。
    #[error("failed to initiate connection: {reason}")]
    Connect {
        /// 失败原因。
        reason: String,
    },

    /// 握手或连接过程中失败。
    #[error("connection failed: {reason}")]
    Connection {
        /// 失败原因。
        reason: String,
    },
}

impl ClientError {
    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            ClientError::Resolve { .. } => "spark.quic.factory.client.resolve",
            ClientError::Connect { .. } => "spark.quic.factory.client.connect",
            ClientError::Connection { .. } => "spark.quic.factory.client.connection",
        }
    }
}
