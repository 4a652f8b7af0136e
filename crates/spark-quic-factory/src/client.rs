//! # client：构造于 I/O 上下文的 QUIC 客户端
//!
//! ## 意图（Why）
//! - `quinn::Endpoint::client` 会把驱动任务绑定到当前 Tokio 运行时，客户端必须在 I/O 上下文上构造；
//! - 建连结果以回调形式投递到事件上下文，调用方线程永远不会等待网络往返。
//!
//! ## 契约（What）
//! - 仅接受 `https` 与 `quic-transport` 协议，主机名必填，端口缺省 443；
//! - `connect`/`close` 立即返回，真实动作在 I/O 上下文上执行；
//! - 回调（[`ClientVisitor`]）总是在事件上下文上执行；
//! - 工厂停机后保留的客户端句柄再调用任何操作都会得到 `ContextUnavailable`。

use std::{
    fmt,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, ThreadId},
};

use parking_lot::{Mutex, RwLock};
use quinn::{Connection, Endpoint, VarInt};
use url::{Host, Url};

use crate::{
    config::FactoryConfig,
    context::ExecutionContext,
    error::{ClientError, ConstructionError, FactoryError},
    fingerprint::CertificateFingerprint,
    tls,
};

/// 工厂返回给调用方的客户端句柄。
pub type ClientHandle = Arc<QuicClient>;

/// 客户端构造参数，按值拷贝进构造闭包。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClientParameters {
    /// 允许的服务端证书指纹；非空时启用固定证书校验，替代 WebPKI 链校验。
    pub server_certificate_fingerprints: Vec<CertificateFingerprint>,
}

impl ClientParameters {
    /// 以单个指纹构造参数。
    pub fn pinned(fingerprint: CertificateFingerprint) -> Self {
        Self {
            server_certificate_fingerprints: vec![fingerprint],
        }
    }
}

/// 客户端事件回调，始终在事件执行上下文上调用。
pub trait ClientVisitor: Send + Sync + 'static {
    /// 握手完成。
    fn on_connected(&self) {}

    /// 解析或握手失败。
    fn on_connection_failed(&self, _error: ClientError) {}

    /// 已建立的连接关闭（任意一方发起）。
    fn on_closed(&self) {}
}

pub(crate) struct ClientBuild {
    pub(crate) id: u64,
    pub(crate) url: String,
    pub(crate) parameters: ClientParameters,
    pub(crate) config: Arc<FactoryConfig>,
    pub(crate) bind: SocketAddr,
    pub(crate) io: ExecutionContext,
    pub(crate) events: ExecutionContext,
}

/// QUIC 客户端。
///
/// # 教案式注释
///
/// ## 逻辑（How）
/// - 构造：解析 URL，按参数选择固定指纹或根证书校验，绑定本地 UDP 端点；
/// - `connect`：在 I/O 运行时上派生“解析主机名 → 发起握手”的 Future，结果经事件上下文回调；
/// - 连接建立后另派生一个观察任务，连接关闭时清空连接槽并投递 `on_closed`。
///
/// ## 风险（Trade-offs）
/// - 主机名解析可能返回多个地址，只尝试与本地端点地址族一致的第一个；
/// - `Drop` 时把关闭动作投递回 I/O 上下文，上下文已停止则就地关闭。
pub struct QuicClient {
    id: u64,
    url: Url,
    origin: String,
    host: String,
    port: u16,
    parameters: ClientParameters,
    endpoint: Endpoint,
    constructed_on: ThreadId,
    io: ExecutionContext,
    events: ExecutionContext,
    shared: Arc<ClientShared>,
}

#[derive(Default)]
struct ClientShared {
    connecting: AtomicBool,
    connection: Mutex<Option<Connection>>,
    visitor: RwLock<Option<Arc<dyn ClientVisitor>>>,
}

impl QuicClient {
    /// 在 I/O 上下文的工作线程上调用。
    pub(crate) fn build(request: ClientBuild) -> Result<Self, ConstructionError> {
        let ClientBuild {
            id,
            url,
            parameters,
            config,
            bind,
            io,
            events,
        } = request;

        let parsed = Url::parse(&url).map_err(|err| ConstructionError::InvalidUrl {
            url: url.clone(),
            reason: err.to_string(),
        })?;
        match parsed.scheme() {
            "https" | "quic-transport" => {}
            other => {
                return Err(ConstructionError::UnsupportedScheme {
                    scheme: other.to_owned(),
                });
            }
        }
        let host = match parsed.host() {
            Some(Host::Domain(domain)) if !domain.is_empty() => domain.to_owned(),
            Some(Host::Ipv4(ip)) => ip.to_string(),
            Some(Host::Ipv6(ip)) => ip.to_string(),
            _ => return Err(ConstructionError::MissingHost { url }),
        };
        let port = parsed.port_or_known_default().unwrap_or(443);
        // `url` 只为特殊 scheme 产出元组源；`quic-transport` 需按 scheme://host:port 手工拼装。
        let origin = match parsed.scheme() {
            "quic-transport" => match parsed.host() {
                Some(Host::Ipv6(ip)) => format!("quic-transport://[{ip}]:{port}"),
                _ => format!("quic-transport://{host}:{port}"),
            },
            _ => parsed.origin().ascii_serialization(),
        };

        let client_config =
            tls::client_config(&parameters.server_certificate_fingerprints, &config)?;
        let mut endpoint =
            Endpoint::client(bind).map_err(|source| ConstructionError::Endpoint { source })?;
        endpoint.set_default_client_config(client_config);

        tracing::debug!(client_id = id, url = %parsed, pinned = !parameters.server_certificate_fingerprints.is_empty(), "quic client constructed");
        Ok(Self {
            id,
            url: parsed,
            origin,
            host,
            port,
            parameters,
            endpoint,
            constructed_on: thread::current().id(),
            io,
            events,
            shared: Arc::new(ClientShared::default()),
        })
    }

    /// 工厂内按构造顺序分配的标识。
    pub fn id(&self) -> u64 {
        self.id
    }

    /// 目标 URL。
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// 由 URL 推导出的源（origin）。
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// 构造参数。
    pub fn parameters(&self) -> &ClientParameters {
        &self.parameters
    }

    /// 本地端点地址。
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint.local_addr().ok()
    }

    /// 是否存在已建立的连接。
    pub fn is_connected(&self) -> bool {
        self.shared.connection.lock().is_some()
    }

    /// 已连接时的对端地址。
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.shared
            .connection
            .lock()
            .as_ref()
            .map(Connection::remote_address)
    }

    /// 注册事件回调，替换之前的回调。
    pub fn set_visitor(&self, visitor: Arc<dyn ClientVisitor>) {
        *self.shared.visitor.write() = Some(visitor);
    }

    pub(crate) fn constructed_on(&self) -> ThreadId {
        self.constructed_on
    }

    /// 发起连接；结果经 [`ClientVisitor`] 回调。
    ///
    /// 已连接或正在连接时直接返回 `Ok(())`。
    pub fn connect(&self) -> Result<(), FactoryError> {
        if self.is_connected() || self.shared.connecting.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let endpoint = self.endpoint.clone();
        let host = self.host.clone();
        let port = self.port;
        let client_id = self.id;
        let shared = Arc::clone(&self.shared);
        let events = self.events.share();

        let spawned = self.io.spawn(async move {
            let outcome = establish(&endpoint, &host, port).await;
            shared.connecting.store(false, Ordering::Release);
            match outcome {
                Ok(connection) => {
                    tracing::info!(client_id, remote = %connection.remote_address(), "quic client connected");
                    *shared.connection.lock() = Some(connection.clone());
                    dispatch(&shared, &events, |visitor| visitor.on_connected());
                    tokio::spawn(watch_connection(client_id, connection, shared, events));
                }
                Err(err) => {
                    tracing::warn!(client_id, host = %host, port, error.code = err.code(), error = %err, "quic client connection failed");
                    dispatch(&shared, &events, move |visitor| {
                        visitor.on_connection_failed(err)
                    });
                }
            }
        });
        if spawned.is_err() {
            self.shared.connecting.store(false, Ordering::Release);
        }
        spawned
    }

    /// 关闭连接；`on_closed` 在连接真正关闭后投递。
    pub fn close(&self) -> Result<(), FactoryError> {
        let shared = Arc::clone(&self.shared);
        self.io.post(move || {
            if let Some(connection) = shared.connection.lock().as_ref() {
                connection.close(VarInt::from_u32(0), b"client closed");
            }
        })
    }
}

impl Drop for QuicClient {
    fn drop(&mut self) {
        let connection = self.shared.connection.lock().take();
        let endpoint = self.endpoint.clone();
        let teardown = move || {
            if let Some(connection) = connection {
                connection.close(VarInt::from_u32(0), b"client dropped");
            }
            endpoint.close(VarInt::from_u32(0), b"client dropped");
        };
        if self.io.is_current() {
            teardown();
            return;
        }
        // 队列已关闭时闭包随错误一同被丢弃，端点由 quinn 在最后一个引用释放时回收。
        if self.io.post(teardown).is_err() {
            tracing::debug!(client_id = self.id, "io context gone, client endpoint released in place");
        }
    }
}

impl fmt::Debug for QuicClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuicClient")
            .field("id", &self.id)
            .field("url", &self.url.as_str())
            .field("origin", &self.origin)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

async fn establish(endpoint: &Endpoint, host: &str, port: u16) -> Result<Connection, ClientError> {
    let resolve_error = |reason: String| ClientError::Resolve {
        host: host.to_owned(),
        reason,
    };
    let candidates: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|err| resolve_error(err.to_string()))?
        .collect();
    let local_is_ipv4 = endpoint
        .local_addr()
        .map(|addr| addr.is_ipv4())
        .unwrap_or(true);
    let target = candidates
        .iter()
        .find(|addr| addr.is_ipv4() == local_is_ipv4)
        .or_else(|| candidates.first())
        .copied()
        .ok_or_else(|| resolve_error("no addresses returned".to_owned()))?;

    let connecting = endpoint
        .connect(target, host)
        .map_err(|err| ClientError::Connect {
            reason: err.to_string(),
        })?;
    connecting.await.map_err(|err| ClientError::Connection {
        reason: err.to_string(),
    })
}

async fn watch_connection(
    client_id: u64,
    connection: Connection,
    shared: Arc<ClientShared>,
    events: ExecutionContext,
) {
    let reason = connection.closed().await;
    {
        let mut slot = shared.connection.lock();
        if slot
            .as_ref()
            .is_some_and(|current| current.stable_id() == connection.stable_id())
        {
            *slot = None;
        }
    }
    tracing::info!(client_id, %reason, "quic client connection closed");
    dispatch(&shared, &events, |visitor| visitor.on_closed());
}

fn dispatch<F>(shared: &ClientShared, events: &ExecutionContext, callback: F)
where
    F: FnOnce(&dyn ClientVisitor) + Send + 'static,
{
    let Some(visitor) = shared.visitor.read().clone() else {
        return;
    };
    if let Err(err) = events.post(move || callback(visitor.as_ref())) {
        tracing::debug!(error = %err, "client event dropped, event context unavailable");
    }
}
