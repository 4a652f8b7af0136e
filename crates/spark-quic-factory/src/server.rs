use std::{
    fmt,
    net::{IpAddr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use quinn::{Connection, Endpoint, VarInt};

use crate::{
    config::FactoryConfig,
    context::ExecutionContext,
    credential::ServerCredentials,
    error::{ConstructionError, FactoryError},
    fingerprint::CertificateFingerprint,
    handoff,
    registry::ServerId,
    tls,
};

/// 服务端事件回调，始终在事件执行上下文上调用。
pub trait ServerVisitor: Send + Sync + 'static {
    /// 新会话完成握手。
    fn on_session(&self, _session: SessionInfo) {}

    /// 会话关闭（任意一方发起）。
    fn on_session_closed(&self, _session_id: u64) {}
}

/// 已建立会话的描述信息。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionInfo {
    /// 服务端内单调递增的会话编号。
    pub session_id: u64,
    /// 对端地址。
    pub remote_addr: SocketAddr,
    /// 协商出的 ALPN 协议。
    pub alpn: Option<Vec<u8>>,
}

/// 绑定在工厂两个执行上下文上的 QUIC 服务端。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 服务端对象的构造不要求线程亲和：构造时只持有凭据与上下文引用，
///   真正的 UDP 端点在 [`QuicServer::start`] 时才在 I/O 上下文上绑定（惰性注册）；
/// - 证书凭据由服务端独占持有，随服务端销毁。
///
/// ## 逻辑（How）
/// - `start` 经 [`handoff::run_on`] 在 I/O 线程上创建 `quinn::Endpoint` 并派生接入循环；
/// - 接入循环为每个连接分配会话编号、登记到 `DashMap`，并把 `on_session` 投递到事件上下文；
/// - 连接关闭后移除登记并投递 `on_session_closed`。
///
/// ## 契约（What）
/// - `start` 只能成功一次，重复调用返回 [`FactoryError::AlreadyStarted`]；
/// - `stop` 幂等，关闭端点与全部会话；`Drop` 时自动调用；
/// - 服务端不得比其绑定的执行上下文活得更久，工厂在停机前会先释放全部已登记服务端。
pub struct QuicServer {
    id: ServerId,
    port: u16,
    bind_ip: IpAddr,
    credentials: ServerCredentials,
    config: Arc<FactoryConfig>,
    io: ExecutionContext,
    events: ExecutionContext,
    shared: Arc<ServerShared>,
}

#[derive(Default)]
struct ServerShared {
    started: AtomicBool,
    endpoint: Mutex<Option<Endpoint>>,
    local_addr: Mutex<Option<SocketAddr>>,
    sessions: DashMap<u64, Connection>,
    next_session: AtomicU64,
    visitor: RwLock<Option<Arc<dyn ServerVisitor>>>,
}

impl QuicServer {
    pub(crate) fn new(
        id: ServerId,
        port: u16,
        bind_ip: IpAddr,
        credentials: ServerCredentials,
        config: Arc<FactoryConfig>,
        io: ExecutionContext,
        events: ExecutionContext,
    ) -> Self {
        Self {
            id,
            port,
            bind_ip,
            credentials,
            config,
            io,
            events,
            shared: Arc::new(ServerShared::default()),
        }
    }

    /// 服务端标识。
    pub fn id(&self) -> ServerId {
        self.id
    }

    /// 请求监听的端口；`0` 表示由系统分配。
    pub fn port(&self) -> u16 {
        self.port
    }

    /// 终端实体证书指纹，可直接交给客户端做固定证书校验。
    pub fn fingerprint(&self) -> &CertificateFingerprint {
        self.credentials.fingerprint()
    }

    /// 服务端凭据。
    pub fn credentials(&self) -> &ServerCredentials {
        &self.credentials
    }

    /// 注册事件回调，替换之前的回调。
    pub fn set_visitor(&self, visitor: Arc<dyn ServerVisitor>) {
        *self.shared.visitor.write() = Some(visitor);
    }

    /// 是否已成功启动。
    pub fn is_started(&self) -> bool {
        self.shared.endpoint.lock().is_some()
    }

    /// 实际绑定的地址，仅在启动后可用。
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.shared.local_addr.lock()
    }

    /// 当前活跃会话数。
    pub fn session_count(&self) -> usize {
        self.shared.sessions.len()
    }

    /// 在 I/O 上下文上绑定端点并开始接入连接，返回实际绑定地址。
    pub fn start(&self) -> Result<SocketAddr, FactoryError> {
        if self.shared.started.swap(true, Ordering::AcqRel) {
            return Err(FactoryError::AlreadyStarted { id: self.id.get() });
        }
        let outcome = self.bind();
        if outcome.is_err() {
            self.shared.started.store(false, Ordering::Release);
        }
        outcome
    }

    fn bind(&self) -> Result<SocketAddr, FactoryError> {
        let server_config = tls::server_config(&self.credentials, &self.config)
            .map_err(|reason| FactoryError::from(ConstructionError::Tls { reason }))?;
        let addr = SocketAddr::new(self.bind_ip, self.port);
        let id = self.id;
        let shared = Arc::clone(&self.shared);
        let events = self.events.share();

        let bound = handoff::run_on(&self.io, move || -> Result<SocketAddr, String> {
            let endpoint = Endpoint::server(server_config, addr).map_err(|err| err.to_string())?;
            let local = endpoint.local_addr().map_err(|err| err.to_string())?;
            *shared.endpoint.lock() = Some(endpoint.clone());
            tokio::spawn(accept_loop(id, endpoint, shared, events));
            Ok(local)
        })?;

        match bound {
            Ok(local) => {
                *self.shared.local_addr.lock() = Some(local);
                tracing::info!(server_id = %self.id, addr = %local, "quic server listening");
                Ok(local)
            }
            Err(reason) => {
                tracing::error!(server_id = %self.id, addr = %addr, %reason, "quic server bind failed");
                Err(FactoryError::Bind {
                    addr: addr.to_string(),
                    reason,
                })
            }
        }
    }

    /// 关闭端点与全部会话。
    pub fn stop(&self) {
        let Some(endpoint) = self.shared.endpoint.lock().take() else {
            return;
        };
        for session in self.shared.sessions.iter() {
            session.value().close(VarInt::from_u32(0), b"server stopped");
        }
        self.shared.sessions.clear();
        endpoint.close(VarInt::from_u32(0), b"server stopped");
        tracing::info!(server_id = %self.id, "quic server stopped");
    }
}

impl Drop for QuicServer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for QuicServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuicServer")
            .field("id", &self.id)
            .field("port", &self.port)
            .field("local_addr", &self.local_addr())
            .field("credentials", &self.credentials)
            .finish_non_exhaustive()
    }
}

async fn accept_loop(
    id: ServerId,
    endpoint: Endpoint,
    shared: Arc<ServerShared>,
    events: ExecutionContext,
) {
    while let Some(incoming) = endpoint.accept().await {
        let shared = Arc::clone(&shared);
        let events = events.share();
        tokio::spawn(async move {
            match incoming.await {
                Ok(connection) => track_session(id, connection, shared, events).await,
                Err(err) => {
                    tracing::debug!(server_id = %id, error = %err, "incoming handshake failed");
                }
            }
        });
    }
    tracing::debug!(server_id = %id, "accept loop finished");
}

async fn track_session(
    id: ServerId,
    connection: Connection,
    shared: Arc<ServerShared>,
    events: ExecutionContext,
) {
    let session_id = shared.next_session.fetch_add(1, Ordering::Relaxed);
    let info = SessionInfo {
        session_id,
        remote_addr: connection.remote_address(),
        alpn: negotiated_alpn(&connection),
    };
    shared.sessions.insert(session_id, connection.clone());
    tracing::debug!(server_id = %id, session_id, remote = %info.remote_addr, "session established");
    dispatch(&shared, &events, move |visitor| visitor.on_session(info));

    let reason = connection.closed().await;
    shared.sessions.remove(&session_id);
    tracing::debug!(server_id = %id, session_id, %reason, "session closed");
    dispatch(&shared, &events, move |visitor| visitor.on_session_closed(session_id));
}

fn negotiated_alpn(connection: &Connection) -> Option<Vec<u8>> {
    connection
        .handshake_data()?
        .downcast::<quinn::crypto::rustls::HandshakeData>()
        .ok()?
        .protocol
}

fn dispatch<F>(shared: &ServerShared, events: &ExecutionContext, callback: F)
where
    F: FnOnce(&dyn ServerVisitor) + Send + 'static,
{
    let Some(visitor) = shared.visitor.read().clone() else {
        return;
    };
    if let Err(err) = events.post(move || callback(visitor.as_ref())) {
        tracing::debug!(error = %err, "server event dropped, event context unavailable");
    }
}
