//! # factory：传输工厂
//!
//! ## 意图（Why）
//! - 宿主只需要一个同步入口来创建 QUIC 服务端与客户端，而不必关心引擎对象的线程亲和；
//! - 工厂独占两个执行上下文（I/O 与事件）以及全部服务端对象的所有权，统一管理它们的销毁顺序。
//!
//! ## 逻辑（How）
//! - 服务端：在调用线程上初始化凭据，直接构造 [`QuicServer`] 并登记，返回弱引用句柄；
//! - 客户端：经 [`handoff::construct_on`] 把构造闭包投递到 I/O 上下文，阻塞等待结果；
//! - 停机：状态切到 `ShuttingDown` 使新的创建请求立即失败，等待在途创建完成，
//!   释放全部仍登记的服务端，再依次停止事件与 I/O 上下文。
//!
//! ## 契约（What）
//! - 所有公开操作以 `Result` 返回，不会跨越工厂边界 panic；
//! - 凭据初始化失败只影响本次调用，工厂保持可用；
//! - 停机幂等，`Drop` 时自动执行；停机后的任何创建请求返回 `ContextUnavailable`。
//!
//! ## 风险（Trade-offs）
//! - 停机会等待在途创建调用返回；若有调用在事件回调中阻塞等待 I/O 上下文，请勿在同一回调内停机。

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU8, AtomicU64, Ordering},
    },
};

use parking_lot::{RwLock, RwLockReadGuard};

use crate::{
    bootstrap,
    client::{ClientBuild, ClientHandle, ClientParameters, QuicClient},
    config::FactoryConfig,
    context::{ContextOptions, ExecutionContext},
    credential::CredentialProvider,
    error::FactoryError,
    handoff,
    registry::{ServerHandle, ServerRegistry},
    server::QuicServer,
};

static NEXT_FACTORY_ID: AtomicU64 = AtomicU64::new(1);

/// 工厂生命周期状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FactoryState {
    /// 接受创建请求。
    Running = 0,
    /// 停机进行中，拒绝新的创建请求。
    ShuttingDown = 1,
    /// 两个执行上下文均已停止。
    Terminated = 2,
}

impl FactoryState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => FactoryState::Running,
            1 => FactoryState::ShuttingDown,
            _ => FactoryState::Terminated,
        }
    }
}

/// QUIC 传输工厂。
pub struct TransportFactory {
    id: u64,
    config: Arc<FactoryConfig>,
    io: ExecutionContext,
    events: ExecutionContext,
    registry: ServerRegistry,
    state: AtomicU8,
    // 创建调用持读锁，停机持写锁，以此等待在途创建完成。
    gate: RwLock<()>,
    next_client_id: Arc<AtomicU64>,
}

impl TransportFactory {
    /// 安装进程级默认设置后以默认配置构造工厂。
    pub fn create() -> Result<Self, FactoryError> {
        bootstrap::initialize_process_defaults();
        Self::new(FactoryConfig::default())
    }

    /// 从 TOML 配置文件构造工厂，不触碰进程级设置。
    pub fn with_config_file(path: impl AsRef<Path>) -> Result<Self, FactoryError> {
        Self::new(FactoryConfig::from_path(path)?)
    }

    /// 以给定配置构造工厂并启动两个执行上下文。
    ///
    /// - **后置条件**：返回时 I/O 与事件上下文均已在运行；
    /// - **失败**：配置非法返回 `Config`；任一上下文启动失败返回 `ContextSpawn`，已启动的上下文会被停止。
    pub fn new(config: FactoryConfig) -> Result<Self, FactoryError> {
        config.validate()?;
        let io = ExecutionContext::start(ContextOptions {
            name: config.io_thread_name.clone(),
            stack_size: config.thread_stack_size,
        })?;
        let events = match ExecutionContext::start(ContextOptions {
            name: config.event_thread_name.clone(),
            stack_size: config.thread_stack_size,
        }) {
            Ok(events) => events,
            Err(err) => {
                io.stop();
                return Err(err);
            }
        };

        let id = NEXT_FACTORY_ID.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            factory_id = id,
            io = %io.name(),
            events = %events.name(),
            "transport factory running"
        );
        Ok(Self {
            id,
            config: Arc::new(config),
            io,
            events,
            registry: ServerRegistry::new(),
            state: AtomicU8::new(FactoryState::Running as u8),
            gate: RwLock::new(()),
            next_client_id: Arc::new(AtomicU64::new(0)),
        })
    }

    /// 工厂标识，用于识别外来句柄。
    pub fn id(&self) -> u64 {
        self.id
    }

    /// 工厂配置。
    pub fn config(&self) -> &FactoryConfig {
        &self.config
    }

    /// 当前生命周期状态。
    pub fn state(&self) -> FactoryState {
        FactoryState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// 是否接受创建请求。
    pub fn is_running(&self) -> bool {
        self.state() == FactoryState::Running
    }

    /// I/O 执行上下文。
    pub fn io_context(&self) -> &ExecutionContext {
        &self.io
    }

    /// 事件执行上下文。
    pub fn event_context(&self) -> &ExecutionContext {
        &self.events
    }

    /// 当前登记的服务端数量。
    pub fn server_count(&self) -> usize {
        self.registry.len()
    }

    /// 以 PEM 证书链与私钥创建服务端。
    pub fn create_server_from_pem(
        &self,
        port: u16,
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
    ) -> Result<ServerHandle, FactoryError> {
        self.create_server(port, CredentialProvider::pem(cert_path, key_path))
    }

    /// 以带密码的 PKCS#12 证书包创建服务端。
    pub fn create_server_from_pkcs12(
        &self,
        port: u16,
        bundle_path: impl Into<PathBuf>,
        password: impl Into<String>,
    ) -> Result<ServerHandle, FactoryError> {
        self.create_server(port, CredentialProvider::pkcs12(bundle_path, password))
    }

    /// 以任意凭据供给者创建服务端。
    ///
    /// # 契约（What）
    /// - 凭据在调用线程上同步初始化；失败记录 ERROR 日志并返回 [`FactoryError::Credential`]，工厂保持可用；
    /// - 成功时服务端已登记但尚未绑定端口，需调用 [`ServerHandle::start`]。
    pub fn create_server(
        &self,
        port: u16,
        provider: CredentialProvider,
    ) -> Result<ServerHandle, FactoryError> {
        let _gate = self.enter()?;
        let source = provider.source();
        let credentials = provider.initialize().map_err(|err| {
            tracing::error!(
                factory_id = self.id,
                port,
                source = ?source,
                error.code = err.code(),
                error = %err,
                "failed to initialize server credentials"
            );
            FactoryError::from(err)
        })?;
        let bind_ip = self.config.server_bind_ip()?;

        let handle = self.registry.register(self.id, |id| {
            QuicServer::new(
                id,
                port,
                bind_ip,
                credentials,
                Arc::clone(&self.config),
                self.io.share(),
                self.events.share(),
            )
        });
        tracing::info!(
            factory_id = self.id,
            server_id = %handle.id(),
            port,
            source = ?source,
            "quic server created"
        );
        Ok(handle)
    }

    /// 以默认参数创建客户端。
    pub fn create_client(&self, url: impl Into<String>) -> Result<ClientHandle, FactoryError> {
        self.create_client_with_parameters(url, ClientParameters::default())
    }

    /// 在 I/O 上下文上构造客户端并阻塞等待结果。
    pub fn create_client_with_parameters(
        &self,
        url: impl Into<String>,
        parameters: ClientParameters,
    ) -> Result<ClientHandle, FactoryError> {
        let _gate = self.enter()?;
        let url = url.into();
        let bind = self.config.client_bind_socket()?;
        let request_url = url.clone();
        let config = Arc::clone(&self.config);
        let io = self.io.share();
        let events = self.events.share();
        let next_client_id = Arc::clone(&self.next_client_id);

        let outcome = handoff::construct_on(&self.io, move || {
            QuicClient::build(ClientBuild {
                id: next_client_id.fetch_add(1, Ordering::Relaxed),
                url: request_url,
                parameters,
                config,
                bind,
                io,
                events,
            })
        });
        match outcome {
            Ok(client) => {
                tracing::debug!(factory_id = self.id, client_id = client.id(), url = %url, "quic client created");
                Ok(Arc::new(client))
            }
            Err(err) => {
                tracing::warn!(
                    factory_id = self.id,
                    url = %url,
                    error.code = err.code(),
                    error = %err,
                    "quic client construction failed"
                );
                Err(err)
            }
        }
    }

    /// 释放服务端：从登记簿移除并销毁，销毁时关闭端点。
    ///
    /// 外来句柄与重复释放属于调用契约违例，记录 ERROR 日志后返回错误。
    pub fn release_server(&self, handle: &ServerHandle) -> Result<(), FactoryError> {
        if handle.factory_id() != self.id {
            let err = FactoryError::ForeignHandle {
                id: handle.id().get(),
                issuer: handle.factory_id(),
                factory: self.id,
            };
            tracing::error!(factory_id = self.id, server_id = %handle.id(), error.code = err.code(), "contract violation: {err}");
            return Err(err);
        }
        let Some(server) = self.registry.remove(handle.id()) else {
            let err = FactoryError::ServerNotFound {
                id: handle.id().get(),
            };
            tracing::error!(factory_id = self.id, server_id = %handle.id(), error.code = err.code(), "contract violation: {err}");
            return Err(err);
        };
        server.stop();
        drop(server);
        tracing::info!(factory_id = self.id, server_id = %handle.id(), "quic server released");
        Ok(())
    }

    /// 停机：拒绝新请求、等待在途创建、释放遗留服务端并停止两个上下文。幂等。
    pub fn shutdown(&self) {
        if self
            .state
            .compare_exchange(
                FactoryState::Running as u8,
                FactoryState::ShuttingDown as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }
        tracing::info!(factory_id = self.id, "transport factory shutting down");
        let _exclusive = self.gate.write();

        for server in self.registry.drain() {
            tracing::warn!(
                factory_id = self.id,
                server_id = %server.id(),
                port = server.port(),
                "server handle leaked, releasing during shutdown"
            );
            server.stop();
        }
        self.events.stop();
        self.io.stop();

        self.state
            .store(FactoryState::Terminated as u8, Ordering::Release);
        tracing::info!(factory_id = self.id, "transport factory terminated");
    }

    fn enter(&self) -> Result<RwLockReadGuard<'_, ()>, FactoryError> {
        self.ensure_running()?;
        let guard = self.gate.read();
        self.ensure_running()?;
        Ok(guard)
    }

    fn ensure_running(&self) -> Result<(), FactoryError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(FactoryError::ContextUnavailable {
                context: self.io.name().to_owned(),
            })
        }
    }
}

impl Drop for TransportFactory {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for TransportFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportFactory")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("io", &self.io)
            .field("events", &self.events)
            .field("servers", &self.registry.len())
            .finish()
    }
}
