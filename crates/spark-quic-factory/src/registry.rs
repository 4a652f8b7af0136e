//! # registry：服务端登记簿
//!
//! ## 核心意图（Why）
//! - 服务端由工厂独占拥有，调用方只持有不透明句柄；释放时按标识查表，而不是把句柄强转回对象指针；
//! - 以 `DashMap` 承载并发登记与释放，多个线程同时创建/释放服务端无需全局锁。
//!
//! ## 行为契约（What）
//! - `register`：分配单调递增的 [`ServerId`] 并插入条目，返回弱引用句柄；
//! - `remove`：原子移除并返回服务端所有权，重复移除返回 `None`；
//! - `drain`：停机时一次性取走全部服务端。
//!
//! ## 风险提示（Trade-offs）
//! - 句柄只持有弱引用，服务端释放后所有操作返回 [`FactoryError::ServerReleased`]；
//!   句柄临时升级得到的强引用会短暂延长服务端寿命，但端点在释放时已被显式关闭。

use std::{
    fmt,
    net::SocketAddr,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use dashmap::DashMap;

use crate::{
    error::FactoryError,
    fingerprint::CertificateFingerprint,
    server::{QuicServer, ServerVisitor},
};

/// 服务端标识，在所属工厂内唯一。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerId(u64);

impl ServerId {
    /// 数值形式。
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 工厂签发的服务端句柄。
///
/// # 教案式注释
/// - **意图 (Why)**：调用方需要操作服务端（启动、注册回调），但不能拥有它；
/// - **契约 (What)**：不可克隆；记录签发工厂的标识，交给其他工厂释放会被拒绝；
///   服务端释放后任何操作返回 [`FactoryError::ServerReleased`]。
pub struct ServerHandle {
    id: ServerId,
    factory_id: u64,
    server: Weak<QuicServer>,
}

impl ServerHandle {
    /// 服务端标识。
    pub fn id(&self) -> ServerId {
        self.id
    }

    /// 签发该句柄的工厂标识。
    pub fn factory_id(&self) -> u64 {
        self.factory_id
    }

    /// 服务端是否仍然存活。
    pub fn is_alive(&self) -> bool {
        self.server.strong_count() > 0
    }

    /// 启动服务端，返回实际绑定地址。
    pub fn start(&self) -> Result<SocketAddr, FactoryError> {
        self.upgrade()?.start()
    }

    /// 停止服务端但保留登记，句柄仍需交还工厂释放。
    pub fn stop(&self) -> Result<(), FactoryError> {
        self.upgrade()?.stop();
        Ok(())
    }

    /// 注册事件回调。
    pub fn set_visitor(&self, visitor: Arc<dyn ServerVisitor>) -> Result<(), FactoryError> {
        self.upgrade()?.set_visitor(visitor);
        Ok(())
    }

    /// 实际绑定地址；未启动时为 `None`。
    pub fn local_addr(&self) -> Result<Option<SocketAddr>, FactoryError> {
        Ok(self.upgrade()?.local_addr())
    }

    /// 当前活跃会话数。
    pub fn session_count(&self) -> Result<usize, FactoryError> {
        Ok(self.upgrade()?.session_count())
    }

    /// 服务端证书指纹。
    pub fn fingerprint(&self) -> Result<CertificateFingerprint, FactoryError> {
        Ok(self.upgrade()?.fingerprint().clone())
    }

    fn upgrade(&self) -> Result<Arc<QuicServer>, FactoryError> {
        self.server.upgrade().ok_or(FactoryError::ServerReleased {
            id: self.id.get(),
        })
    }
}

impl fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerHandle")
            .field("id", &self.id)
            .field("factory_id", &self.factory_id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// 服务端登记簿。
#[derive(Debug, Default)]
pub(crate) struct ServerRegistry {
    servers: DashMap<ServerId, Arc<QuicServer>>,
    next_id: AtomicU64,
}

impl ServerRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// 分配标识、构造服务端并登记，返回签发给调用方的句柄。
    pub(crate) fn register<F>(&self, factory_id: u64, build: F) -> ServerHandle
    where
        F: FnOnce(ServerId) -> QuicServer,
    {
        let id = ServerId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let server = Arc::new(build(id));
        let handle = ServerHandle {
            id,
            factory_id,
            server: Arc::downgrade(&server),
        };
        self.servers.insert(id, server);
        handle
    }

    pub(crate) fn remove(&self, id: ServerId) -> Option<Arc<QuicServer>> {
        self.servers.remove(&id).map(|(_, server)| server)
    }

    /// 取走全部已登记服务端，按标识升序返回。
    pub(crate) fn drain(&self) -> Vec<Arc<QuicServer>> {
        let mut ids: Vec<ServerId> = self.servers.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.servers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::FactoryConfig,
        context::{ContextOptions, ExecutionContext},
        credential::CredentialProvider,
    };
    use std::fs;

    #[test]
    fn handles_lose_access_once_the_server_is_removed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let generated =
            rcgen::generate_simple_self_signed(vec!["localhost".into()]).expect("rcgen");
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        fs::write(&cert, generated.cert.pem()).expect("write cert");
        fs::write(&key, generated.key_pair.serialize_pem()).expect("write key");

        let io = ExecutionContext::start(ContextOptions::named("registry-io")).expect("io");
        let events =
            ExecutionContext::start(ContextOptions::named("registry-events")).expect("events");
        let config = Arc::new(FactoryConfig::default());
        let registry = ServerRegistry::new();

        let handles: Vec<ServerHandle> = (0..3)
            .map(|_| {
                let credentials = CredentialProvider::pem(&cert, &key)
                    .initialize()
                    .expect("credentials");
                registry.register(7, |id| {
                    QuicServer::new(
                        id,
                        0,
                        "127.0.0.1".parse().expect("ip"),
                        credentials,
                        Arc::clone(&config),
                        io.share(),
                        events.share(),
                    )
                })
            })
            .collect();
        assert_eq!(registry.len(), 3);
        assert!(handles.iter().all(|handle| handle.factory_id() == 7));

        assert!(registry.remove(handles[1].id()).is_some());
        assert!(registry.remove(handles[1].id()).is_none());
        assert!(matches!(
            handles[1].session_count(),
            Err(FactoryError::ServerReleased { .. })
        ));

        let drained: Vec<ServerId> = registry.drain().iter().map(|server| server.id()).collect();
        assert_eq!(drained, vec![handles[0].id(), handles[2].id()]);
        assert_eq!(registry.len(), 0);

        events.stop();
        io.stop();
    }
}
