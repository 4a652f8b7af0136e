#![doc = r#"
# spark-quic-factory

## 设计动机（Why）
- **线程亲和**：QUIC 端点必须在其归属的运行时线程上创建与驱动；工厂托管两个命名后台执行上下文
  （`quic_transport_io_thread` 与 `quic_transport_event_thread`），调用方线程只负责发起请求。
- **同步嵌入面**：宿主以“调用/返回”的方式创建服务端与客户端，跨线程构造被收敛为阻塞交接原语。
- **证书来源无关**：PEM 证书链与 PKCS#12 证书包经同一个供给者初始化为等价的服务端凭据。

## 核心契约（What）
- `TransportFactory`：创建/释放服务端、创建客户端、有序停机。
- `ExecutionContext`：单工作线程 + FIFO 任务队列 + current-thread Tokio 运行时。
- `handoff::construct_on`：在目标上下文上构造对象并阻塞等待结果，失败原样带回。
- `CredentialProvider`：`Pem` / `Pkcs12` 两变体，`initialize` 消费自身产出 `ServerCredentials`。
- `ServerHandle` / `ClientHandle`：服务端由工厂登记簿拥有，调用方只持有弱引用句柄；客户端由调用方持有。

## 实现策略（How）
- 执行上下文以 `tokio::sync::mpsc` 无界队列承载闭包，闭包在运行时内执行，可直接创建 `quinn::Endpoint`；
- 完成单元基于 `parking_lot::{Mutex, Condvar}`，写端销毁时自动写入 `Abandoned`，调用方不会永久挂起；
- TLS 装配只启用 TLS 1.3；客户端配置指纹时以 SHA-256 固定证书校验替代 WebPKI 链校验；
- 进程级默认设置（日志订阅器、rustls 加密后端）由 `bootstrap::initialize_process_defaults` 显式安装。

## 风险与注意（Trade-offs）
- 阻塞交接没有超时与取消，构造闭包必须短小有界；
- 在目标上下文自身的工作线程上发起阻塞交接会返回 `ReentrantCall`，不会死锁但也不会执行；
- 工厂停机后继续使用遗留的客户端句柄属于调用契约违例，所有操作返回 `ContextUnavailable`。
"#]

pub mod bootstrap;
pub mod client;
pub mod config;
pub mod context;
pub mod credential;
pub mod error;
pub mod factory;
pub mod fingerprint;
pub mod handoff;
pub mod registry;
pub mod server;
mod tls;

pub use bootstrap::{ProcessDefaults, initialize_process_defaults};
pub use client::{ClientHandle, ClientParameters, ClientVisitor, QuicClient};
pub use config::{CongestionController, FactoryConfig, TransportSettings};
pub use context::{ContextOptions, ExecutionContext};
pub use credential::{CredentialProvider, CredentialSource, ServerCredentials};
pub use error::{ClientError, ConstructionError, CredentialError, FactoryError};
pub use factory::{FactoryState, TransportFactory};
pub use fingerprint::{CertificateFingerprint, FingerprintAlgorithm};
pub use registry::{ServerHandle, ServerId};
pub use server::{QuicServer, ServerVisitor, SessionInfo};
