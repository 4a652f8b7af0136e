//! 集成测试共享夹具：自签名证书、PFX 证书包与回调收集器。

#![allow(dead_code)]

use std::{
    fs,
    path::PathBuf,
    sync::{Mutex, mpsc},
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use p12_keystore::{Certificate, KeyStore, KeyStoreEntry, PrivateKeyChain};
use spark_quic_factory::{
    ClientError, ClientVisitor, FactoryConfig, ServerVisitor, SessionInfo, TransportFactory,
};
use tempfile::TempDir;

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

/// 写入临时目录的一组证书材料。
pub struct CertificateFiles {
    pub dir: TempDir,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub cert_der: Vec<u8>,
    pub key_der: Vec<u8>,
}

impl CertificateFiles {
    /// 生成 `localhost` 自签名证书并以 PEM 写盘。
    pub fn generate() -> Result<Self> {
        let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_owned()])?;
        let dir = tempfile::tempdir()?;
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        fs::write(&cert_path, generated.cert.pem())?;
        fs::write(&key_path, generated.key_pair.serialize_pem())?;
        Ok(Self {
            cert_der: generated.cert.der().to_vec(),
            key_der: generated.key_pair.serialize_der(),
            dir,
            cert_path,
            key_path,
        })
    }

    /// 把 PEM 材料打包为带密码的 PKCS#12 证书包。
    pub fn write_pkcs12(&self, password: &str) -> Result<PathBuf> {
        let certificate = Certificate::from_der(&self.cert_der)
            .map_err(|err| anyhow!("certificate rejected by keystore: {err}"))?;
        let chain = PrivateKeyChain::new(&self.key_der, b"spark-quic-factory", [certificate]);
        let mut keystore = KeyStore::new();
        keystore.add_entry("server", KeyStoreEntry::PrivateKeyChain(chain));
        let bundle = keystore
            .writer(password)
            .write()
            .map_err(|err| anyhow!("cannot encode pkcs#12 bundle: {err}"))?;

        let path = self.dir.path().join("bundle.pfx");
        fs::write(&path, bundle).context("write bundle")?;
        Ok(path)
    }

    /// 在同目录写入任意内容的附加文件。
    pub fn write_extra(&self, name: &str, contents: impl AsRef<[u8]>) -> Result<PathBuf> {
        let path = self.dir.path().join(name);
        fs::write(&path, contents)?;
        Ok(path)
    }
}

/// 仅绑定回环地址的工厂。
pub fn loopback_factory() -> Result<TransportFactory> {
    let config = FactoryConfig {
        server_bind_host: "127.0.0.1".to_owned(),
        client_bind_addr: "127.0.0.1:0".to_owned(),
        ..FactoryConfig::default()
    };
    Ok(TransportFactory::new(config)?)
}

/// 回调事件，附带执行回调的线程名。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Session { info: SessionInfo, thread: String },
    SessionClosed { session_id: u64, thread: String },
    Connected { thread: String },
    ConnectionFailed { error: ClientError, thread: String },
    Closed { thread: String },
}

/// 把回调转发到通道的收集器，同时实现服务端与客户端回调。
pub struct Recorder {
    sender: Mutex<mpsc::Sender<Event>>,
}

impl Recorder {
    pub fn new() -> (Self, mpsc::Receiver<Event>) {
        let (sender, receiver) = mpsc::channel();
        (
            Self {
                sender: Mutex::new(sender),
            },
            receiver,
        )
    }

    fn record(&self, event: Event) {
        if let Ok(sender) = self.sender.lock() {
            let _ = sender.send(event);
        }
    }
}

fn thread_name() -> String {
    std::thread::current()
        .name()
        .unwrap_or("<unnamed>")
        .to_owned()
}

impl ServerVisitor for Recorder {
    fn on_session(&self, info: SessionInfo) {
        self.record(Event::Session {
            info,
            thread: thread_name(),
        });
    }

    fn on_session_closed(&self, session_id: u64) {
        self.record(Event::SessionClosed {
            session_id,
            thread: thread_name(),
        });
    }
}

impl ClientVisitor for Recorder {
    fn on_connected(&self) {
        self.record(Event::Connected {
            thread: thread_name(),
        });
    }

    fn on_connection_failed(&self, error: ClientError) {
        self.record(Event::ConnectionFailed {
            error,
            thread: thread_name(),
        });
    }

    fn on_closed(&self) {
        self.record(Event::Closed {
            thread: thread_name(),
        });
    }
}

/// 等待下一个事件。
pub fn next_event(receiver: &mpsc::Receiver<Event>) -> Result<Event> {
    receiver
        .recv_timeout(EVENT_TIMEOUT)
        .context("timed out waiting for visitor event")
}
