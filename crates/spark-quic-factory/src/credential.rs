//! # credential：TLS 证书供给
//!
//! ## 设计动机（Why）
//! - 调用方以不同方式供给证书：ACME 签发的 PEM 证书/私钥对，或遗留系统导出的带密码 PKCS#12（PFX）证书包；
//! - 两条路径必须产出等价的内部凭据对象，传输引擎无需知道凭据来自哪一种格式。
//!
//! ## 核心契约（What）
//! - [`CredentialProvider`] 是两变体的和类型，只有一个能力：[`CredentialProvider::initialize`]；
//! - `initialize` 消费供给者本身，返回完全初始化的 [`ServerCredentials`] 或 [`CredentialError`]，
//!   不存在“半初始化”状态，也无法重复初始化；
//! - 初始化成功后不再访问磁盘，凭据随所属服务端一同销毁。
//!
//! ## 实现策略（How）
//! - PEM：`rustls-pki-types` 的 `PemObject` 解析证书链与首个私钥（PKCS#8 / PKCS#1 / SEC1）；
//! - PKCS#12：`p12-keystore` 以密码解开证书包并取出首个私钥链；
//! - 两条路径最终都经由 `rustls` 加密后端加载签名密钥，并校验私钥与终端实体证书的公钥一致。

use std::{
    fmt, fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use p12_keystore::KeyStore;
use rustls::{InconsistentKeys, sign::CertifiedKey};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, pem::PemObject};

use crate::{error::CredentialError, fingerprint::CertificateFingerprint, tls};

/// 证书材料的供给方式。
///
/// 同一实例只有一个变体处于激活状态；初始化通过模式匹配分派，而不是继承。
#[derive(Clone)]
pub enum CredentialProvider {
    /// 文件形式的 PEM 证书链与私钥。
    Pem {
        /// 证书链路径，首个证书为终端实体证书。
        cert_path: PathBuf,
        /// 私钥路径。
        key_path: PathBuf,
    },
    /// 带密码保护的 PKCS#12（PFX）证书包。
    Pkcs12 {
        /// 证书包路径。
        bundle_path: PathBuf,
        /// 证书包密码。
        password: String,
    },
}

impl CredentialProvider {
    /// 构造 PEM 变体。
    pub fn pem(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        CredentialProvider::Pem {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
        }
    }

    /// 构造 PKCS#12 变体。
    pub fn pkcs12(bundle_path: impl Into<PathBuf>, password: impl Into<String>) -> Self {
        CredentialProvider::Pkcs12 {
            bundle_path: bundle_path.into(),
            password: password.into(),
        }
    }

    /// 当前变体对应的来源标签。
    pub fn source(&self) -> CredentialSource {
        match self {
            CredentialProvider::Pem { .. } => CredentialSource::Pem,
            CredentialProvider::Pkcs12 { .. } => CredentialSource::Pkcs12,
        }
    }

    /// 读取并校验证书材料，产出可交给传输引擎的凭据。
    ///
    /// # 契约（What）
    /// - **成功**：返回持有已解析证书链与签名密钥的 [`ServerCredentials`]；
    /// - **失败**：路径不可读返回 [`CredentialError::Unreadable`]；解析失败、私钥不匹配、
    ///   密码错误或证书包损坏返回 [`CredentialError::InvalidMaterial`]；
    /// - 错误密码的失败是确定性的，同样的输入永远得到同样的结果。
    pub fn initialize(self) -> Result<ServerCredentials, CredentialError> {
        match self {
            CredentialProvider::Pem {
                cert_path,
                key_path,
            } => load_pem(&cert_path, &key_path),
            CredentialProvider::Pkcs12 {
                bundle_path,
                password,
            } => load_pkcs12(&bundle_path, &password),
        }
    }
}

impl fmt::Debug for CredentialProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialProvider::Pem {
                cert_path,
                key_path,
            } => f
                .debug_struct("Pem")
                .field("cert_path", cert_path)
                .field("key_path", key_path)
                .finish(),
            CredentialProvider::Pkcs12 { bundle_path, .. } => f
                .debug_struct("Pkcs12")
                .field("bundle_path", bundle_path)
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}

/// 凭据来源，仅用于诊断。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CredentialSource {
    /// PEM 证书链 + 私钥。
    Pem,
    /// PKCS#12 证书包。
    Pkcs12,
}

/// 已完成初始化的服务端凭据。
///
/// # 教案式说明
/// - **意图 (Why)**：屏蔽证书来源差异，向 TLS 装配层提供统一的 `CertifiedKey`；
/// - **契约 (What)**：实例只能由 [`CredentialProvider::initialize`] 产出，因此必然完整可用；
///   由所属服务端独占持有，随服务端销毁。
#[derive(Clone)]
pub struct ServerCredentials {
    certified: Arc<CertifiedKey>,
    source: CredentialSource,
    fingerprint: CertificateFingerprint,
}

impl ServerCredentials {
    /// rustls 使用的证书与签名密钥组合。
    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        Arc::clone(&self.certified)
    }

    /// 证书链，首个元素为终端实体证书。
    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.certified.cert
    }

    /// 凭据来源。
    pub fn source(&self) -> CredentialSource {
        self.source
    }

    /// 终端实体证书的 SHA-256 指纹，客户端可据此做固定证书校验。
    pub fn fingerprint(&self) -> &CertificateFingerprint {
        &self.fingerprint
    }
}

impl fmt::Debug for ServerCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerCredentials")
            .field("source", &self.source)
            .field("chain_len", &self.certified.cert.len())
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

fn read_material(path: &Path) -> Result<Vec<u8>, CredentialError> {
    fs::read(path).map_err(|source| CredentialError::Unreadable {
        path: path.to_path_buf(),
        source,
    })
}

fn load_pem(cert_path: &Path, key_path: &Path) -> Result<ServerCredentials, CredentialError> {
    let cert_pem = read_material(cert_path)?;
    let chain = CertificateDer::pem_slice_iter(&cert_pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| CredentialError::invalid(cert_path, format!("malformed certificate: {err}")))?;

    let key_pem = read_material(key_path)?;
    let key = PrivateKeyDer::from_pem_slice(&key_pem)
        .map_err(|err| CredentialError::invalid(key_path, format!("malformed private key: {err}")))?;

    certify(chain, key, cert_path, CredentialSource::Pem)
}

fn load_pkcs12(bundle_path: &Path, password: &str) -> Result<ServerCredentials, CredentialError> {
    let bundle = read_material(bundle_path)?;
    let keystore = KeyStore::from_pkcs12(&bundle, password).map_err(|err| {
        CredentialError::invalid(bundle_path, format!("cannot open pkcs#12 bundle: {err}"))
    })?;
    let (_, key_chain) = keystore.private_key_chain().ok_or_else(|| {
        CredentialError::invalid(bundle_path, "bundle holds no private key entry")
    })?;

    let chain = key_chain
        .chain()
        .iter()
        .map(|cert| CertificateDer::from(cert.as_der().to_vec()))
        .collect();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_chain.key().to_vec()));

    certify(chain, key, bundle_path, CredentialSource::Pkcs12)
}

fn certify(
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    origin: &Path,
    source: CredentialSource,
) -> Result<ServerCredentials, CredentialError> {
    let Some(end_entity) = chain.first() else {
        return Err(CredentialError::invalid(origin, "no certificate found"));
    };
    let fingerprint = CertificateFingerprint::of_certificate(end_entity.as_ref());

    let signing_key = tls::crypto_provider()
        .key_provider
        .load_private_key(key)
        .map_err(|err| CredentialError::invalid(origin, format!("unsupported private key: {err}")))?;
    let certified = CertifiedKey::new(chain, signing_key);

    match certified.keys_match() {
        // 部分密钥类型无法导出公钥，此时无从比较，交由握手阶段暴露问题。
        Ok(()) | Err(rustls::Error::InconsistentKeys(InconsistentKeys::Unknown)) => {}
        Err(err) => {
            return Err(CredentialError::invalid(
                origin,
                format!("private key does not match certificate: {err}"),
            ));
        }
    }

    tracing::debug!(
        source = ?source,
        path = %origin.display(),
        fingerprint = %fingerprint,
        "server credentials initialized"
    );
    Ok(ServerCredentials {
        certified: Arc::new(certified),
        source,
        fingerprint,
    })
}
