//! # tls：rustls / quinn 配置装配
//!
//! ## 意图（Why）
//! - 把已初始化的 [`ServerCredentials`] 与客户端固定证书指纹翻译为 `quinn` 可直接消费的
//!   `ServerConfig` / `ClientConfig`，传输引擎无需感知凭据来源；
//! - 集中维护加密后端（ring）与 QUIC 传输参数，服务端与客户端共享同一套策略。
//!
//! ## 契约（What）
//! - 仅启用 TLS 1.3（QUIC 的强制要求）；
//! - 客户端配置了指纹时使用 [`PinnedCertVerifier`]，只比对终端实体证书摘要并校验握手签名；
//!   未配置指纹时走 WebPKI 根证书链校验；
//! - 拥塞控制默认 BBR。

use std::{
    fs,
    path::PathBuf,
    sync::{Arc, OnceLock},
};

use quinn::{
    IdleTimeout, TransportConfig,
    congestion::{BbrConfig, CubicConfig, NewRenoConfig},
    crypto::rustls::{QuicClientConfig, QuicServerConfig},
};
use rustls::{
    CertificateError, DigitallySignedStruct, RootCertStore, SignatureScheme,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::CryptoProvider,
    server::{ClientHello, ResolvesServerCert},
    sign::CertifiedKey,
    version::TLS13,
};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime, pem::PemObject};

use crate::{
    config::{CongestionController, FactoryConfig, TransportSettings},
    credential::ServerCredentials,
    error::ConstructionError,
    fingerprint::CertificateFingerprint,
};

/// 进程内共享的 ring 加密后端。
pub(crate) fn crypto_provider() -> Arc<CryptoProvider> {
    static PROVIDER: OnceLock<Arc<CryptoProvider>> = OnceLock::new();
    Arc::clone(PROVIDER.get_or_init(|| Arc::new(rustls::crypto::ring::default_provider())))
}

/// 按配置生成 QUIC 传输参数。
pub(crate) fn transport_config(settings: &TransportSettings) -> Arc<TransportConfig> {
    let mut transport = TransportConfig::default();
    if let Some(idle) = settings.idle_timeout() {
        match IdleTimeout::try_from(idle) {
            Ok(timeout) => {
                transport.max_idle_timeout(Some(timeout));
            }
            Err(_) => {
                tracing::warn!(
                    idle_timeout_ms = settings.idle_timeout_ms,
                    "idle timeout exceeds the quic varint range, keeping engine default"
                );
            }
        }
    }
    transport.keep_alive_interval(settings.keep_alive_interval());
    match settings.congestion_controller {
        CongestionController::Bbr => {
            transport.congestion_controller_factory(Arc::new(BbrConfig::default()));
        }
        CongestionController::Cubic => {
            transport.congestion_controller_factory(Arc::new(CubicConfig::default()));
        }
        CongestionController::NewReno => {
            transport.congestion_controller_factory(Arc::new(NewRenoConfig::default()));
        }
    }
    Arc::new(transport)
}

/// 以服务端凭据构建 `quinn::ServerConfig`。
pub(crate) fn server_config(
    credentials: &ServerCredentials,
    config: &FactoryConfig,
) -> Result<quinn::ServerConfig, String> {
    let mut tls = rustls::ServerConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(&[&TLS13])
        .map_err(|err| err.to_string())?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(SingleCertResolver(credentials.certified_key())));
    tls.alpn_protocols = config.alpn_bytes();

    let crypto = QuicServerConfig::try_from(tls).map_err(|err| err.to_string())?;
    let mut server = quinn::ServerConfig::with_crypto(Arc::new(crypto));
    server.transport_config(transport_config(&config.transport));
    Ok(server)
}

/// 以固定指纹或根证书构建 `quinn::ClientConfig`。
pub(crate) fn client_config(
    fingerprints: &[CertificateFingerprint],
    config: &FactoryConfig,
) -> Result<quinn::ClientConfig, ConstructionError> {
    let provider = crypto_provider();
    let builder = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_protocol_versions(&[&TLS13])
        .map_err(tls_error)?;

    let mut tls = if fingerprints.is_empty() {
        builder
            .with_root_certificates(root_store(&config.trusted_root_certificates)?)
            .with_no_client_auth()
    } else {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(PinnedCertVerifier::new(
                fingerprints.to_vec(),
                provider,
            )))
            .with_no_client_auth()
    };
    tls.alpn_protocols = config.alpn_bytes();

    let crypto = QuicClientConfig::try_from(tls).map_err(tls_error)?;
    let mut client = quinn::ClientConfig::new(Arc::new(crypto));
    client.transport_config(transport_config(&config.transport));
    Ok(client)
}

fn root_store(extra_roots: &[PathBuf]) -> Result<RootCertStore, ConstructionError> {
    let mut roots = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    for path in extra_roots {
        let pem = fs::read(path).map_err(|err| ConstructionError::Tls {
            reason: format!("cannot read trusted root `{}`: {err}", path.display()),
        })?;
        for cert in CertificateDer::pem_slice_iter(&pem) {
            let cert = cert.map_err(|err| ConstructionError::Tls {
                reason: format!("malformed trusted root `{}`: {err}", path.display()),
            })?;
            roots.add(cert).map_err(tls_error)?;
        }
    }
    Ok(roots)
}

fn tls_error(err: impl std::fmt::Display) -> ConstructionError {
    ConstructionError::Tls {
        reason: err.to_string(),
    }
}

/// 始终返回同一张证书的解析器。
#[derive(Debug)]
struct SingleCertResolver(Arc<CertifiedKey>);

impl ResolvesServerCert for SingleCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.0))
    }
}

/// 固定证书校验器。
///
/// # 教案式说明
/// - **意图 (Why)**：WebTransport 的 `serverCertificateHashes` 语义：服务端使用短期自签名证书，
///   客户端只认可摘要命中的终端实体证书，不做 CA 链与主机名校验；
/// - **契约 (What)**：任一指纹命中即通过；握手签名仍按加密后端支持的算法严格校验，
///   防止持有证书但不持有私钥的中间人通过握手。
#[derive(Debug)]
pub(crate) struct PinnedCertVerifier {
    fingerprints: Vec<CertificateFingerprint>,
    provider: Arc<CryptoProvider>,
}

impl PinnedCertVerifier {
    pub(crate) fn new(fingerprints: Vec<CertificateFingerprint>, provider: Arc<CryptoProvider>) -> Self {
        Self {
            fingerprints,
            provider,
        }
    }
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if self
            .fingerprints
            .iter()
            .any(|fingerprint| fingerprint.matches(end_entity.as_ref()))
        {
            Ok(ServerCertVerified::assertion())
        } else {
            tracing::warn!(
                presented = %CertificateFingerprint::of_certificate(end_entity.as_ref()),
                "server certificate matches none of the pinned fingerprints"
            );
            Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
