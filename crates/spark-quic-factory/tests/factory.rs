//! 工厂生命周期与证书供给的端到端行为。

mod support;

use std::{sync::Arc, thread};

use anyhow::Result;
use spark_quic_factory::{
    ClientParameters, CredentialError, CredentialProvider, CredentialSource, FactoryError,
    FactoryState, TransportFactory,
};
use support::{CertificateFiles, loopback_factory};
use tracing_test::traced_test;

#[test]
fn valid_pem_pair_creates_a_server() -> Result<()> {
    let files = CertificateFiles::generate()?;
    let factory = loopback_factory()?;

    let handle = factory.create_server_from_pem(0, &files.cert_path, &files.key_path)?;
    assert!(handle.is_alive());
    assert_eq!(handle.factory_id(), factory.id());
    assert!(handle.fingerprint()?.matches(&files.cert_der));
    assert_eq!(factory.server_count(), 1);

    factory.release_server(&handle)?;
    assert_eq!(factory.server_count(), 0);
    assert!(!handle.is_alive());
    Ok(())
}

#[test]
fn malformed_pem_fails_and_factory_stays_usable() -> Result<()> {
    let files = CertificateFiles::generate()?;
    let factory = loopback_factory()?;

    let cert_text = std::fs::read_to_string(&files.cert_path)?;
    let tampered_cert = files.write_extra(
        "tampered-cert.pem",
        cert_text.replacen("-----BEGIN CERTIFICATE-----", "-----BEGIN CERTIFICATE-----\n!!!!", 1),
    )?;
    let key_text = std::fs::read_to_string(&files.key_path)?;
    let truncated_key = files.write_extra("truncated-key.pem", &key_text[..key_text.len() / 2])?;

    for (cert, key) in [
        (&tampered_cert, &files.key_path),
        (&files.cert_path, &truncated_key),
    ] {
        let err = factory
            .create_server_from_pem(0, cert, key)
            .expect_err("tampered material");
        assert!(matches!(
            err,
            FactoryError::Credential(CredentialError::InvalidMaterial { .. })
        ));
        assert!(!err.is_contract_violation());
    }

    assert!(factory.is_running());
    let handle = factory.create_server_from_pem(0, &files.cert_path, &files.key_path)?;
    factory.release_server(&handle)?;
    Ok(())
}

#[test]
fn mismatched_key_is_rejected() -> Result<()> {
    let first = CertificateFiles::generate()?;
    let second = CertificateFiles::generate()?;
    let factory = loopback_factory()?;

    let err = factory
        .create_server_from_pem(0, &first.cert_path, &second.key_path)
        .expect_err("key belongs to another certificate");
    assert_eq!(err.code(), "spark.quic.factory.credential.invalid_material");
    Ok(())
}

#[test]
fn missing_files_are_unreadable() -> Result<()> {
    let factory = loopback_factory()?;
    let err = factory
        .create_server_from_pem(0, "/nonexistent/cert.pem", "/nonexistent/key.pem")
        .expect_err("missing files");
    assert!(matches!(
        err,
        FactoryError::Credential(CredentialError::Unreadable { .. })
    ));
    Ok(())
}

#[test]
fn pkcs12_bundle_requires_the_right_password() -> Result<()> {
    let files = CertificateFiles::generate()?;
    let bundle = files.write_pkcs12("correct horse")?;
    let factory = loopback_factory()?;

    let handle = factory.create_server_from_pkcs12(0, &bundle, "correct horse")?;
    assert!(handle.fingerprint()?.matches(&files.cert_der));
    factory.release_server(&handle)?;

    for _ in 0..3 {
        let err = factory
            .create_server_from_pkcs12(0, &bundle, "battery staple")
            .expect_err("wrong password");
        assert_eq!(err.code(), "spark.quic.factory.credential.invalid_material");
    }
    assert_eq!(factory.server_count(), 0);
    Ok(())
}

#[test]
fn pem_and_pkcs12_yield_equivalent_credentials() -> Result<()> {
    let files = CertificateFiles::generate()?;
    let bundle = files.write_pkcs12("secret")?;

    let from_pem = CredentialProvider::pem(&files.cert_path, &files.key_path).initialize()?;
    let from_pfx = CredentialProvider::pkcs12(&bundle, "secret").initialize()?;

    assert_eq!(from_pem.source(), CredentialSource::Pem);
    assert_eq!(from_pfx.source(), CredentialSource::Pkcs12);
    assert_eq!(from_pem.fingerprint(), from_pfx.fingerprint());
    assert_eq!(from_pem.chain(), from_pfx.chain());
    Ok(())
}

#[test]
#[traced_test]
fn double_release_is_a_logged_contract_violation() -> Result<()> {
    let files = CertificateFiles::generate()?;
    let factory = loopback_factory()?;
    let handle = factory.create_server_from_pem(0, &files.cert_path, &files.key_path)?;

    factory.release_server(&handle)?;
    let err = factory.release_server(&handle).expect_err("second release");
    assert!(matches!(err, FactoryError::ServerNotFound { .. }));
    assert!(err.is_contract_violation());
    assert!(matches!(
        handle.start(),
        Err(FactoryError::ServerReleased { .. })
    ));
    assert!(logs_contain("contract violation"));
    Ok(())
}

#[test]
fn foreign_handles_are_rejected() -> Result<()> {
    let files = CertificateFiles::generate()?;
    let issuer = loopback_factory()?;
    let other = loopback_factory()?;
    let handle = issuer.create_server_from_pem(0, &files.cert_path, &files.key_path)?;

    let err = other.release_server(&handle).expect_err("foreign handle");
    assert!(matches!(err, FactoryError::ForeignHandle { .. }));
    assert!(handle.is_alive());

    issuer.release_server(&handle)?;
    Ok(())
}

#[test]
fn create_client_matches_default_parameters() -> Result<()> {
    let factory = loopback_factory()?;
    let url = "https://localhost:4433/chat";

    let plain = factory.create_client(url)?;
    let explicit = factory.create_client_with_parameters(url, ClientParameters::default())?;

    assert_eq!(plain.url(), explicit.url());
    assert_eq!(plain.origin(), explicit.origin());
    assert_eq!(plain.parameters(), explicit.parameters());
    assert_ne!(plain.id(), explicit.id());
    Ok(())
}

#[test]
fn client_construction_errors_round_trip() -> Result<()> {
    let factory = loopback_factory()?;
    let err = factory
        .create_client("ws://localhost/")
        .expect_err("unsupported scheme");
    assert_eq!(err.code(), "spark.quic.factory.construct.unsupported_scheme");

    // 构造失败不影响后续请求。
    factory.create_client("quic-transport://localhost:4433/echo")?;
    Ok(())
}

#[test]
fn concurrent_client_creation_yields_distinct_handles() -> Result<()> {
    const CLIENTS: usize = 16;
    let factory = Arc::new(loopback_factory()?);

    let workers: Vec<_> = (0..CLIENTS)
        .map(|index| {
            let factory = Arc::clone(&factory);
            thread::spawn(move || factory.create_client(format!("https://localhost:{}/", 4000 + index)))
        })
        .collect();

    let mut ids = Vec::with_capacity(CLIENTS);
    for worker in workers {
        let client = worker.join().expect("worker thread")?;
        ids.push(client.id());
    }
    ids.sort_unstable();
    assert_eq!(ids, (0..CLIENTS as u64).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn creation_after_shutdown_fails_fast() -> Result<()> {
    let files = CertificateFiles::generate()?;
    let factory = loopback_factory()?;
    let leaked = factory.create_server_from_pem(0, &files.cert_path, &files.key_path)?;
    let client = factory.create_client("https://localhost:4433/")?;

    factory.shutdown();
    assert_eq!(factory.state(), FactoryState::Terminated);
    assert!(!leaked.is_alive());
    assert_eq!(factory.server_count(), 0);

    let err = factory
        .create_client("https://localhost:4433/")
        .expect_err("factory is terminated");
    assert!(matches!(err, FactoryError::ContextUnavailable { .. }));
    let err = factory
        .create_server_from_pem(0, &files.cert_path, &files.key_path)
        .expect_err("factory is terminated");
    assert!(matches!(err, FactoryError::ContextUnavailable { .. }));

    assert!(matches!(
        client.connect(),
        Err(FactoryError::ContextUnavailable { .. })
    ));
    Ok(())
}

#[test]
fn config_file_drives_context_names() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("factory.toml");
    std::fs::write(
        &path,
        "io_thread_name = \"edge-io\"\nevent_thread_name = \"edge-events\"\n",
    )?;
    let factory = TransportFactory::with_config_file(&path)?;
    assert_eq!(factory.io_context().name(), "edge-io");
    assert_eq!(factory.event_context().name(), "edge-events");
    Ok(())
}
