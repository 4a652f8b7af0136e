use std::fmt;

use sha2::{Digest, Sha256};

use crate::error::FactoryError;

/// 证书指纹所使用的摘要算法。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FingerprintAlgorithm {
    /// SHA-256，输出 32 字节。
    Sha256,
}

impl FingerprintAlgorithm {
    /// 摘要长度（字节）。
    pub fn digest_len(self) -> usize {
        match self {
            FingerprintAlgorithm::Sha256 => 32,
        }
    }
}

/// 服务端证书指纹，用于客户端的固定证书（非 CA）校验。
///
/// # 教案式说明
/// - **意图 (Why)**：自签名、短有效期证书无法走 WebPKI 链校验，客户端改为比对终端实体证书的摘要；
/// - **契约 (What)**：`value` 长度必须等于算法的摘要长度，构造函数负责校验；
///   文本形式接受 `AB:CD:...` 冒号分隔或连续十六进制两种写法，大小写不敏感。
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CertificateFingerprint {
    algorithm: FingerprintAlgorithm,
    value: Vec<u8>,
}

impl CertificateFingerprint {
    /// 以原始摘要字节构造 SHA-256 指纹。
    pub fn sha256(value: impl Into<Vec<u8>>) -> Result<Self, FactoryError> {
        let value = value.into();
        let expected = FingerprintAlgorithm::Sha256.digest_len();
        if value.len() != expected {
            return Err(FactoryError::config(format!(
                "sha-256 fingerprint must be {expected} bytes, got {}",
                value.len()
            )));
        }
        Ok(Self {
            algorithm: FingerprintAlgorithm::Sha256,
            value,
        })
    }

    /// 解析十六进制文本形式的 SHA-256 指纹。
    pub fn from_hex(text: &str) -> Result<Self, FactoryError> {
        let compact: String = text
            .trim()
            .chars()
            .filter(|ch| *ch != ':')
            .collect();
        let value = hex::decode(&compact)
            .map_err(|err| FactoryError::config(format!("fingerprint `{text}` is not hex: {err}")))?;
        Self::sha256(value)
    }

    /// 计算 DER 编码证书的 SHA-256 指纹。
    pub fn of_certificate(der: &[u8]) -> Self {
        Self {
            algorithm: FingerprintAlgorithm::Sha256,
            value: Sha256::digest(der).to_vec(),
        }
    }

    /// 摘要算法。
    pub fn algorithm(&self) -> FingerprintAlgorithm {
        self.algorithm
    }

    /// 摘要字节。
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// 判断 DER 证书是否与本指纹匹配。
    pub fn matches(&self, der: &[u8]) -> bool {
        match self.algorithm {
            FingerprintAlgorithm::Sha256 => Sha256::digest(der).as_slice() == self.value.as_slice(),
        }
    }
}

impl fmt::Display for CertificateFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, byte) in self.value.iter().enumerate() {
            if index > 0 {
                f.write_str(":")?;
            }
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for CertificateFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CertificateFingerprint({:?}, {self})", self.algorithm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn rejects_wrong_length() {
        assert!(CertificateFingerprint::sha256(vec![0u8; 31]).is_err());
        assert!(CertificateFingerprint::from_hex("AB:CD").is_err());
        assert!(CertificateFingerprint::from_hex("zz").is_err());
    }

    #[test]
    fn certificate_digest_matches_itself_only() {
        let fingerprint = CertificateFingerprint::of_certificate(b"certificate-a");
        assert!(fingerprint.matches(b"certificate-a"));
        assert!(!fingerprint.matches(b"certificate-b"));
        assert_eq!(fingerprint.value().len(), 32);
    }

    proptest! {
        #[test]
        fn display_form_parses_back(bytes in proptest::collection::vec(any::<u8>(), 32)) {
            let fingerprint = CertificateFingerprint::sha256(bytes.clone()).unwrap();
            let text = fingerprint.to_string();
            prop_assert_eq!(CertificateFingerprint::from_hex(&text).unwrap(), fingerprint.clone());
            let lower = hex::encode(&bytes);
            prop_assert_eq!(CertificateFingerprint::from_hex(&lower).unwrap(), fingerprint);
        }
    }
}
