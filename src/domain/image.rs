use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// Content-addressing algorithm used by an image digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DigestAlgorithm {
    Sha256,
    Sha512,
}

impl DigestAlgorithm {
    fn expected_hex_len(self) -> usize {
        match self {
            DigestAlgorithm::Sha256 => 64,
            DigestAlgorithm::Sha512 => 128,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            DigestAlgorithm::Sha256 => "sha256",
            DigestAlgorithm::Sha512 => "sha512",
        }
    }
}

/// A content-addressed image identifier, `algorithm:hex`. Uniquely
/// identifies image content irrespective of which tag or registry path
/// pointed at it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Digest {
    algorithm: DigestAlgorithm,
    hex: String,
}

impl Digest {
    /// Parse `algo:hex`, validating the hex length against the algorithm.
    /// A bare 64-hex string (no `sha256:` prefix) is accepted and
    /// normalized, matching the sidecar's digest-validation contract.
    pub fn parse(raw: &str) -> Result<Self> {
        let (algorithm, hex) = match raw.split_once(':') {
            Some(("sha256", hex)) => (DigestAlgorithm::Sha256, hex),
            Some(("sha512", hex)) => (DigestAlgorithm::Sha512, hex),
            Some((other, _)) => {
                return Err(Error::Invariant(format!(
                    "unsupported digest algorithm: {other}"
                )))
            }
            None if raw.len() == 64 && raw.bytes().all(|b| b.is_ascii_hexdigit()) => {
                (DigestAlgorithm::Sha256, raw)
            }
            None => {
                return Err(Error::Invariant(format!(
                    "malformed digest, expected algo:hex: {raw}"
                )))
            }
        };

        if hex.len() != algorithm.expected_hex_len() || !hex.bytes().all(|b| b.is_ascii_hexdigit())
        {
            return Err(Error::Invariant(format!(
                "digest {raw} has wrong length or non-hex characters for {}",
                algorithm.as_str()
            )));
        }

        Ok(Digest {
            algorithm,
            hex: hex.to_ascii_lowercase(),
        })
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// The canonical store key: `algo:hex`.
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.as_str(), self.hex)
    }
}

/// An image as observed from the source environment: the digest that
/// uniquely identifies content, plus the free-form reference string
/// preserved byte-identical from the observation (`repo:tag`, `repo@digest`,
/// registry-port forms, etc).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub reference: String,
    pub digest: Digest,
}

/// Terminal-unless-noted states of an `ImageRecord`. See the status-machine
/// module doc for the full transition table; this type only carries the
/// data each state needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ImageStatus {
    Pending,
    GeneratingSbom,
    SbomFailed { message: String },
    ScanningVulnerabilities,
    VulnScanFailed { message: String },
    Completed,
    /// No node-side SBOM retriever is reachable for this digest's host.
    Unavailable { message: String },
}

impl ImageStatus {
    /// True once SBOM bytes are known to be stored for the record's digest.
    pub fn has_sbom(&self) -> bool {
        matches!(
            self,
            ImageStatus::ScanningVulnerabilities
                | ImageStatus::VulnScanFailed { .. }
                | ImageStatus::Completed
        )
    }

    pub fn has_vulnerabilities(&self) -> bool {
        matches!(self, ImageStatus::Completed)
    }

    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            ImageStatus::SbomFailed { .. }
                | ImageStatus::VulnScanFailed { .. }
                | ImageStatus::Unavailable { .. }
        )
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            ImageStatus::SbomFailed { message }
            | ImageStatus::VulnScanFailed { message }
            | ImageStatus::Unavailable { message } => Some(message),
            _ => None,
        }
    }

    pub fn as_label(&self) -> &'static str {
        match self {
            ImageStatus::Pending => "pending",
            ImageStatus::GeneratingSbom => "generating_sbom",
            ImageStatus::SbomFailed { .. } => "sbom_failed",
            ImageStatus::ScanningVulnerabilities => "scanning_vulnerabilities",
            ImageStatus::VulnScanFailed { .. } => "vuln_scan_failed",
            ImageStatus::Completed => "completed",
            ImageStatus::Unavailable { .. } => "unavailable",
        }
    }
}

/// "Data complete" per the status-machine doc: SBOM present *and*
/// vulnerabilities present.
pub fn data_complete(status: &ImageStatus) -> bool {
    status.has_sbom() && status.has_vulnerabilities()
}

/// One row per distinct digest (invariant I1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRecord {
    pub digest: Digest,
    pub reference: String,
    pub status: ImageStatus,
    pub sbom: Option<Vec<u8>>,
    pub sbom_produced_at: Option<DateTime<Utc>>,
    pub vulnerabilities: Option<Vec<u8>>,
    pub vulnerabilities_produced_at: Option<DateTime<Utc>>,
    pub grype_db_built_at: Option<DateTime<Utc>>,
    pub os_name: Option<String>,
    pub os_version: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ImageRecord {
    /// A freshly created record for a previously unseen digest (I1).
    pub fn pending(image_ref: &ImageRef) -> Self {
        let now = Utc::now();
        ImageRecord {
            digest: image_ref.digest.clone(),
            reference: image_ref.reference.clone(),
            status: ImageStatus::Pending,
            sbom: None,
            sbom_produced_at: None,
            vulnerabilities: None,
            vulnerabilities_produced_at: None,
            grype_db_built_at: None,
            os_name: None,
            os_version: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_sbom(&self) -> bool {
        self.status.has_sbom()
    }

    pub fn has_vulnerabilities(&self) -> bool {
        self.status.has_vulnerabilities()
    }

    pub fn data_incomplete(&self) -> bool {
        self.has_sbom() && !self.has_vulnerabilities()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_canonical_sha256() {
        let hex = "abcd1234".repeat(8);
        let raw = format!("sha256:{hex}");
        let d = Digest::parse(&raw).unwrap();
        assert_eq!(d.algorithm(), DigestAlgorithm::Sha256);
        assert_eq!(d.to_string(), raw);
    }

    #[test]
    fn rejects_too_long_hex() {
        let hex = "a".repeat(66);
        let err = Digest::parse(&format!("sha256:{hex}")).unwrap_err();
        assert!(matches!(err, Error::Invariant(_)));
    }

    #[test]
    fn parses_bare_hex_as_sha256() {
        let hex = "a".repeat(64);
        let d = Digest::parse(&hex).unwrap();
        assert_eq!(d.algorithm(), DigestAlgorithm::Sha256);
        assert_eq!(d.key(), format!("sha256:{hex}"));
    }

    #[test]
    fn parses_sha512() {
        let hex = "b".repeat(128);
        let raw = format!("sha512:{hex}");
        let d = Digest::parse(&raw).unwrap();
        assert_eq!(d.algorithm(), DigestAlgorithm::Sha512);
        assert_eq!(d.to_string(), raw);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(Digest::parse("sha256:abcd").is_err());
    }

    #[test]
    fn rejects_unknown_algorithm() {
        assert!(Digest::parse("md5:abcd").is_err());
    }

    #[test]
    fn status_machine_predicates() {
        assert!(!ImageStatus::Pending.has_sbom());
        assert!(ImageStatus::ScanningVulnerabilities.has_sbom());
        assert!(!ImageStatus::ScanningVulnerabilities.has_vulnerabilities());
        assert!(ImageStatus::Completed.has_vulnerabilities());
        assert!(data_complete(&ImageStatus::Completed));
        assert!(!data_complete(&ImageStatus::ScanningVulnerabilities));
    }
}
