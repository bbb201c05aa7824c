use ledgr_core::LedgerError;
use sha2::{Digest, Sha256};

/// Proof that a pipeline invocation passed [`PipelineAuth::verify`]. Outside this crate a
/// grant can only come from `verify`, so every step receiving one runs on behalf of an
/// authorized caller.
///
/// ```compile_fail
/// let grant = ledgr_sync::PipelineAuth::internal("anyone");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessGrant {
    subject: String,
}

impl AccessGrant {
    pub fn subject(&self) -> &str {
        &self.subject
    }
}

/// Checks the token presented by a pipeline invocation against the configured one.
#[derive(Clone)]
pub struct PipelineAuth {
    digest: Option<[u8; 32]>,
}

impl std::fmt::Debug for PipelineAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineAuth")
            .field("configured", &self.digest.is_some())
            .finish()
    }
}

fn digest(token: &str) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(token.as_bytes()));
    out
}

impl PipelineAuth {
    /// `None` (or a blank token) leaves the pipeline locked: every invocation is rejected.
    pub fn new(configured_token: Option<&str>) -> Self {
        Self {
            digest: configured_token
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(digest),
        }
    }

    /// Grant issued to in-process callers such as the scheduler, which act on their own
    /// configuration rather than on a presented token.
    pub(crate) fn internal(subject: &str) -> AccessGrant {
        AccessGrant {
            subject: subject.to_string(),
        }
    }

    pub fn verify(&self, presented: Option<&str>) -> Result<AccessGrant, LedgerError> {
        let Some(expected) = &self.digest else {
            return Err(LedgerError::Unauthorized(
                "no pipeline token is configured".to_string(),
            ));
        };
        let presented = presented
            .map(str::trim)
            .map(|t| t.strip_prefix("Bearer ").unwrap_or(t))
            .filter(|t| !t.is_empty())
            .ok_or_else(|| LedgerError::Unauthorized("missing pipeline token".to_string()))?;

        // fixed-length digests compared without early exit
        let candidate = digest(presented);
        let diff = expected
            .iter()
            .zip(candidate.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b));
        if diff == 0 {
            Ok(AccessGrant {
                subject: "pipeline".to_string(),
            })
        } else {
            Err(LedgerError::Unauthorized("invalid pipeline token".to_string()))
        }
    }
}
