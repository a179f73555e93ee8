//! Trust policy for call authentication.
//!
//! An [`AuthPolicy`] is built once at startup through [`AuthPolicyBuilder`]
//! and is immutable afterwards. Construction rejects every combination that
//! would weaken verification outside an in-process deployment.

use common::jwt::{DEFAULT_CLOCK_SKEW, MAX_CLOCK_SKEW};
use std::collections::BTreeSet;
use std::fmt;
use std::num::NonZeroU32;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default number of bad signatures for one kid, counted since the last
/// refresh, before the cached key set is dropped.
pub const DEFAULT_BAD_SIGNATURE_THRESHOLD: u32 = 3;

/// Where the service runs, which decides which tokens it trusts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeploymentMode {
    /// Multi-tenant hosted deployment: identity and access tokens.
    Cloud,
    /// Single-tenant deployment: identity token only.
    OnPrem,
    /// Calls that never leave the process.
    InProcess,
}

impl DeploymentMode {
    pub fn as_str(self) -> &'static str {
        match self {
            DeploymentMode::Cloud => "cloud",
            DeploymentMode::OnPrem => "on-prem",
            DeploymentMode::InProcess => "in-process",
        }
    }
}

impl fmt::Display for DeploymentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "cloud" => Ok(DeploymentMode::Cloud),
            "on-prem" | "onprem" | "on_prem" => Ok(DeploymentMode::OnPrem),
            "in-process" | "inprocess" | "in_process" => Ok(DeploymentMode::InProcess),
            other => Err(format!("unknown deployment mode '{other}'")),
        }
    }
}

/// What to do when signatures made with a cached key keep failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BadSignaturePolicy {
    /// Never invalidate because of bad signatures.
    Ignore,
    /// Invalidate the active key set after this many bad signatures for
    /// the same kid since the last refresh.
    InvalidateAfter(NonZeroU32),
}

impl BadSignaturePolicy {
    /// Build from a threshold where 0 disables invalidation.
    pub fn from_threshold(threshold: u32) -> Self {
        NonZeroU32::new(threshold).map_or(Self::Ignore, Self::InvalidateAfter)
    }

    pub fn threshold(self) -> Option<NonZeroU32> {
        match self {
            BadSignaturePolicy::Ignore => None,
            BadSignaturePolicy::InvalidateAfter(threshold) => Some(threshold),
        }
    }
}

impl Default for BadSignaturePolicy {
    fn default() -> Self {
        Self::from_threshold(DEFAULT_BAD_SIGNATURE_THRESHOLD)
    }
}

/// Combinations rejected when building an [`AuthPolicy`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("At least one allowed audience is required")]
    NoAudiences,

    #[error("A signing keys URL is required when signatures are verified")]
    MissingSigningKeysUrl,

    #[error("Signature verification can only be skipped in in-process mode, not {0}")]
    SkipSignatureNotInProcess(DeploymentMode),

    #[error("On-prem deployments do not verify access tokens")]
    AccessTokenOnPrem,

    #[error("Cloud deployments require both identity and access tokens")]
    CloudRequiresBothTokens,

    #[error("Policy must require at least one token")]
    NoTokenRequired,

    #[error("Clock skew must not exceed {max}s, got {got}s")]
    ClockSkewTooLarge { max: u64, got: u64 },

    #[error("Policy verifies signatures but no key cache was provided")]
    MissingKeyCache,
}

/// Validated, immutable authentication policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPolicy {
    mode: DeploymentMode,
    allowed_audiences: BTreeSet<String>,
    allowed_issuers: BTreeSet<String>,
    signing_keys_url: Option<String>,
    require_identity_token: bool,
    require_access_token: bool,
    skip_signature_verification: bool,
    clock_skew: Duration,
    bad_signature_policy: BadSignaturePolicy,
}

impl AuthPolicy {
    /// Start a policy with the defaults for `mode`.
    pub fn builder(mode: DeploymentMode) -> AuthPolicyBuilder {
        AuthPolicyBuilder::new(mode)
    }

    pub fn mode(&self) -> DeploymentMode {
        self.mode
    }

    /// Whether tokens must carry a signature made by a trusted key.
    ///
    /// This is the only place the trust decision is made; it can be false
    /// only for in-process policies.
    pub fn verifies_signatures(&self) -> bool {
        !self.skip_signature_verification
    }

    pub fn requires_identity_token(&self) -> bool {
        self.require_identity_token
    }

    pub fn requires_access_token(&self) -> bool {
        self.require_access_token
    }

    pub fn allows_audience(&self, audience: &str) -> bool {
        self.allowed_audiences.contains(audience)
    }

    pub fn allowed_audiences(&self) -> impl Iterator<Item = &str> {
        self.allowed_audiences.iter().map(String::as_str)
    }

    /// An empty issuer allow-list accepts any issuer, including none.
    pub fn allows_issuer(&self, issuer: Option<&str>) -> bool {
        if self.allowed_issuers.is_empty() {
            return true;
        }
        issuer.is_some_and(|iss| self.allowed_issuers.contains(iss))
    }

    pub fn signing_keys_url(&self) -> Option<&str> {
        self.signing_keys_url.as_deref()
    }

    pub fn clock_skew(&self) -> Duration {
        self.clock_skew
    }

    pub fn bad_signature_policy(&self) -> BadSignaturePolicy {
        self.bad_signature_policy
    }
}

/// Builder for [`AuthPolicy`]; [`build`](Self::build) validates.
#[derive(Debug, Clone)]
pub struct AuthPolicyBuilder {
    mode: DeploymentMode,
    allowed_audiences: BTreeSet<String>,
    allowed_issuers: BTreeSet<String>,
    signing_keys_url: Option<String>,
    require_identity_token: bool,
    require_access_token: bool,
    skip_signature_verification: bool,
    clock_skew: Duration,
    bad_signature_policy: BadSignaturePolicy,
}

impl AuthPolicyBuilder {
    fn new(mode: DeploymentMode) -> Self {
        Self {
            mode,
            allowed_audiences: BTreeSet::new(),
            allowed_issuers: BTreeSet::new(),
            signing_keys_url: None,
            require_identity_token: true,
            require_access_token: mode == DeploymentMode::Cloud,
            skip_signature_verification: false,
            clock_skew: DEFAULT_CLOCK_SKEW,
            bad_signature_policy: BadSignaturePolicy::default(),
        }
    }

    #[must_use]
    pub fn allowed_audiences<I, S>(mut self, audiences: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_audiences
            .extend(audiences.into_iter().map(Into::<String>::into).filter(|a| !a.is_empty()));
        self
    }

    #[must_use]
    pub fn allowed_issuers<I, S>(mut self, issuers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_issuers
            .extend(issuers.into_iter().map(Into::<String>::into).filter(|i| !i.is_empty()));
        self
    }

    #[must_use]
    pub fn signing_keys_url(mut self, url: impl Into<String>) -> Self {
        self.signing_keys_url = Some(url.into());
        self
    }

    #[must_use]
    pub fn require_identity_token(mut self, required: bool) -> Self {
        self.require_identity_token = required;
        self
    }

    #[must_use]
    pub fn require_access_token(mut self, required: bool) -> Self {
        self.require_access_token = required;
        self
    }

    #[must_use]
    pub fn skip_signature_verification(mut self, skip: bool) -> Self {
        self.skip_signature_verification = skip;
        self
    }

    #[must_use]
    pub fn clock_skew(mut self, clock_skew: Duration) -> Self {
        self.clock_skew = clock_skew;
        self
    }

    #[must_use]
    pub fn bad_signature_policy(mut self, policy: BadSignaturePolicy) -> Self {
        self.bad_signature_policy = policy;
        self
    }

    /// Validate and freeze the policy.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError`] for any combination that is not allowed in
    /// the chosen deployment mode.
    pub fn build(self) -> Result<AuthPolicy, PolicyError> {
        if self.skip_signature_verification && self.mode != DeploymentMode::InProcess {
            return Err(PolicyError::SkipSignatureNotInProcess(self.mode));
        }

        match self.mode {
            DeploymentMode::Cloud => {
                if !(self.require_identity_token && self.require_access_token) {
                    return Err(PolicyError::CloudRequiresBothTokens);
                }
            }
            DeploymentMode::OnPrem => {
                if self.require_access_token {
                    return Err(PolicyError::AccessTokenOnPrem);
                }
            }
            DeploymentMode::InProcess => {}
        }

        if !self.require_identity_token && !self.require_access_token {
            return Err(PolicyError::NoTokenRequired);
        }

        if self.allowed_audiences.is_empty() {
            return Err(PolicyError::NoAudiences);
        }

        let has_url = self
            .signing_keys_url
            .as_deref()
            .is_some_and(|url| !url.trim().is_empty());
        if !self.skip_signature_verification && !has_url {
            return Err(PolicyError::MissingSigningKeysUrl);
        }

        if self.clock_skew > MAX_CLOCK_SKEW {
            return Err(PolicyError::ClockSkewTooLarge {
                max: MAX_CLOCK_SKEW.as_secs(),
                got: self.clock_skew.as_secs(),
            });
        }

        Ok(AuthPolicy {
            mode: self.mode,
            allowed_audiences: self.allowed_audiences,
            allowed_issuers: self.allowed_issuers,
            signing_keys_url: self.signing_keys_url,
            require_identity_token: self.require_identity_token,
            require_access_token: self.require_access_token,
            skip_signature_verification: self.skip_signature_verification,
            clock_skew: self.clock_skew,
            bad_signature_policy: self.bad_signature_policy,
        })
    }
}
