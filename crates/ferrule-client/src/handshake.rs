//! Handshake acceptance: origin policies and the validator that applies them.
//!
//! The same [`HandshakeValidator::evaluate`] decision backs both the client
//! (fail fast before any bytes are sent) and a server-side upgrade handler
//! (answer the upgrade request with the rejection status).

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, error, info};

use crate::errors::ClientError;
use crate::pool::panic_message;
use crate::session::{MessageHandler, Session};

/// A connection-establishment request as seen by the origin policy.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HandshakeRequest {
    target: String,
    origin: Option<String>,
    headers: BTreeMap<String, String>,
}

impl HandshakeRequest {
    /// Request for `target` with no origin and no extra headers.
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            ..Self::default()
        }
    }

    /// Set the declared `Origin` header value.
    #[must_use]
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Set or clear the declared `Origin` header value.
    #[must_use]
    pub fn with_origin_opt(mut self, origin: Option<&str>) -> Self {
        self.origin = origin.map(ToOwned::to_owned);
        self
    }

    /// Add an extra request header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let _ = self.headers.insert(name.into(), value.into());
        self
    }

    /// Target URI.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Declared origin, if any.
    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    /// Extra request headers.
    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }
}

/// Predicate over the declared origin of a connecting peer.
///
/// An absent origin is a normal input. Implementations should not panic; if
/// one does, the handshake is rejected with status 500.
pub trait OriginPolicy: Send + Sync {
    /// Whether a peer declaring `origin` may connect.
    fn check_origin(&self, origin: Option<&str>) -> bool;
}

impl<F> OriginPolicy for F
where
    F: Fn(Option<&str>) -> bool + Send + Sync,
{
    fn check_origin(&self, origin: Option<&str>) -> bool {
        self(origin)
    }
}

/// Accepts every origin, including none. The default policy.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAllOrigins;

impl OriginPolicy for AllowAllOrigins {
    fn check_origin(&self, _origin: Option<&str>) -> bool {
        true
    }
}

/// Rejects every handshake.
#[derive(Clone, Copy, Debug, Default)]
pub struct DenyAllOrigins;

impl OriginPolicy for DenyAllOrigins {
    fn check_origin(&self, _origin: Option<&str>) -> bool {
        false
    }
}

/// Exact-match allow-list. A missing origin is rejected.
#[derive(Clone, Debug, Default)]
pub struct AllowedOrigins {
    origins: Vec<String>,
}

impl AllowedOrigins {
    /// Allow exactly the given origins.
    pub fn new<I, S>(origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            origins: origins.into_iter().map(Into::into).collect(),
        }
    }
}

impl OriginPolicy for AllowedOrigins {
    fn check_origin(&self, origin: Option<&str>) -> bool {
        origin.is_some_and(|origin| self.origins.iter().any(|allowed| allowed == origin))
    }
}

/// Why a handshake was refused.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rejection {
    /// HTTP-style status code.
    pub status: u16,
    /// Human-readable reason.
    pub reason: String,
}

impl Rejection {
    /// 403, the origin policy said no.
    pub fn forbidden() -> Self {
        Self {
            status: StatusCode::FORBIDDEN.as_u16(),
            reason: "origin not allowed".into(),
        }
    }

    /// 500, the origin policy itself failed.
    pub fn policy_failure(detail: &str) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
            reason: format!("origin policy failed: {detail}"),
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.status, self.reason)
    }
}

impl From<Rejection> for ClientError {
    fn from(rejection: Rejection) -> Self {
        Self::HandshakeRejected {
            status: rejection.status,
            reason: rejection.reason,
        }
    }
}

/// Result of validating a handshake on the client.
pub enum HandshakeOutcome {
    /// Accepted; the session starts in `Connecting` until the transport
    /// confirms the upgrade.
    Accepted(Session),
    /// Refused; no session exists and no handler code ran.
    Rejected(Rejection),
}

impl fmt::Debug for HandshakeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accepted(session) => f.debug_tuple("Accepted").field(session).finish(),
            Self::Rejected(rejection) => f.debug_tuple("Rejected").field(rejection).finish(),
        }
    }
}

/// Applies an endpoint's origin policy to handshake requests.
#[derive(Clone)]
pub struct HandshakeValidator {
    policy: Arc<dyn OriginPolicy>,
}

impl HandshakeValidator {
    /// Validator enforcing `policy`.
    pub fn new(policy: Arc<dyn OriginPolicy>) -> Self {
        Self { policy }
    }

    /// Decide whether `request` may proceed.
    pub fn evaluate(&self, request: &HandshakeRequest) -> Result<(), Rejection> {
        let origin = request.origin();
        match panic::catch_unwind(AssertUnwindSafe(|| self.policy.check_origin(origin))) {
            Ok(true) => {
                debug!(uri = request.target(), origin, "origin accepted");
                Ok(())
            }
            Ok(false) => {
                info!(uri = request.target(), origin, "origin rejected");
                Err(Rejection::forbidden())
            }
            Err(payload) => {
                let detail = panic_message(payload.as_ref());
                error!(uri = request.target(), origin, panic = %detail, "origin policy panicked");
                Err(Rejection::policy_failure(&detail))
            }
        }
    }

    /// Decide, and on acceptance create the session that will carry
    /// `handler`.
    pub fn validate(
        &self,
        request: &HandshakeRequest,
        handler: Arc<dyn MessageHandler>,
    ) -> HandshakeOutcome {
        match self.evaluate(request) {
            Ok(()) => HandshakeOutcome::Accepted(Session::new(request.target(), handler)),
            Err(rejection) => HandshakeOutcome::Rejected(rejection),
        }
    }
}

impl Default for HandshakeValidator {
    fn default() -> Self {
        Self::new(Arc::new(AllowAllOrigins))
    }
}

impl fmt::Debug for HandshakeValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeValidator").finish_non_exhaustive()
    }
}
