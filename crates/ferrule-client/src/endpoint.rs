//! Per-endpoint connection configuration.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::handshake::{AllowAllOrigins, HandshakeRequest, HandshakeValidator, OriginPolicy};

/// Where to connect and which handshakes to accept.
#[derive(Clone)]
pub struct EndpointConfig {
    uri: String,
    origin: Option<String>,
    headers: BTreeMap<String, String>,
    origin_policy: Arc<dyn OriginPolicy>,
}

impl EndpointConfig {
    /// Endpoint at `uri` that accepts any origin.
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            origin: None,
            headers: BTreeMap::new(),
            origin_policy: Arc::new(AllowAllOrigins),
        }
    }

    /// Declare `origin` in the handshake.
    #[must_use]
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Extra handshake header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let _ = self.headers.insert(name.into(), value.into());
        self
    }

    /// Check origins with `policy` before connecting.
    #[must_use]
    pub fn with_origin_policy(mut self, policy: impl OriginPolicy + 'static) -> Self {
        self.origin_policy = Arc::new(policy);
        self
    }

    /// Same as [`with_origin_policy`](Self::with_origin_policy) for an
    /// already shared policy.
    #[must_use]
    pub fn with_shared_origin_policy(mut self, policy: Arc<dyn OriginPolicy>) -> Self {
        self.origin_policy = policy;
        self
    }

    /// Target URI.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Declared origin.
    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    /// The configured policy.
    pub fn origin_policy(&self) -> &Arc<dyn OriginPolicy> {
        &self.origin_policy
    }

    /// Handshake request this endpoint produces.
    pub fn handshake_request(&self) -> HandshakeRequest {
        self.headers.iter().fold(
            HandshakeRequest::new(self.uri.clone()).with_origin_opt(self.origin.as_deref()),
            |req, (name, value)| req.with_header(name.clone(), value.clone()),
        )
    }

    /// Validator enforcing this endpoint's policy.
    pub fn validator(&self) -> HandshakeValidator {
        HandshakeValidator::new(Arc::clone(&self.origin_policy))
    }
}

impl fmt::Debug for EndpointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointConfig")
            .field("uri", &self.uri)
            .field("origin", &self.origin)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}
