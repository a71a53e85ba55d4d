//! Pluggable handshake authentication.

/// Parsed handshake query parameters, identical across both transport kinds.
#[derive(Debug, Clone, Default)]
pub struct HandshakeParams {
    pub tenant_id: Option<String>,
    pub site_id: Option<String>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
}

/// Authenticates a handshake. The default rejects only a missing tenant;
/// deployments needing real identity-provider checks supply their own.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, params: &HandshakeParams) -> Result<(), String>;
}

#[derive(Debug, Clone, Default)]
pub struct DefaultAuthenticator;

impl Authenticator for DefaultAuthenticator {
    fn authenticate(&self, params: &HandshakeParams) -> Result<(), String> {
        if params.tenant_id.as_deref().unwrap_or("").is_empty() {
            return Err("missing tenant context".to_string());
        }
        Ok(())
    }
}
