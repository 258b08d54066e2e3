//! Centralized logic for initializing http clients to
//! ensure uniform configuration.

use crate::errors::RebuildResult;

/// Settings for http clients
///
/// Any settings that should apply to all http requests should
/// be stored here, to avoid different configurations.
#[derive(Debug, Clone, Default)]
pub struct ClientSettings {
    /// Optional per-request timeout
    pub timeout: Option<std::time::Duration>,
}

impl ClientSettings {
    /// Create new ClientSettings using all necessary values
    pub fn new() -> Self {
        Self::default()
    }
}

/// Create the process-wide reqwest client.
///
/// Ideally this should be called only once and reused; the client is
/// stateless per request, so sharing it is safe.
pub fn create_client(settings: &ClientSettings) -> RebuildResult<reqwest::Client> {
    let mut builder = reqwest::Client::builder().user_agent(concat!(
        "rebuildr/",
        env!("CARGO_PKG_VERSION")
    ));
    if let Some(timeout) = settings.timeout {
        builder = builder.timeout(timeout);
    }
    Ok(builder.build()?)
}
