//! Process-wide shared runtime.
//!
//! Callers that opt into sharing get one [`ClientRuntime`] per process. It
//! always has an idle timeout, and once it has torn itself down the next
//! caller transparently gets a fresh one.

use std::sync::Arc;

use ferrule_settings::ClientSettings;
use parking_lot::Mutex;
use tracing::info;

use crate::errors::ClientError;
use crate::runtime::ClientRuntime;
use crate::transport::{Transport, WsTransport};

static SHARED: Mutex<Option<ClientRuntime>> = parking_lot::const_mutex(None);

/// The live shared runtime, creating it from `settings` if there is none.
///
/// `settings` only matter when a new runtime is created; `shared` is forced
/// on.
pub fn shared_runtime(settings: &ClientSettings) -> Result<ClientRuntime, ClientError> {
    shared_runtime_with_transport(settings, Arc::new(WsTransport))
}

/// [`shared_runtime`] with a custom transport for newly created runtimes.
pub fn shared_runtime_with_transport(
    settings: &ClientSettings,
    transport: Arc<dyn Transport>,
) -> Result<ClientRuntime, ClientError> {
    let mut slot = SHARED.lock();
    if let Some(runtime) = slot.as_ref().filter(|rt| !rt.is_closed()) {
        return Ok(runtime.clone());
    }
    let mut settings = settings.clone();
    settings.container.shared = true;
    let runtime = ClientRuntime::with_transport(settings, transport)?;
    info!(runtime_id = %runtime.id(), "shared client runtime started");
    *slot = Some(runtime.clone());
    Ok(runtime)
}

/// Detach the shared runtime, if any, so the next caller starts a new one.
/// The detached runtime keeps running until shut down or idle.
pub fn release_shared() -> Option<ClientRuntime> {
    SHARED.lock().take()
}
