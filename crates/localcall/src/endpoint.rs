//! The per-process façade over host and callers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::caller::{CallerConfig, ServiceCaller};
use crate::error::Result;
use crate::host::{Handler, ServiceHost};
use crate::registry;

/// The single object a program instantiates: registers services on a
/// shared host, hands out cached caller stubs, and drives the dispatch
/// loop.
///
/// One endpoint per process is the common shape, but nothing requires
/// it; several endpoints coexist as long as their service names differ.
pub struct Endpoint {
    host: ServiceHost,
    callers: Mutex<HashMap<String, Arc<ServiceCaller>>>,
}

impl Endpoint {
    /// Create an endpoint, constructing the runtime directory if it does
    /// not exist yet.
    pub fn new() -> Result<Self> {
        std::fs::create_dir_all(registry::runtime_dir())?;
        Ok(Self {
            host: ServiceHost::new(),
            callers: Mutex::new(HashMap::new()),
        })
    }

    /// Register `handler` under `name` and start listening.
    pub fn create_service<H: Handler>(&self, name: &str, handler: H) -> Result<()> {
        self.host.register(name, handler)
    }

    /// Stop serving `name` and unlink its socket.
    pub fn remove_service(&self, name: &str) -> Result<()> {
        self.host.unregister(name)
    }

    /// A caller stub for `name`. Stubs are cached one per name; every
    /// call still opens its own connection.
    pub fn create_service_caller(&self, name: &str) -> Result<Arc<ServiceCaller>> {
        let mut callers = self.callers.lock();
        if let Some(caller) = callers.get(name) {
            return Ok(caller.clone());
        }
        let caller = Arc::new(ServiceCaller::new(name)?);
        callers.insert(name.to_owned(), caller.clone());
        Ok(caller)
    }

    /// Like [`create_service_caller`](Self::create_service_caller) with
    /// explicit tunables. Replaces any cached stub for `name`.
    pub fn create_service_caller_with_config(
        &self,
        name: &str,
        config: CallerConfig,
    ) -> Result<Arc<ServiceCaller>> {
        let caller = Arc::new(ServiceCaller::with_config(name, config)?);
        self.callers.lock().insert(name.to_owned(), caller.clone());
        Ok(caller)
    }

    /// Serve registered services until the future is dropped.
    pub async fn spin(&self) -> Result<()> {
        self.host.run_forever().await
    }

    /// Handle at most one call, waiting up to `timeout` for a
    /// connection. Returns whether a call was handled.
    pub async fn spin_once(&self, timeout: Duration) -> Result<bool> {
        self.host.run_one(timeout).await
    }

    /// The underlying host, for direct `run_one`/`run_forever` control.
    pub fn host(&self) -> &ServiceHost {
        &self.host
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn caller_stubs_are_cached_per_name() {
        let endpoint = Endpoint::new().unwrap();
        let a = endpoint.create_service_caller("endpoint-cache-test").unwrap();
        let b = endpoint.create_service_caller("endpoint-cache-test").unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let c = endpoint.create_service_caller("endpoint-cache-other").unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn caller_config_replaces_cached_stub() {
        let endpoint = Endpoint::new().unwrap();
        let a = endpoint.create_service_caller("endpoint-cfg-test").unwrap();
        let b = endpoint
            .create_service_caller_with_config(
                "endpoint-cfg-test",
                CallerConfig {
                    connect_timeout: Duration::from_millis(10),
                    call_timeout: Some(Duration::from_secs(1)),
                },
            )
            .unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        let c = endpoint.create_service_caller("endpoint-cfg-test").unwrap();
        assert!(Arc::ptr_eq(&b, &c));
    }

    #[tokio::test]
    async fn invalid_names_never_reach_the_filesystem() {
        let endpoint = Endpoint::new().unwrap();
        assert!(endpoint.create_service_caller("a/b").is_err());
        assert!(endpoint
            .create_service(
                "a/b",
                |req: &[u8]| -> std::result::Result<Vec<u8>, String> { Ok(req.to_vec()) }
            )
            .is_err());
    }
}
