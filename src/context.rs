use std::sync::Arc;

use tracing::info;

use crate::backend::{Backend, BackendError, MemoryBackend, SocketBackend};
use crate::config::AppConfig;
use crate::http::{HttpServer, Router};
use crate::rpc::UbusGateway;

/// Everything a running server shares: the loaded configuration and, when
/// the gateway is enabled, the bus connection.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub backend: Option<Arc<dyn Backend>>,
}

impl AppContext {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(config),
            backend: None,
        }
    }

    pub fn with_backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Open the bus backend the configuration asks for. Without a gateway
    /// prefix no backend is needed.
    pub async fn connect(config: AppConfig) -> Result<Self, BackendError> {
        let ctx = Self::new(config);
        if ctx.config.ubus_prefix.is_none() {
            return Ok(ctx);
        }

        let backend: Arc<dyn Backend> = if ctx.config.simulation {
            info!("Using simulated bus");
            Arc::new(MemoryBackend::simulation())
        } else {
            match ctx.config.ubus_socket.as_deref() {
                Some(addr) => Arc::new(SocketBackend::connect(addr).await?),
                None => return Err(BackendError::Disconnected),
            }
        };
        Ok(ctx.with_backend(backend))
    }

    pub fn router(&self) -> Router {
        let mut router = Router::new();
        for alias in self.config.aliases() {
            router = router.with_alias(alias);
        }
        if let Some(captive) = self.config.captive() {
            router = router.with_captive(captive);
        }
        if let (Some(gateway), Some(backend)) = (self.config.gateway_config(), &self.backend) {
            info!(prefix = %gateway.prefix, noauth = gateway.noauth, "JSON-RPC gateway enabled");
            router = router.with_handler(Arc::new(UbusGateway::new(backend.clone(), gateway)));
        }
        router
    }

    pub fn server(&self) -> HttpServer {
        HttpServer::new(
            self.router(),
            self.config.connection_config(),
            self.config.max_connections,
        )
    }
}
