//! MITM proxy server.
//!
//! Binds the hudsucker engine to a [`Pipeline`] through [`FlowHandler`].

use std::net::SocketAddr;
use std::sync::Arc;

use hudsucker::rustls::crypto::aws_lc_rs::default_provider;
use hudsucker::Proxy;
use snare_core::{SnareConfig, DEFAULT_PROXY_PORT};
use tokio::sync::broadcast;

use crate::ca::{CaError, CaManager};
use crate::error::{ProxyError, Result};
use crate::handler::FlowHandler;
use crate::pipeline::Pipeline;

/// Proxy server configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address to bind the proxy to.
    pub addr: SocketAddr,
    /// CA used to sign per-host certificates.
    pub ca_manager: CaManager,
}

impl ProxyConfig {
    /// Listens on 127.0.0.1 at the default port.
    pub fn new(ca_manager: CaManager) -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PROXY_PORT)),
            ca_manager,
        }
    }

    /// Builds the configuration from loaded settings. Both CA paths are required.
    pub fn from_settings(settings: &SnareConfig) -> Result<Self> {
        let addr: SocketAddr = settings
            .listen_addr()
            .parse()
            .map_err(|e| ProxyError::Proxy(format!("invalid listen address: {}", e)))?;

        let (Some(cert), Some(key)) = (&settings.proxy.ca_cert, &settings.proxy.ca_key) else {
            return Err(ProxyError::Ca(CaError::NotFound(
                "no CA certificate configured".to_string(),
            )));
        };

        Ok(Self {
            addr,
            ca_manager: CaManager::new(cert, key),
        })
    }

    /// Sets the listen address.
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    /// Sets the port (uses 127.0.0.1 as host).
    pub fn with_port(mut self, port: u16) -> Self {
        self.addr = SocketAddr::from(([127, 0, 0, 1], port));
        self
    }
}

/// MITM proxy server driving a [`Pipeline`].
pub struct ProxyServer {
    config: ProxyConfig,
    pipeline: Arc<Pipeline>,
}

impl ProxyServer {
    /// Creates a new proxy server. Fails if the CA files are missing.
    pub fn new(config: ProxyConfig, pipeline: Arc<Pipeline>) -> Result<Self> {
        config.ca_manager.ensure_exists()?;
        Ok(Self { config, pipeline })
    }

    /// Returns the address the proxy is configured to listen on.
    pub fn addr(&self) -> SocketAddr {
        self.config.addr
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Starts the proxy server.
    ///
    /// This will block until the server is shut down.
    pub async fn run(self) -> Result<()> {
        let authority = self.config.ca_manager.load_authority()?;
        let handler = FlowHandler::new(self.pipeline.clone());

        tracing::info!("Starting MITM proxy on {}", self.config.addr);
        tracing::info!("CA certificate: {:?}", self.config.ca_manager.cert_path());

        let proxy = Proxy::builder()
            .with_addr(self.config.addr)
            .with_ca(authority)
            .with_rustls_connector(default_provider())
            .with_http_handler(handler)
            .build()
            .map_err(|e| ProxyError::Proxy(e.to_string()))?;

        let janitor = self.pipeline.spawn_janitor();
        let result = proxy
            .start()
            .await
            .map_err(|e| ProxyError::Proxy(e.to_string()));
        janitor.abort();
        result?;

        tracing::info!("Proxy server stopped");
        Ok(())
    }

    /// Starts the proxy server in the background.
    ///
    /// Returns a handle that can be used to stop the server.
    pub fn start(self) -> Result<ProxyHandle> {
        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let shutdown_tx_clone = shutdown_tx.clone();
        let addr = self.config.addr;

        // Load CA authority before spawning
        let authority = self.config.ca_manager.load_authority()?;
        let pipeline = self.pipeline;

        let handle = tokio::spawn(async move {
            let handler = FlowHandler::new(pipeline.clone());

            let proxy = match Proxy::builder()
                .with_addr(addr)
                .with_ca(authority)
                .with_rustls_connector(default_provider())
                .with_http_handler(handler)
                .build()
            {
                Ok(p) => p,
                Err(e) => {
                    tracing::error!("Failed to build proxy: {}", e);
                    return;
                }
            };

            let janitor = pipeline.spawn_janitor();
            let mut shutdown_rx = shutdown_tx.subscribe();

            tokio::select! {
                result = proxy.start() => {
                    if let Err(e) = result {
                        tracing::error!("Proxy error: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Proxy shutdown signal received");
                }
            };

            janitor.abort();
        });

        Ok(ProxyHandle {
            shutdown_tx: shutdown_tx_clone,
            addr,
            handle,
        })
    }
}

/// Handle for controlling a running proxy server.
pub struct ProxyHandle {
    shutdown_tx: broadcast::Sender<()>,
    addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
}

impl ProxyHandle {
    /// Returns the address the proxy is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signals the proxy to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Waits for the proxy to finish.
    pub async fn wait(self) {
        let _ = self.handle.await;
    }

    /// Shuts down the proxy and waits for it to finish.
    pub async fn stop(self) {
        self.shutdown();
        self.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineConfig;
    use hudsucker::rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair, KeyUsagePurpose};
    use std::path::Path;
    use tempfile::TempDir;

    fn write_ca(dir: &Path) -> CaManager {
        let key_pair = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec!["Snare Test CA".to_string()]).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        let cert = params.self_signed(&key_pair).unwrap();

        let manager = CaManager::new(dir.join("ca.crt"), dir.join("ca.key"));
        std::fs::write(manager.cert_path(), cert.pem()).unwrap();
        std::fs::write(manager.key_path(), key_pair.serialize_pem()).unwrap();
        manager
    }

    fn test_config(dir: &TempDir) -> ProxyConfig {
        ProxyConfig::new(write_ca(dir.path())).with_addr(SocketAddr::from(([127, 0, 0, 1], 0)))
    }

    #[test]
    fn proxy_config_with_port() {
        let config = ProxyConfig::new(CaManager::new("ca.crt", "ca.key")).with_port(8888);
        assert_eq!(config.addr.port(), 8888);
    }

    #[test]
    fn proxy_config_defaults_to_loopback() {
        let config = ProxyConfig::new(CaManager::new("ca.crt", "ca.key"));
        assert_eq!(config.addr, SocketAddr::from(([127, 0, 0, 1], DEFAULT_PROXY_PORT)));
    }

    #[test]
    fn proxy_config_from_settings() {
        let mut settings = SnareConfig::default();
        settings.proxy.host = "0.0.0.0".to_string();
        settings.proxy.port = 8081;
        settings.proxy.ca_cert = Some("/etc/snare/ca.crt".into());
        settings.proxy.ca_key = Some("/etc/snare/ca.key".into());

        let config = ProxyConfig::from_settings(&settings).unwrap();
        assert_eq!(config.addr, SocketAddr::from(([0, 0, 0, 0], 8081)));
        assert_eq!(config.ca_manager.cert_path(), Path::new("/etc/snare/ca.crt"));
    }

    #[test]
    fn proxy_config_from_settings_requires_ca() {
        let settings = SnareConfig::default();
        assert!(matches!(
            ProxyConfig::from_settings(&settings),
            Err(ProxyError::Ca(CaError::NotFound(_)))
        ));
    }

    #[test]
    fn proxy_config_rejects_bad_host() {
        let mut settings = SnareConfig::default();
        settings.proxy.host = "not an address".to_string();
        settings.proxy.ca_cert = Some("ca.crt".into());
        settings.proxy.ca_key = Some("ca.key".into());
        assert!(matches!(
            ProxyConfig::from_settings(&settings),
            Err(ProxyError::Proxy(_))
        ));
    }

    #[test]
    fn proxy_server_requires_ca_files() {
        let temp_dir = TempDir::new().unwrap();
        let config = ProxyConfig::new(CaManager::new(
            temp_dir.path().join("missing.crt"),
            temp_dir.path().join("missing.key"),
        ));
        let (pipeline, _rx) = Pipeline::new(PipelineConfig::default());
        assert!(ProxyServer::new(config, pipeline).is_err());
    }

    #[test]
    fn proxy_server_new() {
        let temp_dir = TempDir::new().unwrap();
        let (pipeline, _rx) = Pipeline::new(PipelineConfig::default());
        let server = ProxyServer::new(test_config(&temp_dir), pipeline).unwrap();
        assert_eq!(server.addr().port(), 0);
        assert!(server.pipeline().processors().is_empty());
    }

    #[tokio::test]
    async fn proxy_handle_shutdown() {
        let temp_dir = TempDir::new().unwrap();
        let (pipeline, _rx) = Pipeline::new(PipelineConfig::default());
        let server = ProxyServer::new(test_config(&temp_dir), pipeline).unwrap();

        let handle = server.start().unwrap();

        // Give it a moment to start
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        handle.stop().await;
    }
}
