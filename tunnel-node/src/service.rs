//! Service listeners - local entry points of outbound tunnels.
//!
//! Each `[[services]]` entry binds a TCP listener; every accepted stream is
//! tunneled to the entry's `url_remote` on its peer device.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::config::ServiceConfig;
use crate::controller::Controller;

/// Pause after a failed accept (e.g. out of file descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// A bound listener for one configured service.
#[derive(Debug)]
pub struct ServiceListener {
    config: ServiceConfig,
    listener: TcpListener,
}

impl ServiceListener {
    /// Bind the service's listen address.
    pub async fn bind(config: ServiceConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(&config.listen).await?;
        info!(
            service = %config.name,
            listen = %listener.local_addr()?,
            url_remote = %config.url_remote,
            peer = %config.peer_device_id,
            "Service listening"
        );
        Ok(Self { config, listener })
    }

    /// Bound address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept forever, opening one tunnel per stream.
    pub async fn run(self, controller: Arc<Controller>) {
        loop {
            let (stream, addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(service = %self.config.name, error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                debug!(service = %self.config.name, error = %e, "Cannot set TCP_NODELAY");
            }
            debug!(service = %self.config.name, %addr, "Local client connected");

            let controller = Arc::clone(&controller);
            let service = self.config.clone();
            tokio::spawn(async move {
                if let Err(e) = controller
                    .open_outbound(service.peer_device_id, &service.url_remote, Box::new(stream))
                    .await
                {
                    warn!(service = %service.name, error = %e, "Cannot open tunnel");
                }
            });
        }
    }
}
