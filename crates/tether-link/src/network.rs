use tokio::net::{TcpListener, TcpStream};
use tracing::info;

use crate::LinkError;

/// Local TCP side of the bridge. Bound on loopback, accepts one peer.
#[derive(Debug)]
pub struct NetworkEndpoint {
    listener: TcpListener,
    port: u16,
}

impl NetworkEndpoint {
    pub async fn bind(port: u16) -> Result<Self, LinkError> {
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .map_err(|source| LinkError::Bind { port, source })?;
        info!("network: listening on 127.0.0.1:{}", port);
        Ok(Self { listener, port })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Address handed to the vehicle endpoint.
    pub fn address(&self) -> String {
        format!("tcp://:{}", self.port)
    }

    /// Wait for the peer, then release the listener so the port is not held
    /// by anything but the accepted socket.
    pub async fn accept(self) -> Result<TcpStream, LinkError> {
        let port = self.port;
        let (stream, peer) = self
            .listener
            .accept()
            .await
            .map_err(|source| LinkError::Accept { port, source })?;
        let _ = stream.set_nodelay(true);
        info!("network: peer {} attached on port {}", peer, port);
        Ok(stream)
    }
}
