use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};

use talon_protocol::handshake::SocketNetwork;

use crate::error::{BrokerError, Result};

/// Object-safe alias for the two socket flavours a subprocess can offer.
pub(crate) trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub(crate) type BoxedStream = Box<dyn AsyncStream>;

/// Connect to a handshake-declared address within `timeout`.
pub(crate) async fn dial(
    network: SocketNetwork,
    address: &str,
    timeout: Duration,
) -> Result<BoxedStream> {
    let connect = async {
        match network {
            SocketNetwork::Unix => UnixStream::connect(address)
                .await
                .map(|s| Box::new(s) as BoxedStream),
            SocketNetwork::Tcp => TcpStream::connect(address)
                .await
                .map(|s| Box::new(s) as BoxedStream),
        }
    };

    match tokio::time::timeout(timeout, connect).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(BrokerError::Dial {
            address: address.to_string(),
            reason: e.to_string(),
        }),
        Err(_) => Err(BrokerError::Dial {
            address: address.to_string(),
            reason: format!("connect timed out after {}ms", timeout.as_millis()),
        }),
    }
}
