//! Line-oriented transport behind the probe channel.
//!
//! Sessions only need to send a text line, wait for the next one and close,
//! so the WebSocket stack sits behind two small traits that tests replace
//! with in-memory sockets.

use super::ProbeError;
use crate::ookla::requests::user_agent;
use futures::{SinkExt, StreamExt};
use log::debug;
use std::future::Future;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// An open probe channel to one measurement server.
pub trait ProbeSocket: Send {
    /// Send one text line.
    fn send(
        &mut self,
        line: String,
    ) -> impl Future<Output = Result<(), ProbeError>> + Send;

    /// Wait for the next text message. `None` once the server has closed the
    /// channel.
    fn recv(
        &mut self,
    ) -> impl Future<Output = Option<Result<String, ProbeError>>> + Send;

    /// Close the channel. Errors are not interesting at this point.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Opens probe channels by server host.
pub trait ProbeConnector: Send + Sync + 'static {
    type Socket: ProbeSocket + 'static;

    /// Connect to `host` (`hostname:port`).
    fn connect(
        &self,
        host: &str,
    ) -> impl Future<Output = Result<Self::Socket, ProbeError>> + Send;
}

/// Connects to `wss://{host}/ws`.
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector;

impl ProbeConnector for WebSocketConnector {
    type Socket = WebSocketProbe;

    fn connect(
        &self,
        host: &str,
    ) -> impl Future<Output = Result<Self::Socket, ProbeError>> + Send {
        let url = format!("wss://{}/ws", host);

        async move {
            debug!("Opening probe channel {}", url);

            let mut request = url.into_client_request()?;
            if let Ok(agent) = HeaderValue::from_str(&user_agent()) {
                request.headers_mut().insert("User-Agent", agent);
            }

            let (stream, _) = tokio_tungstenite::connect_async(request).await?;

            Ok(WebSocketProbe { stream })
        }
    }
}

pub struct WebSocketProbe {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl ProbeSocket for WebSocketProbe {
    fn send(
        &mut self,
        line: String,
    ) -> impl Future<Output = Result<(), ProbeError>> + Send {
        async move { Ok(self.stream.send(Message::Text(line)).await?) }
    }

    fn recv(
        &mut self,
    ) -> impl Future<Output = Option<Result<String, ProbeError>>> + Send {
        async move {
            loop {
                match self.stream.next().await? {
                    Ok(Message::Text(text)) => return Some(Ok(text)),
                    Ok(Message::Binary(data)) => {
                        return Some(Ok(String::from_utf8_lossy(&data).into_owned()))
                    }
                    Ok(Message::Close(_)) => return None,
                    // Control frames are answered by tungstenite itself.
                    Ok(_) => continue,
                    Err(e) => return Some(Err(e.into())),
                }
            }
        }
    }

    fn close(&mut self) -> impl Future<Output = ()> + Send {
        async move {
            if let Err(e) = self.stream.close(None).await {
                debug!("Probe channel close failed: {}", e);
            }
        }
    }
}
