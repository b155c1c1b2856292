//! Transport seam between the connection manager and the socket.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

use crate::error::{ConnectError, TransportError};

/// What the socket delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Closed { reason: String },
    Failed { error: String },
}

/// An open transport as a pair of channels.
///
/// Dropping `outbound` closes the underlying socket.
#[derive(Debug)]
pub struct TransportLink {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<Inbound>,
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(&self, url: &Url) -> Result<TransportLink, TransportError>;
}

/// WebSocket transport over `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, url: &Url) -> Result<TransportLink, TransportError> {
        let (stream, _response) =
            connect_async(url.as_str())
                .await
                .map_err(|error| TransportError::Open {
                    url: url.to_string(),
                    message: error.to_string(),
                })?;
        let (mut writer, mut reader) = stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let gateway_url = url.to_string();

        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(error) = writer.send(Message::Text(text.into())).await {
                    warn!("websocket write error on {}: {}", gateway_url, error);
                    return;
                }
            }
            if let Err(error) = writer.send(Message::Close(None)).await {
                debug!("websocket close error on {}: {}", gateway_url, error);
            }
        });

        let gateway_url = url.to_string();
        tokio::spawn(async move {
            while let Some(frame) = reader.next().await {
                let inbound = match frame {
                    Ok(Message::Text(text)) => Inbound::Text(text.as_str().to_owned()),
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => Inbound::Text(text),
                        Err(_) => {
                            debug!("ignoring non-utf8 binary frame from {}", gateway_url);
                            continue;
                        }
                    },
                    Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => continue,
                    Ok(Message::Close(frame)) => {
                        let reason = frame
                            .map(|frame| frame.reason.to_string())
                            .filter(|reason| !reason.is_empty())
                            .unwrap_or_else(|| "closed by gateway".to_string());
                        let _ = inbound_tx.send(Inbound::Closed { reason });
                        return;
                    }
                    Err(error) => {
                        warn!("websocket read error on {}: {}", gateway_url, error);
                        let _ = inbound_tx.send(Inbound::Failed {
                            error: error.to_string(),
                        });
                        return;
                    }
                };
                if inbound_tx.send(inbound).is_err() {
                    return;
                }
            }
            let _ = inbound_tx.send(Inbound::Closed {
                reason: "stream ended".to_string(),
            });
        });

        Ok(TransportLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

/// Parse a user-supplied gateway address into a `ws`/`wss` URL.
///
/// `http`/`https` map to `ws`/`wss`; a bare `host:port` gets `ws://`.
pub fn normalize_gateway_url(raw: &str) -> Result<Url, ConnectError> {
    let trimmed = raw.trim();
    let invalid = |reason: String| ConnectError::InvalidUrl {
        url: raw.to_string(),
        reason,
    };
    if trimmed.is_empty() {
        return Err(invalid("empty address".to_string()));
    }
    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("ws://{trimmed}")
    };
    let mut url = Url::parse(&candidate).map_err(|error| invalid(error.to_string()))?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => return Err(invalid(format!("unsupported scheme `{other}`"))),
    };
    if url.scheme() != scheme {
        url.set_scheme(scheme)
            .map_err(|()| invalid(format!("cannot switch scheme to {scheme}")))?;
    }
    if url.host_str().is_none() {
        return Err(invalid("missing host".to_string()));
    }
    Ok(url)
}

/// Same address with the secure/insecure scheme swapped.
#[must_use]
pub fn alternate_scheme(url: &Url) -> Option<Url> {
    let target = match url.scheme() {
        "wss" => "ws",
        "ws" => "wss",
        _ => return None,
    };
    let mut alternate = url.clone();
    alternate.set_scheme(target).ok()?;
    Some(alternate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_common_address_forms() {
        let cases = [
            ("ws://localhost:18789", "ws://localhost:18789/"),
            ("wss://gateway.example:443/ws", "wss://gateway.example/ws"),
            ("http://127.0.0.1:18789", "ws://127.0.0.1:18789/"),
            ("https://gateway.example", "wss://gateway.example/"),
            ("localhost:18789", "ws://localhost:18789/"),
            ("  ws://host:1  ", "ws://host:1/"),
        ];
        for (input, expected) in cases {
            let url = normalize_gateway_url(input).expect(input);
            assert_eq!(url.as_str(), expected, "input {input}");
        }
    }

    #[test]
    fn rejects_unusable_addresses() {
        for input in ["", "ftp://host", "ws://"] {
            assert!(
                matches!(
                    normalize_gateway_url(input),
                    Err(ConnectError::InvalidUrl { .. })
                ),
                "input {input:?}"
            );
        }
    }

    #[test]
    fn alternate_scheme_swaps_both_directions() {
        let secure = Url::parse("wss://host:18789/").expect("url");
        let insecure = alternate_scheme(&secure).expect("alternate");
        assert_eq!(insecure.as_str(), "ws://host:18789/");
        assert_eq!(
            alternate_scheme(&insecure).expect("alternate").as_str(),
            "wss://host:18789/"
        );
    }
}
