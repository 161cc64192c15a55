use super::{ABNORMAL_CLOSURE, Connector, Inbound, Link, Outbound, TransportError};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, trace};
use url::Url;

/// tokio-tungstenite backed connector.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<Link, TransportError> {
        let parsed = Url::parse(url).map_err(|err| TransportError::InvalidUrl {
            url: url.to_string(),
            reason: err.to_string(),
        })?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(TransportError::InvalidUrl {
                url: url.to_string(),
                reason: format!("unsupported scheme {}", parsed.scheme()),
            });
        }
        let (stream, response) = connect_async(parsed.as_str())
            .await
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        debug!(
            target = "arena::transport",
            url = %parsed,
            status = %response.status(),
            "websocket connected"
        );

        let (tx_out, rx_out) = mpsc::unbounded_channel();
        let (tx_in, rx_in) = mpsc::unbounded_channel();
        tokio::spawn(pump(stream, rx_out, tx_in));
        Ok(Link {
            outbound: tx_out,
            inbound: rx_in,
        })
    }
}

async fn pump(
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut rx_out: mpsc::UnboundedReceiver<Outbound>,
    tx_in: mpsc::UnboundedSender<Inbound>,
) {
    let (mut ws_sender, mut ws_receiver) = stream.split();

    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx_out.recv().await {
            match frame {
                Outbound::Text(text) => {
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close { code, reason } => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.into(),
                    };
                    let _ = ws_sender.send(Message::Close(Some(frame))).await;
                    break;
                }
            }
        }
    });

    let mut code = Some(ABNORMAL_CLOSURE);
    let mut reason = String::new();
    while let Some(message) = ws_receiver.next().await {
        match message {
            Ok(Message::Text(text)) => {
                if tx_in.send(Inbound::Text(text)).is_err() {
                    break;
                }
            }
            Ok(Message::Binary(bytes)) => {
                let text = String::from_utf8_lossy(&bytes).into_owned();
                if tx_in.send(Inbound::Text(text)).is_err() {
                    break;
                }
            }
            Ok(Message::Close(frame)) => {
                match frame {
                    Some(frame) => {
                        code = Some(u16::from(frame.code));
                        reason = frame.reason.into_owned();
                    }
                    None => code = None,
                }
                break;
            }
            Ok(_) => {}
            Err(err) => {
                trace!(target = "arena::transport", error = %err, "websocket read failed");
                break;
            }
        }
    }

    let _ = tx_in.send(Inbound::Closed { code, reason });
    send_task.abort();
    let _ = send_task.await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::NORMAL_CLOSURE;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn rejects_non_websocket_urls() {
        for url in ["http://127.0.0.1:8080/fs/lab-1", "file:///tmp/socket", "not a url"] {
            let err = WebSocketConnector.connect(url).await.unwrap_err();
            let TransportError::InvalidUrl { url: reported, .. } = err else {
                panic!("expected InvalidUrl for {url}, got {err:?}");
            };
            assert_eq!(reported, url);
        }
        let err = WebSocketConnector.connect("https://lab.test/pty").await.unwrap_err();
        assert!(err.to_string().contains("unsupported scheme https"), "{err}");
    }

    #[tokio::test]
    async fn unreachable_host_is_a_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = WebSocketConnector
            .connect(&format!("ws://{addr}/fs/lab-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Connect(_)), "{err:?}");
    }

    #[tokio::test]
    async fn relays_text_and_close_code() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let Some(Ok(Message::Text(text))) = ws.next().await else {
                panic!("expected a text frame");
            };
            ws.send(Message::Text(format!("echo:{text}"))).await.unwrap();
            let _ = ws
                .close(Some(CloseFrame {
                    code: CloseCode::Away,
                    reason: "bye".into(),
                }))
                .await;
        });

        let mut link = WebSocketConnector
            .connect(&format!("ws://{addr}/pty/lab-1"))
            .await
            .unwrap();
        link.outbound.send(Outbound::Text("ping".into())).unwrap();
        assert_eq!(link.inbound.recv().await, Some(Inbound::Text("echo:ping".into())));
        assert_eq!(
            link.inbound.recv().await,
            Some(Inbound::Closed {
                code: Some(1001),
                reason: "bye".into(),
            })
        );
        let _ = link.outbound.send(Outbound::Close {
            code: NORMAL_CLOSURE,
            reason: String::new(),
        });
        server.await.unwrap();
    }
}
