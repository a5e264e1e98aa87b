//! Image-generation WebSocket connector (C4).
//!
//! Grounded on `app/services/reverse/ws_imagine.py` (`ImagineWebSocketReverse`):
//! opens one WebSocket per prompt, sends the request message, and yields raw
//! inbound messages. Classification into preview/medium/final stages is the
//! stream processor's job (C5.4, `stream::image_ws_processor`), kept separate
//! so this connector stays a pure I/O adapter.

use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;

use crate::error::UpstreamError;

/// One raw inbound WebSocket message, either the upstream's JSON envelope
/// text or a binary image blob.
pub enum RawWsMessage {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

pub struct ImageWsSession {
    stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
}

impl ImageWsSession {
    /// Connects to `wss://<upstream>/ws/imagine/listen` and sends the
    /// request envelope built from `prompt`/`n`/`model`.
    pub async fn connect(
        ws_url: &str,
        cookie: &str,
        prompt: &str,
        n: u32,
        model_name: &str,
    ) -> Result<Self, UpstreamError> {
        let mut request = ws_url
            .into_client_request()
            .map_err(|err| UpstreamError::new(502, format!("invalid websocket url: {err}")))?;
        request
            .headers_mut()
            .insert("Cookie", cookie.parse().map_err(|_| UpstreamError::new(502, "invalid cookie header"))?);

        let (mut stream, _response) = connect_async(request)
            .await
            .map_err(|err| UpstreamError::new(502, format!("websocket connect failed: {err}")))?;

        let envelope = json!({
            "prompt": prompt,
            "imageCount": n,
            "modelName": model_name,
        });
        stream
            .send(Message::Text(envelope.to_string().into()))
            .await
            .map_err(|err| UpstreamError::new(502, format!("websocket send failed: {err}")))?;

        Ok(Self { stream })
    }

    /// Receives the next message with a caller-supplied timeout; `Ok(None)`
    /// signals a clean stream end.
    pub async fn recv(&mut self, timeout: std::time::Duration) -> Result<Option<RawWsMessage>, UpstreamError> {
        let next = tokio::time::timeout(timeout, self.stream.next()).await;
        match next {
            Err(_) => Ok(None),
            Ok(None) => Ok(None),
            Ok(Some(Err(err))) => Err(UpstreamError::new(502, format!("websocket recv error: {err}"))),
            Ok(Some(Ok(Message::Text(text)))) => Ok(Some(RawWsMessage::Text(text.to_string()))),
            Ok(Some(Ok(Message::Binary(bytes)))) => Ok(Some(RawWsMessage::Binary(bytes.to_vec()))),
            Ok(Some(Ok(Message::Close(_)))) => Ok(Some(RawWsMessage::Close)),
            Ok(Some(Ok(_))) => Ok(None),
        }
    }

    pub async fn close(mut self) {
        let _ = self.stream.close(None).await;
    }
}
