//! Transport abstraction for relay connections.
//!
//! A [`Transport`] opens one framed, bidirectional socket to an endpoint.
//! [`WebSocketTransport`] is the real implementation; `memory::MemoryTransport`
//! connects to in-process relays so the engine can run without sockets.

use crate::endpoint::EndpointId;
use crate::error::{ClientError, Result};
use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt, future};
use std::pin::Pin;
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// One websocket-level frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    Text(String),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

pub type FrameSink = Pin<Box<dyn Sink<WireFrame, Error = ClientError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<WireFrame>> + Send>>;

/// An open connection, split into its write and read halves.
pub struct Socket {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

/// Provider trait for opening relay connections.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(&self, endpoint: &EndpointId) -> Result<Socket>;
}

/// Real websocket networking via tokio-tungstenite.
#[derive(Debug, Clone, Default)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, endpoint: &EndpointId) -> Result<Socket> {
        let (ws, _) = connect_async(endpoint.as_str())
            .await
            .map_err(|e| ClientError::WebSocket(e.to_string()))?;
        let (sink, stream) = ws.split();

        let sink = sink
            .sink_map_err(|e| ClientError::WebSocket(e.to_string()))
            .with(|frame: WireFrame| future::ready(Ok::<_, ClientError>(to_message(frame))));

        let stream = stream.filter_map(|message| {
            future::ready(match message {
                Ok(message) => from_message(message).map(Ok),
                Err(e) => Some(Err(ClientError::WebSocket(e.to_string()))),
            })
        });

        Ok(Socket {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

fn to_message(frame: WireFrame) -> Message {
    match frame {
        WireFrame::Text(text) => Message::Text(text.into()),
        WireFrame::Ping(data) => Message::Ping(data.into()),
        WireFrame::Pong(data) => Message::Pong(data.into()),
        WireFrame::Close => Message::Close(None),
    }
}

fn from_message(message: Message) -> Option<WireFrame> {
    match message {
        Message::Text(text) => Some(WireFrame::Text(text.to_string())),
        Message::Ping(data) => Some(WireFrame::Ping(data.to_vec())),
        Message::Pong(data) => Some(WireFrame::Pong(data.to_vec())),
        Message::Close(_) => Some(WireFrame::Close),
        // Binary and raw frames carry nothing for this protocol.
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_conversion() {
        let frames = vec![
            WireFrame::Text("[\"EOSE\",\"a\"]".to_string()),
            WireFrame::Ping(vec![1, 2]),
            WireFrame::Pong(vec![3]),
            WireFrame::Close,
        ];
        for frame in frames {
            assert_eq!(from_message(to_message(frame.clone())), Some(frame));
        }
        assert_eq!(from_message(Message::Binary(vec![0u8].into())), None);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let endpoint = EndpointId::parse("ws://127.0.0.1:1").unwrap();
        let result = WebSocketTransport::new().connect(&endpoint).await;
        assert!(matches!(result, Err(ClientError::WebSocket(_))));
    }
}
