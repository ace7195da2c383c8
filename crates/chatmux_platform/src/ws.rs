#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Context;
use futures_util::stream::{SplitSink, SplitStream};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::Message;

use crate::BoxFuture;

/// Byte transport a websocket can run over. Boxed so production TCP and
/// in-memory test pipes share one stream type.
pub(crate) trait WsTransport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> WsTransport for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub(crate) type WsStream = WebSocketStream<Box<dyn WsTransport>>;
pub(crate) type WsWriter = SplitSink<WsStream, Message>;
pub(crate) type WsReader = SplitStream<WsStream>;

/// Produces a fresh websocket connection; injectable for tests.
pub(crate) type WsConnector = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<WsStream>> + Send + Sync>;

/// Dial a plaintext `ws://` endpoint.
pub(crate) async fn dial_plain(addr: &str, url: &str) -> anyhow::Result<WsStream> {
	let tcp = TcpStream::connect(addr).await.with_context(|| format!("tcp connect to {addr}"))?;
	let transport: Box<dyn WsTransport> = Box::new(tcp);
	let (ws, _resp) = tokio_tungstenite::client_async(url, transport)
		.await
		.with_context(|| format!("websocket handshake with {url}"))?;
	Ok(ws)
}
