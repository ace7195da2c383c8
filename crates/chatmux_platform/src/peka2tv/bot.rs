#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use anyhow::Context;
use async_trait::async_trait;
use chatmux_domain::{BotError, Platform};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

use super::message::{PekaMessage, PekaUser};
use super::updater;
use crate::sink::Handler;
use crate::ws::{self, WsConnector, WsReader, WsWriter};
use crate::{Bot, BoxFuture};

const CHAT_ADDR: &str = "chat.peka2.tv:80";
const CHAT_URL: &str = "ws://chat.peka2.tv/";
const CURRENT_USER_URL: &str = "http://peka2.tv/api/user/current";
const STREAM_BY_SLUG_URL: &str = "http://peka2.tv/api/stream";

const MESSAGE_EVENT: &str = "/chat/message";
const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Socket-event envelope: `{"type": "/chat/...", "data": ...}`.
#[derive(Debug, Serialize, Deserialize)]
struct Frame {
	#[serde(rename = "type")]
	kind: String,
	#[serde(default)]
	data: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
struct CurrentUser {
	#[serde(default)]
	id: i64,
	#[serde(default)]
	name: String,
	#[serde(default)]
	block: bool,
	#[serde(default)]
	guest: bool,
}

#[derive(Debug, Deserialize)]
struct StreamInfo {
	#[serde(default)]
	owner: CurrentUser,
}

struct Inner {
	handler: Handler,
	http: reqwest::Client,
	channels: RwLock<HashMap<String, SystemTime>>,
	/// Set by a successful `login_by_token`; required for sending.
	auth: RwLock<Option<(PekaUser, String)>>,
	writer: tokio::sync::Mutex<Option<WsWriter>>,
	user_disconnect: AtomicBool,
	reconnect_delay: Duration,
	connector: Option<WsConnector>,
}

/// Peka2tv chat over websocket socket-events.
#[derive(Clone)]
pub struct PekaBot {
	inner: Arc<Inner>,
}

impl PekaBot {
	pub fn new(handler: Handler) -> Self {
		Self::with_connector(handler, None, DEFAULT_RECONNECT_DELAY)
	}

	fn with_connector(handler: Handler, connector: Option<WsConnector>, reconnect_delay: Duration) -> Self {
		Self {
			inner: Arc::new(Inner {
				handler,
				http: reqwest::Client::new(),
				channels: RwLock::new(HashMap::new()),
				auth: RwLock::new(None),
				writer: tokio::sync::Mutex::new(None),
				user_disconnect: AtomicBool::new(false),
				reconnect_delay,
				connector,
			}),
		}
	}

	/// Resolve the current user for `token` and log the chat session in.
	/// Blocked and guest accounts are rejected.
	pub async fn login_by_token(&self, token: &str) -> Result<(), BotError> {
		let user = self.current_user(token).await?;
		*self.inner.auth.write() = Some((user, token.to_string()));
		Inner::send_frame(&self.inner, "/chat/login", serde_json::json!({ "token": token })).await
	}

	async fn current_user(&self, token: &str) -> Result<PekaUser, BotError> {
		let user: CurrentUser = self
			.inner
			.http
			.post(CURRENT_USER_URL)
			.header("Token", format!("Bearer {token}"))
			.send()
			.await
			.context("requesting current user")
			.map_err(BotError::transport)?
			.json()
			.await
			.context("decoding current user")
			.map_err(BotError::parse)?;
		if user.block {
			return Err(BotError::auth("user blocked"));
		}
		if user.guest || user.id == 0 || user.name.is_empty() {
			return Err(BotError::auth("invalid token"));
		}
		Ok(PekaUser {
			id: user.id,
			name: user.name,
		})
	}

	/// Resolve a stream slug to its owner and join `stream/<owner id>`.
	pub async fn join_by_slug(&self, slug: &str) -> Result<(), BotError> {
		let info: StreamInfo = self
			.inner
			.http
			.post(STREAM_BY_SLUG_URL)
			.form(&[("slug", slug)])
			.send()
			.await
			.context("requesting stream by slug")
			.map_err(BotError::transport)?
			.json()
			.await
			.context("decoding stream by slug")
			.map_err(BotError::parse)?;
		if info.owner.id == 0 {
			return Err(BotError::lookup(format!("no stream for slug {slug}")));
		}
		self.join(&format!("stream/{}", info.owner.id)).await
	}
}

impl Inner {
	async fn dial(inner: &Arc<Self>) -> anyhow::Result<ws::WsStream> {
		match &inner.connector {
			Some(connector) => connector().await,
			None => ws::dial_plain(CHAT_ADDR, CHAT_URL).await,
		}
	}

	async fn send_frame(inner: &Arc<Self>, kind: &str, data: serde_json::Value) -> Result<(), BotError> {
		let frame = Frame {
			kind: kind.to_string(),
			data,
		};
		let text = serde_json::to_string(&frame).map_err(BotError::parse)?;
		let mut guard = inner.writer.lock().await;
		let writer = guard.as_mut().ok_or(BotError::NotConnected)?;
		writer.send(WsMessage::text(text)).await.map_err(BotError::transport)?;
		Ok(())
	}

	/// Dial, install the writer, and replay auth. Returns the read half.
	async fn establish(inner: &Arc<Self>) -> Result<WsReader, BotError> {
		let ws = Self::dial(inner).await.map_err(BotError::transport)?;
		let (writer, reader) = ws.split();
		*inner.writer.lock().await = Some(writer);
		let token = inner.auth.read().as_ref().map(|(_, token)| token.clone());
		if let Some(token) = token {
			Self::send_frame(inner, "/chat/login", serde_json::json!({ "token": token })).await?;
		}
		Ok(reader)
	}

	// Boxed: the future recurses through `reconnect_loop`, which spawns
	// `read_loop` again for the replacement connection.
	fn read_loop(inner: Arc<Self>, mut reader: WsReader) -> BoxFuture<'static, ()> {
		Box::pin(async move {
			while let Some(frame) = reader.next().await {
				match frame {
					Ok(WsMessage::Text(text)) => Self::handle_frame(&inner, text.as_str()),
					Ok(WsMessage::Ping(payload)) => {
						let mut guard = inner.writer.lock().await;
						if let Some(writer) = guard.as_mut()
							&& let Err(err) = writer.send(WsMessage::Pong(payload)).await
						{
							tracing::warn!("peka2tv pong failed: {err}");
						}
					}
					Ok(WsMessage::Close(_)) => break,
					Ok(_) => {}
					Err(err) => {
						tracing::warn!("peka2tv read error: {err}");
						break;
					}
				}
			}

			inner.writer.lock().await.take();
			if inner.user_disconnect.load(Ordering::SeqCst) {
				tracing::info!("peka2tv connection closed by disconnect");
				return;
			}
			tracing::warn!("peka2tv connection lost, reconnecting");
			Self::reconnect_loop(inner).await;
		})
	}

	fn handle_frame(inner: &Arc<Self>, text: &str) {
		let frame: Frame = match serde_json::from_str(text) {
			Ok(frame) => frame,
			Err(err) => {
				tracing::debug!("dropping unparsed peka2tv frame: {err}");
				return;
			}
		};
		if frame.kind != MESSAGE_EVENT {
			tracing::trace!(kind = %frame.kind, "ignoring peka2tv event");
			return;
		}
		match PekaMessage::from_payload(frame.data) {
			Ok(message) => (inner.handler)(Arc::new(message)),
			Err(err) => tracing::debug!("dropping unparsed peka2tv message: {err}"),
		}
	}

	async fn reconnect_loop(inner: Arc<Self>) {
		loop {
			tokio::time::sleep(inner.reconnect_delay).await;
			if inner.user_disconnect.load(Ordering::SeqCst) {
				return;
			}
			match Self::establish(&inner).await {
				Ok(reader) => {
					let channels: Vec<String> = inner.channels.read().keys().cloned().collect();
					for channel in channels {
						if let Err(err) = Self::send_frame(&inner, "/chat/join", serde_json::json!({ "channel": channel })).await {
							tracing::warn!(%channel, "peka2tv rejoin failed: {err}");
						}
					}
					tokio::spawn(Self::read_loop(inner, reader));
					return;
				}
				Err(err) => {
					tracing::warn!("peka2tv reconnect failed: {err}");
				}
			}
		}
	}
}

#[async_trait]
impl Bot for PekaBot {
	fn platform(&self) -> Platform {
		Platform::Peka2tv
	}

	async fn connect(&self) -> Result<(), BotError> {
		self.inner.user_disconnect.store(false, Ordering::SeqCst);
		self.inner.channels.write().clear();
		let reader = Inner::establish(&self.inner).await?;
		tokio::spawn(Inner::read_loop(self.inner.clone(), reader));
		updater::ensure_store_updater();
		Ok(())
	}

	async fn disconnect(&self) -> Result<(), BotError> {
		self.inner.user_disconnect.store(true, Ordering::SeqCst);
		self.inner.channels.write().clear();
		if let Some(mut writer) = self.inner.writer.lock().await.take() {
			let _ = writer.close().await;
		}
		Ok(())
	}

	async fn join(&self, channel: &str) -> Result<(), BotError> {
		{
			let mut channels = self.inner.channels.write();
			if channels.contains_key(channel) {
				return Ok(());
			}
			channels.insert(channel.to_string(), SystemTime::now());
		}
		if let Err(err) = Inner::send_frame(&self.inner, "/chat/join", serde_json::json!({ "channel": channel })).await {
			self.inner.channels.write().remove(channel);
			return Err(err);
		}
		Ok(())
	}

	async fn leave(&self, channel: &str) -> Result<(), BotError> {
		if self.inner.channels.write().remove(channel).is_none() {
			return Ok(());
		}
		Inner::send_frame(&self.inner, "/chat/leave", serde_json::json!({ "channel": channel })).await
	}

	async fn send_message(&self, channel: &str, text: &str) -> Result<(), BotError> {
		let from = {
			let auth = self.inner.auth.read();
			let (user, _) = auth.as_ref().ok_or_else(|| BotError::auth("not logged in"))?;
			serde_json::json!({ "id": user.id, "name": user.name })
		};
		Inner::send_frame(
			&self.inner,
			"/chat/publish",
			serde_json::json!({ "channel": channel, "text": text, "from": from }),
		)
		.await
	}

	async fn ban(&self, _channel: &str, _user: &str) -> Result<(), BotError> {
		Err(BotError::Unsupported("peka2tv ban"))
	}

	async fn timeout(&self, _channel: &str, _user: &str, _seconds: u32) -> Result<(), BotError> {
		Err(BotError::Unsupported("peka2tv timeout"))
	}
}
