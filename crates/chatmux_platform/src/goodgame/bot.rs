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

use super::message::GgMessage;
use super::updater;
use crate::sink::Handler;
use crate::ws::{self, WsConnector, WsReader, WsWriter};
use crate::{Bot, BoxFuture};

const CHAT_ADDR: &str = "chat.goodgame.ru:8081";
const CHAT_URL: &str = "ws://chat.goodgame.ru:8081/chat/websocket";
const AUTH_URL: &str = "https://goodgame.ru/ajax/login/";
const STREAM_INFO_URL: &str = "https://api2.goodgame.ru/streams";

const BAN_DURATION_SECS: u32 = 72_000;
const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Wire envelope: `{"type": "...", "data": ...}`.
#[derive(Debug, Serialize, Deserialize)]
struct GgFrame {
	#[serde(rename = "type")]
	kind: String,
	#[serde(default)]
	data: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AuthUser {
	id: i64,
	token: String,
	username: String,
}

#[derive(Debug, Deserialize)]
struct AuthResp {
	#[serde(default)]
	result: bool,
	#[serde(rename = "return", default)]
	user: AuthUser,
}

#[derive(Debug, Deserialize)]
struct StreamInfo {
	#[serde(default)]
	id: i64,
}

/// How the session authenticated; kept so a reconnect can re-auth the
/// same way.
#[derive(Clone)]
enum GgAuth {
	Password { login: String, password: String },
	Token { user_id: i64, token: String },
}

struct Inner {
	handler: Handler,
	http: reqwest::Client,
	channels: RwLock<HashMap<String, SystemTime>>,
	auth: RwLock<Option<GgAuth>>,
	writer: tokio::sync::Mutex<Option<WsWriter>>,
	user_disconnect: AtomicBool,
	reconnect_delay: Duration,
	connector: Option<WsConnector>,
}

/// GoodGame chat over its typed-envelope websocket.
#[derive(Clone)]
pub struct GgBot {
	inner: Arc<Inner>,
}

impl GgBot {
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

	/// Exchange login/password for a chat token and authenticate the
	/// websocket session.
	pub async fn login_by_pass(&self, login: &str, password: &str) -> Result<(), BotError> {
		let user = Inner::exchange_credentials(&self.inner, login, password).await?;
		Inner::send_auth(&self.inner, user.id, &user.token).await?;
		*self.inner.auth.write() = Some(GgAuth::Password {
			login: login.to_string(),
			password: password.to_string(),
		});
		Ok(())
	}

	/// Authenticate with an already-exchanged chat token.
	pub async fn login_by_token(&self, user_id: i64, token: &str) -> Result<(), BotError> {
		Inner::send_auth(&self.inner, user_id, token).await?;
		*self.inner.auth.write() = Some(GgAuth::Token {
			user_id,
			token: token.to_string(),
		});
		Ok(())
	}

	/// Resolve a stream slug to its numeric channel id and join it.
	pub async fn join_by_slug(&self, slug: &str) -> Result<(), BotError> {
		let info: StreamInfo = self
			.inner
			.http
			.get(format!("{STREAM_INFO_URL}/{slug}"))
			.header("Accept", "application/hal+json")
			.send()
			.await
			.context("requesting stream info")
			.map_err(BotError::transport)?
			.json()
			.await
			.context("decoding stream info")
			.map_err(BotError::parse)?;
		if info.id == 0 {
			return Err(BotError::lookup(format!("no stream for slug {slug}")));
		}
		self.join(&info.id.to_string()).await
	}
}

impl Inner {
	async fn dial(inner: &Arc<Self>) -> anyhow::Result<ws::WsStream> {
		match &inner.connector {
			Some(connector) => connector().await,
			None => ws::dial_plain(CHAT_ADDR, CHAT_URL).await,
		}
	}

	async fn exchange_credentials(inner: &Arc<Self>, login: &str, password: &str) -> Result<AuthUser, BotError> {
		let resp: AuthResp = inner
			.http
			.post(AUTH_URL)
			.form(&[("login", login), ("password", password), ("return", "user")])
			.send()
			.await
			.context("requesting goodgame auth")
			.map_err(BotError::transport)?
			.json()
			.await
			.context("decoding goodgame auth")
			.map_err(BotError::parse)?;
		if !resp.result || resp.user.token.is_empty() {
			return Err(BotError::auth("goodgame rejected credentials"));
		}
		Ok(resp.user)
	}

	async fn send_auth(inner: &Arc<Self>, user_id: i64, token: &str) -> Result<(), BotError> {
		Self::send_frame(inner, "auth", serde_json::json!({ "user_id": user_id, "token": token })).await
	}

	async fn send_frame(inner: &Arc<Self>, kind: &str, data: serde_json::Value) -> Result<(), BotError> {
		let frame = GgFrame {
			kind: kind.to_string(),
			data,
		};
		let text = serde_json::to_string(&frame).map_err(BotError::parse)?;
		let mut guard = inner.writer.lock().await;
		let writer = guard.as_mut().ok_or(BotError::NotConnected)?;
		writer.send(WsMessage::text(text)).await.map_err(BotError::transport)?;
		Ok(())
	}

	async fn establish(inner: &Arc<Self>) -> Result<WsReader, BotError> {
		let ws = Self::dial(inner).await.map_err(BotError::transport)?;
		let (writer, reader) = ws.split();
		*inner.writer.lock().await = Some(writer);
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
							tracing::warn!("goodgame pong failed: {err}");
						}
					}
					Ok(WsMessage::Close(_)) => break,
					Ok(_) => {}
					Err(err) => {
						tracing::warn!("goodgame read error: {err}");
						break;
					}
				}
			}

			inner.writer.lock().await.take();
			if inner.user_disconnect.load(Ordering::SeqCst) {
				tracing::info!("goodgame connection closed by disconnect");
				return;
			}
			tracing::warn!("goodgame connection lost, reconnecting");
			Self::reconnect_loop(inner).await;
		})
	}

	fn handle_frame(inner: &Arc<Self>, text: &str) {
		let frame: GgFrame = match serde_json::from_str(text) {
			Ok(frame) => frame,
			Err(err) => {
				tracing::debug!("dropping unparsed goodgame frame: {err}");
				return;
			}
		};
		match frame.kind.as_str() {
			"welcome" => tracing::debug!("goodgame chat says welcome"),
			"success_auth" => tracing::debug!("goodgame auth accepted"),
			"success_join" => tracing::debug!("goodgame join accepted"),
			"message" => match GgMessage::from_payload(frame.data) {
				Ok(message) => (inner.handler)(Arc::new(message)),
				Err(err) => tracing::debug!("dropping unparsed goodgame message: {err}"),
			},
			"user_ban" => match GgMessage::from_ban_payload(frame.data) {
				Ok(message) => (inner.handler)(Arc::new(message)),
				Err(err) => tracing::debug!("dropping unparsed goodgame ban: {err}"),
			},
			other => tracing::trace!(kind = other, "ignoring goodgame event"),
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
					let auth = inner.auth.read().clone();
					match auth {
						Some(GgAuth::Password { login, password }) => match Self::exchange_credentials(&inner, &login, &password).await {
							Ok(user) => {
								if let Err(err) = Self::send_auth(&inner, user.id, &user.token).await {
									tracing::warn!("goodgame re-auth failed: {err}");
								}
							}
							Err(err) => tracing::warn!("goodgame re-auth failed: {err}"),
						},
						Some(GgAuth::Token { user_id, token }) => {
							if let Err(err) = Self::send_auth(&inner, user_id, &token).await {
								tracing::warn!("goodgame re-auth failed: {err}");
							}
						}
						None => {}
					}
					let channels: Vec<String> = inner.channels.read().keys().cloned().collect();
					for channel in channels {
						if let Err(err) = Self::send_frame(&inner, "join", serde_json::json!({ "channel_id": channel })).await {
							tracing::warn!(%channel, "goodgame rejoin failed: {err}");
						}
					}
					tokio::spawn(Self::read_loop(inner, reader));
					return;
				}
				Err(err) => {
					tracing::warn!("goodgame reconnect failed: {err}");
				}
			}
		}
	}
}

#[async_trait]
impl Bot for GgBot {
	fn platform(&self) -> Platform {
		Platform::GoodGame
	}

	async fn connect(&self) -> Result<(), BotError> {
		self.inner.user_disconnect.store(false, Ordering::SeqCst);
		self.inner.channels.write().clear();
		let reader = Inner::establish(&self.inner).await?;
		tokio::spawn(Inner::read_loop(self.inner.clone(), reader));
		updater::ensure_smile_updater();
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
		if let Err(err) = Inner::send_frame(&self.inner, "join", serde_json::json!({ "channel_id": channel })).await {
			self.inner.channels.write().remove(channel);
			return Err(err);
		}
		Ok(())
	}

	async fn leave(&self, channel: &str) -> Result<(), BotError> {
		if self.inner.channels.write().remove(channel).is_none() {
			return Ok(());
		}
		Inner::send_frame(&self.inner, "unjoin", serde_json::json!({ "channel_id": channel })).await
	}

	async fn send_message(&self, channel: &str, text: &str) -> Result<(), BotError> {
		Inner::send_frame(
			&self.inner,
			"send_message",
			serde_json::json!({ "channel_id": channel, "text": text }),
		)
		.await
	}

	async fn ban(&self, channel: &str, user: &str) -> Result<(), BotError> {
		self.moderate(channel, user, BAN_DURATION_SECS).await
	}

	async fn timeout(&self, channel: &str, user: &str, seconds: u32) -> Result<(), BotError> {
		self.moderate(channel, user, seconds).await
	}
}

impl GgBot {
	async fn moderate(&self, channel: &str, user: &str, duration: u32) -> Result<(), BotError> {
		Inner::send_frame(
			&self.inner,
			"ban",
			serde_json::json!({
				"channel_id": channel,
				"ban_channel": channel,
				"user_id": user,
				"duration": duration,
				"reason": "20 minutes",
				"delete_message": true,
				"show_ban": true
			}),
		)
		.await
	}
}
