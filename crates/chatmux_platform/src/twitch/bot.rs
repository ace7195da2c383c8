#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chatmux_domain::{BotError, Platform};
use parking_lot::RwLock;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use super::updater;
use crate::sink::Handler;
use crate::{Bot, BoxFuture};

const DEFAULT_SERVER_ADDR: &str = "irc.chat.twitch.tv:6667";
const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(2);

pub(crate) type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Produces a fresh IRC transport. Injectable so tests can hand the bot an
/// in-memory pipe instead of a TCP socket.
pub(crate) type IrcDialer = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<(BoxedReader, BoxedWriter)>> + Send + Sync>;

/// Credentials and connection settings for [`TwitchBot`].
#[derive(Clone)]
pub struct TwitchConfig {
	pub nickname: String,
	/// OAuth token, without the `oauth:` prefix.
	pub oauth_token: String,
	/// Needed for channel id lookups behind subscriber badges.
	pub client_id: Option<String>,
	pub server_addr: String,
	pub reconnect_delay: Duration,
	pub(crate) dialer: Option<IrcDialer>,
}

impl TwitchConfig {
	pub fn new(nickname: impl Into<String>, oauth_token: impl Into<String>) -> Self {
		Self {
			nickname: nickname.into(),
			oauth_token: oauth_token.into(),
			client_id: None,
			server_addr: DEFAULT_SERVER_ADDR.to_string(),
			reconnect_delay: DEFAULT_RECONNECT_DELAY,
			dialer: None,
		}
	}

	pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
		self.client_id = Some(client_id.into());
		self
	}

	#[cfg(test)]
	pub(crate) fn with_dialer(mut self, dialer: IrcDialer) -> Self {
		self.dialer = Some(dialer);
		self
	}
}

struct Inner {
	cfg: TwitchConfig,
	handler: Handler,
	/// Joined channels and when they were joined; the reconnect loop
	/// rejoins everything in here.
	channels: RwLock<HashMap<String, SystemTime>>,
	writer: tokio::sync::Mutex<Option<BoxedWriter>>,
	user_disconnect: AtomicBool,
}

/// Twitch chat over tagged IRC.
#[derive(Clone)]
pub struct TwitchBot {
	inner: Arc<Inner>,
}

impl TwitchBot {
	pub fn new(cfg: TwitchConfig, handler: Handler) -> Self {
		Self {
			inner: Arc::new(Inner {
				cfg,
				handler,
				channels: RwLock::new(HashMap::new()),
				writer: tokio::sync::Mutex::new(None),
				user_disconnect: AtomicBool::new(false),
			}),
		}
	}

	pub fn joined_channels(&self) -> Vec<String> {
		self.inner.channels.read().keys().cloned().collect()
	}

	async fn send_raw(&self, line: &str) -> Result<(), BotError> {
		Inner::send_raw(&self.inner, line).await
	}
}

impl Inner {
	async fn dial(inner: &Arc<Self>) -> anyhow::Result<(BoxedReader, BoxedWriter)> {
		match &inner.cfg.dialer {
			Some(dialer) => dialer().await,
			None => {
				let stream = TcpStream::connect(&inner.cfg.server_addr).await?;
				let (read, write) = stream.into_split();
				Ok((Box::new(read), Box::new(write)))
			}
		}
	}

	async fn send_raw(inner: &Arc<Self>, line: &str) -> Result<(), BotError> {
		let mut guard = inner.writer.lock().await;
		let writer = guard.as_mut().ok_or(BotError::NotConnected)?;
		writer
			.write_all(format!("{line}\r\n").as_bytes())
			.await
			.map_err(BotError::transport)?;
		writer.flush().await.map_err(BotError::transport)?;
		Ok(())
	}

	async fn login(inner: &Arc<Self>) -> Result<(), BotError> {
		Self::send_raw(inner, &format!("PASS oauth:{}", inner.cfg.oauth_token)).await?;
		Self::send_raw(inner, &format!("NICK {}", inner.cfg.nickname)).await?;
		Self::send_raw(inner, "CAP REQ :twitch.tv/tags").await?;
		Self::send_raw(inner, "CAP REQ :twitch.tv/commands").await?;
		Ok(())
	}

	/// Establish a transport, log in, and install the writer. Returns the
	/// read half for the caller's read loop.
	async fn establish(inner: &Arc<Self>) -> Result<BoxedReader, BotError> {
		let (reader, writer) = Self::dial(inner).await.map_err(BotError::transport)?;
		*inner.writer.lock().await = Some(writer);
		Self::login(inner).await?;
		Ok(reader)
	}

	// Boxed: the future recurses through `reconnect_loop`, which spawns
	// `read_loop` again for the replacement connection.
	fn read_loop(inner: Arc<Self>, reader: BoxedReader) -> BoxFuture<'static, ()> {
		Box::pin(async move {
			let mut lines = BufReader::new(reader).lines();
			loop {
				match lines.next_line().await {
					Ok(Some(line)) => {
						let line = line.trim_end_matches('\r');
						if line.is_empty() {
							continue;
						}
						if let Some(payload) = line.strip_prefix("PING ") {
							if let Err(err) = Self::send_raw(&inner, &format!("PONG {payload}")).await {
								tracing::warn!("twitch pong failed: {err}");
							}
							continue;
						}
						match super::parse_line(line) {
							Ok(message) => (inner.handler)(Arc::new(message)),
							Err(err) => tracing::debug!("dropping unparsed twitch line: {err}"),
						}
					}
					Ok(None) => break,
					Err(err) => {
						tracing::warn!("twitch read error: {err}");
						break;
					}
				}
			}

			inner.writer.lock().await.take();
			if inner.user_disconnect.load(Ordering::SeqCst) {
				tracing::info!("twitch connection closed by disconnect");
				return;
			}
			tracing::warn!("twitch connection lost, reconnecting");
			Self::reconnect_loop(inner).await;
		})
	}

	async fn reconnect_loop(inner: Arc<Self>) {
		loop {
			tokio::time::sleep(inner.cfg.reconnect_delay).await;
			if inner.user_disconnect.load(Ordering::SeqCst) {
				return;
			}
			match Self::establish(&inner).await {
				Ok(reader) => {
					let channels: Vec<String> = inner.channels.read().keys().cloned().collect();
					for channel in channels {
						if let Err(err) = Self::send_raw(&inner, &format!("JOIN #{channel}")).await {
							tracing::warn!(%channel, "twitch rejoin failed: {err}");
						}
					}
					tokio::spawn(Self::read_loop(inner, reader));
					return;
				}
				Err(err) => {
					tracing::warn!("twitch reconnect failed: {err}");
				}
			}
		}
	}
}

#[async_trait]
impl Bot for TwitchBot {
	fn platform(&self) -> Platform {
		Platform::Twitch
	}

	async fn connect(&self) -> Result<(), BotError> {
		self.inner.user_disconnect.store(false, Ordering::SeqCst);
		self.inner.channels.write().clear();
		let reader = Inner::establish(&self.inner).await?;
		tokio::spawn(Inner::read_loop(self.inner.clone(), reader));
		updater::ensure_badge_updater(self.inner.cfg.client_id.as_deref());
		Ok(())
	}

	async fn disconnect(&self) -> Result<(), BotError> {
		self.inner.user_disconnect.store(true, Ordering::SeqCst);
		self.inner.channels.write().clear();
		if let Some(mut writer) = self.inner.writer.lock().await.take() {
			let _ = writer.shutdown().await;
		}
		Ok(())
	}

	async fn join(&self, channel: &str) -> Result<(), BotError> {
		let channel = channel.to_lowercase();
		{
			let mut channels = self.inner.channels.write();
			if channels.contains_key(&channel) {
				return Ok(());
			}
			channels.insert(channel.clone(), SystemTime::now());
		}
		if let Err(err) = self.send_raw(&format!("JOIN #{channel}")).await {
			self.inner.channels.write().remove(&channel);
			return Err(err);
		}
		if self.inner.cfg.client_id.is_some() {
			let channel = channel.clone();
			tokio::spawn(async move {
				updater::ensure_channel_sub_badges(&channel).await;
			});
		}
		Ok(())
	}

	async fn leave(&self, channel: &str) -> Result<(), BotError> {
		let channel = channel.to_lowercase();
		if self.inner.channels.write().remove(&channel).is_none() {
			return Ok(());
		}
		self.send_raw(&format!("PART #{channel}")).await
	}

	async fn send_message(&self, channel: &str, text: &str) -> Result<(), BotError> {
		self.send_raw(&format!("PRIVMSG #{} :{text}", channel.to_lowercase())).await
	}

	async fn ban(&self, channel: &str, user: &str) -> Result<(), BotError> {
		self.send_message(channel, &format!(".ban {user}")).await
	}

	async fn timeout(&self, channel: &str, user: &str, seconds: u32) -> Result<(), BotError> {
		self.send_message(channel, &format!(".timeout {user} {seconds}")).await
	}
}

#[cfg(test)]
mod tests {
	use std::collections::VecDeque;
	use std::sync::atomic::AtomicUsize;

	use parking_lot::Mutex;
	use tokio::io::{AsyncReadExt, DuplexStream};

	use super::*;
	use crate::sink::Sink;

	struct FakeServer {
		transport: Mutex<VecDeque<DuplexStream>>,
		dial_count: AtomicUsize,
	}

	impl FakeServer {
		fn with_connections(n: usize) -> (Arc<Self>, Vec<DuplexStream>) {
			let mut bot_ends = VecDeque::new();
			let mut server_ends = Vec::new();
			for _ in 0..n {
				let (bot_end, server_end) = tokio::io::duplex(16 * 1024);
				bot_ends.push_back(bot_end);
				server_ends.push(server_end);
			}
			(
				Arc::new(Self {
					transport: Mutex::new(bot_ends),
					dial_count: AtomicUsize::new(0),
				}),
				server_ends,
			)
		}

		fn dialer(self: &Arc<Self>) -> IrcDialer {
			let server = self.clone();
			Arc::new(move || {
				let server = server.clone();
				Box::pin(async move {
					server.dial_count.fetch_add(1, Ordering::SeqCst);
					let stream = server
						.transport
						.lock()
						.pop_front()
						.ok_or_else(|| anyhow::anyhow!("no transport left"))?;
					let (read, write) = tokio::io::split(stream);
					Ok((Box::new(read) as BoxedReader, Box::new(write) as BoxedWriter))
				})
			})
		}
	}

	// PASS + NICK + both CAP REQ lines
	const LOGIN_LEN: usize = 92;

	fn test_bot(server: &Arc<FakeServer>) -> (TwitchBot, crate::sink::SinkReader) {
		let (sink, reader) = Sink::bounded(64);
		let mut cfg = TwitchConfig::new("botnick", "secrettoken").with_dialer(server.dialer());
		cfg.reconnect_delay = Duration::from_millis(10);
		(TwitchBot::new(cfg, sink.handler()), reader)
	}

	async fn read_available(server_end: &mut DuplexStream, min_len: usize) -> String {
		let mut buf = Vec::new();
		let mut chunk = [0u8; 1024];
		while buf.len() < min_len {
			let n = server_end.read(&mut chunk).await.unwrap();
			if n == 0 {
				break;
			}
			buf.extend_from_slice(&chunk[..n]);
		}
		String::from_utf8(buf).unwrap()
	}

	#[tokio::test]
	async fn connect_sends_login_sequence() {
		let (server, mut ends) = FakeServer::with_connections(1);
		let (bot, _reader) = test_bot(&server);
		bot.connect().await.unwrap();

		let sent = read_available(&mut ends[0], LOGIN_LEN).await;
		assert!(sent.starts_with("PASS oauth:secrettoken\r\nNICK botnick\r\n"));
		assert!(sent.contains("CAP REQ :twitch.tv/tags\r\n"));
		assert!(sent.contains("CAP REQ :twitch.tv/commands\r\n"));
	}

	#[tokio::test]
	async fn join_is_idempotent() {
		let (server, mut ends) = FakeServer::with_connections(1);
		let (bot, _reader) = test_bot(&server);
		bot.connect().await.unwrap();

		bot.join("SomeChannel").await.unwrap();
		bot.join("somechannel").await.unwrap();
		bot.join("somechannel").await.unwrap();
		bot.send_message("somechannel", "hello").await.unwrap();

		let sent = read_available(&mut ends[0], LOGIN_LEN + 48).await;
		assert_eq!(sent.matches("JOIN #somechannel\r\n").count(), 1);
		assert!(sent.ends_with("PRIVMSG #somechannel :hello\r\n"));
		assert_eq!(bot.joined_channels(), vec!["somechannel".to_string()]);
	}

	#[tokio::test]
	async fn ping_is_answered_with_pong() {
		let (server, mut ends) = FakeServer::with_connections(1);
		let (bot, _reader) = test_bot(&server);
		bot.connect().await.unwrap();
		read_available(&mut ends[0], LOGIN_LEN).await;

		ends[0].write_all(b"PING :tmi.twitch.tv\r\n").await.unwrap();
		let sent = read_available(&mut ends[0], 4).await;
		assert_eq!(sent, "PONG :tmi.twitch.tv\r\n");
	}

	#[tokio::test]
	async fn inbound_privmsg_reaches_handler() {
		let (server, mut ends) = FakeServer::with_connections(1);
		let (bot, mut reader) = test_bot(&server);
		bot.connect().await.unwrap();
		read_available(&mut ends[0], LOGIN_LEN).await;

		ends[0]
			.write_all(b":haunterxx!haunterxx@haunterxx.tmi.twitch.tv PRIVMSG #imaqtpie :hi there\r\n")
			.await
			.unwrap();

		let message = reader.recv().await.unwrap();
		assert_eq!(message.chat_name(), "twitch");
		assert_eq!(message.sender_name(), "haunterxx");
		assert_eq!(message.plain_text(), "hi there");
		assert_eq!(message.channel_name(), "imaqtpie");
	}

	#[tokio::test]
	async fn lost_connection_redials_and_rejoins() {
		let (server, mut ends) = FakeServer::with_connections(2);
		let (bot, _reader) = test_bot(&server);
		bot.connect().await.unwrap();
		bot.join("imaqtpie").await.unwrap();
		read_available(&mut ends[0], LOGIN_LEN).await;

		// Server drops the first connection.
		drop(ends.remove(0));

		let sent = read_available(&mut ends[0], LOGIN_LEN + 16).await;
		assert_eq!(server.dial_count.load(Ordering::SeqCst), 2);
		assert!(sent.starts_with("PASS oauth:secrettoken\r\n"));
		assert!(sent.contains("JOIN #imaqtpie\r\n"));
	}

	#[tokio::test]
	async fn disconnect_suppresses_redial() {
		let (server, mut ends) = FakeServer::with_connections(2);
		let (bot, _reader) = test_bot(&server);
		bot.connect().await.unwrap();
		read_available(&mut ends[0], LOGIN_LEN).await;

		bot.disconnect().await.unwrap();
		tokio::time::sleep(Duration::from_millis(50)).await;
		assert_eq!(server.dial_count.load(Ordering::SeqCst), 1);
		assert!(matches!(bot.send_message("c", "x").await, Err(BotError::NotConnected)));
	}
}
