#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chatmux_domain::{BotError, Platform};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::client::{ChatItem, MessagesPage, YtClient};
use super::message::YtMessage;
use crate::sink::Handler;
use crate::{Bot, BoxFuture};

const MIN_POLL_MILLIS: u64 = 3_000;
const MAX_POLL_MILLIS: u64 = 10_000;
const MAX_CONSECUTIVE_FAILURES: u32 = 10;
const FAILURE_RETRY_DELAY: Duration = Duration::from_secs(3);
const BAN_DURATION_SECS: u32 = 72_000;

/// Test seams over the two API calls the poll path makes.
type ChatIdResolver = Arc<dyn Fn(String) -> BoxFuture<'static, Result<String, BotError>> + Send + Sync>;
type PageFetcher = Arc<dyn Fn(String) -> BoxFuture<'static, Result<MessagesPage, BotError>> + Send + Sync>;

/// Clamp the server-suggested polling interval to [3s, 10s].
pub(crate) fn clamp_poll_interval(millis: u64) -> Duration {
	Duration::from_millis(millis.clamp(MIN_POLL_MILLIS, MAX_POLL_MILLIS))
}

/// Keep only items published strictly after `high_water`, returning them
/// with the new mark. Items at exactly the mark are dropped rather than
/// risked as duplicates.
pub(crate) fn select_new(items: Vec<ChatItem>, high_water: DateTime<Utc>) -> (Vec<ChatItem>, DateTime<Utc>) {
	let mut new_mark = high_water;
	let mut fresh = Vec::new();
	for item in items {
		let Some(published) = item.snippet.published_at else {
			continue;
		};
		if published > high_water {
			if published > new_mark {
				new_mark = published;
			}
			fresh.push(item);
		}
	}
	(fresh, new_mark)
}

struct ChannelPoller {
	channel_id: String,
	chat_id: String,
	stop: AtomicBool,
	last_message: RwLock<DateTime<Utc>>,
}

struct Inner {
	handler: Handler,
	client: YtClient,
	oauth_token: RwLock<Option<String>>,
	streams: RwLock<HashMap<String, Arc<ChannelPoller>>>,
	resolver: Option<ChatIdResolver>,
	fetcher: Option<PageFetcher>,
	failure_retry_delay: Duration,
}

/// YouTube live chat via REST polling; no persistent transport.
#[derive(Clone)]
pub struct YtBot {
	inner: Arc<Inner>,
}

impl YtBot {
	pub fn new(handler: Handler, api_key: impl Into<String>) -> Self {
		Self::with_seams(handler, api_key, None, None, FAILURE_RETRY_DELAY)
	}

	pub fn with_oauth(handler: Handler, api_key: impl Into<String>, oauth_token: impl Into<String>) -> Self {
		let bot = Self::new(handler, api_key);
		*bot.inner.oauth_token.write() = Some(oauth_token.into());
		bot
	}

	fn with_seams(
		handler: Handler,
		api_key: impl Into<String>,
		resolver: Option<ChatIdResolver>,
		fetcher: Option<PageFetcher>,
		failure_retry_delay: Duration,
	) -> Self {
		Self {
			inner: Arc::new(Inner {
				handler,
				client: YtClient::new(api_key.into()),
				oauth_token: RwLock::new(None),
				streams: RwLock::new(HashMap::new()),
				resolver,
				fetcher,
				failure_retry_delay,
			}),
		}
	}

	/// Set or replace the OAuth token used for send/ban/timeout.
	pub fn set_oauth_token(&self, token: impl Into<String>) {
		*self.inner.oauth_token.write() = Some(token.into());
	}

	pub fn joined_channels(&self) -> Vec<String> {
		self.inner.streams.read().keys().cloned().collect()
	}

	fn poller_for(&self, channel: &str) -> Result<Arc<ChannelPoller>, BotError> {
		self.inner
			.streams
			.read()
			.get(channel)
			.cloned()
			.ok_or_else(|| BotError::lookup(format!("channel {channel} not joined")))
	}

	fn oauth_token(&self) -> Result<String, BotError> {
		self.inner
			.oauth_token
			.read()
			.clone()
			.ok_or_else(|| BotError::auth("no oauth token configured"))
	}
}

impl Inner {
	async fn resolve_chat_id(inner: &Arc<Self>, channel_id: &str) -> Result<String, BotError> {
		match &inner.resolver {
			Some(resolver) => resolver(channel_id.to_string()).await,
			None => inner.client.resolve_chat_id(channel_id).await,
		}
	}

	async fn fetch_page(inner: &Arc<Self>, chat_id: &str) -> Result<MessagesPage, BotError> {
		match &inner.fetcher {
			Some(fetcher) => fetcher(chat_id.to_string()).await,
			None => inner.client.messages(chat_id).await,
		}
	}

	/// One task per joined channel. Exits on the stop flag, or leaves the
	/// channel after ten consecutive request failures.
	async fn poll_loop(inner: Arc<Self>, poller: Arc<ChannelPoller>) {
		let mut failures: u32 = 0;
		loop {
			if poller.stop.load(Ordering::SeqCst) {
				tracing::debug!(channel = %poller.channel_id, "youtube poller stopped");
				return;
			}
			let page = match Self::fetch_page(&inner, &poller.chat_id).await {
				Ok(page) => page,
				Err(err) => {
					failures += 1;
					tracing::warn!(channel = %poller.channel_id, failures, "youtube poll failed: {err}");
					if failures >= MAX_CONSECUTIVE_FAILURES {
						tracing::warn!(channel = %poller.channel_id, "giving up on youtube channel");
						poller.stop.store(true, Ordering::SeqCst);
						inner.streams.write().remove(&poller.channel_id);
						return;
					}
					tokio::time::sleep(inner.failure_retry_delay).await;
					continue;
				}
			};
			failures = 0;

			let interval = clamp_poll_interval(page.polling_interval_millis);
			let high_water = *poller.last_message.read();
			let (fresh, new_mark) = select_new(page.items, high_water);
			let fallback = Utc::now();
			for item in fresh {
				(inner.handler)(Arc::new(YtMessage::from_item(item, &poller.channel_id, fallback)));
			}
			*poller.last_message.write() = new_mark;

			tokio::time::sleep(interval).await;
		}
	}
}

#[async_trait]
impl Bot for YtBot {
	fn platform(&self) -> Platform {
		Platform::YouTube
	}

	/// No persistent transport; polling starts per channel on `join`.
	async fn connect(&self) -> Result<(), BotError> {
		Ok(())
	}

	async fn disconnect(&self) -> Result<(), BotError> {
		let pollers: Vec<Arc<ChannelPoller>> = self.inner.streams.write().drain().map(|(_, p)| p).collect();
		for poller in pollers {
			poller.stop.store(true, Ordering::SeqCst);
		}
		Ok(())
	}

	/// Resolves the channel's active live chat once, then spawns the
	/// polling task. Joining an already-joined channel is a no-op.
	async fn join(&self, channel: &str) -> Result<(), BotError> {
		if self.inner.streams.read().contains_key(channel) {
			return Ok(());
		}
		let chat_id = Inner::resolve_chat_id(&self.inner, channel).await?;
		let poller = Arc::new(ChannelPoller {
			channel_id: channel.to_string(),
			chat_id,
			stop: AtomicBool::new(false),
			last_message: RwLock::new(Utc::now()),
		});
		{
			let mut streams = self.inner.streams.write();
			if streams.contains_key(channel) {
				return Ok(());
			}
			streams.insert(channel.to_string(), poller.clone());
		}
		tokio::spawn(Inner::poll_loop(self.inner.clone(), poller));
		Ok(())
	}

	async fn leave(&self, channel: &str) -> Result<(), BotError> {
		if let Some(poller) = self.inner.streams.write().remove(channel) {
			poller.stop.store(true, Ordering::SeqCst);
		}
		Ok(())
	}

	async fn send_message(&self, channel: &str, text: &str) -> Result<(), BotError> {
		let token = self.oauth_token()?;
		let poller = self.poller_for(channel)?;
		self.inner.client.send_message(&poller.chat_id, text, &token).await
	}

	async fn ban(&self, channel: &str, user: &str) -> Result<(), BotError> {
		let token = self.oauth_token()?;
		let poller = self.poller_for(channel)?;
		self.inner.client.ban_user(&poller.chat_id, user, BAN_DURATION_SECS, &token).await
	}

	async fn timeout(&self, channel: &str, user: &str, seconds: u32) -> Result<(), BotError> {
		let token = self.oauth_token()?;
		let poller = self.poller_for(channel)?;
		self.inner.client.ban_user(&poller.chat_id, user, seconds, &token).await
	}
}
