#![forbid(unsafe_code)]

pub mod goodgame;
pub mod peka2tv;
pub mod render;
pub mod sink;
pub mod twitch;
pub(crate) mod ws;
pub mod youtube;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chatmux_domain::{BotError, Html, Platform};

pub use sink::{Handler, SharedMessage, Sink, SinkReader};

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Capability contract every platform's message type satisfies.
///
/// The dispatcher and any downstream consumer program only against this
/// trait; the concrete type behind it is one per platform. All render
/// methods are memoized on the instance: the first call composes the
/// fragment, every later call returns the cached value byte-for-byte.
pub trait ChatMessage: Send + Sync {
	/// Body block: escaped text with emote tokens substituted.
	fn render_body(&self) -> Html;

	/// Nickname block: badge icons followed by the display name.
	fn render_nickname(&self) -> Html;

	/// Combined block: nickname + separator + body.
	fn render_combined(&self) -> Html;

	/// Platform identifier string (`"twitch"`, `"peka2tv"`, ...).
	fn chat_name(&self) -> &'static str;

	/// Raw message text, unrendered.
	fn plain_text(&self) -> &str;

	/// Whether the message addresses `name`, by the platform's own
	/// convention (`@name` on Twitch, a `to` field on peka2tv, ...).
	fn mentions_user(&self, name: &str) -> bool;

	/// Sender login/name.
	fn sender_name(&self) -> &str;

	/// True only for ordinary chat text, false for system and moderation
	/// events.
	fn is_user_message(&self) -> bool;

	fn channel_name(&self) -> String;

	/// CSS color for the nickname, or the platform default.
	fn sender_color(&self) -> String;

	/// True for clear/ban style moderation events.
	fn is_moderation_event(&self) -> bool;
}

/// Capability contract every platform adapter satisfies.
///
/// Construction is per-platform (`TwitchBot::new`, ...); auth is decoupled
/// from `connect` where the platform allows it (`login_by_token` and
/// friends on the concrete types). Operations a platform cannot perform
/// return [`BotError::Unsupported`] rather than panicking.
#[async_trait::async_trait]
pub trait Bot: Send + Sync {
	fn platform(&self) -> Platform;

	/// Open the transport and start the read loop. For the polling adapter
	/// this is a no-op; polling starts per channel on `join`.
	async fn connect(&self) -> Result<(), BotError>;

	/// User-initiated disconnect; suppresses the reconnect path.
	async fn disconnect(&self) -> Result<(), BotError>;

	/// Idempotent: joining an already-joined channel is a success no-op
	/// that sends no protocol frame.
	async fn join(&self, channel: &str) -> Result<(), BotError>;

	async fn leave(&self, channel: &str) -> Result<(), BotError>;

	async fn send_message(&self, channel: &str, text: &str) -> Result<(), BotError>;

	async fn ban(&self, channel: &str, user: &str) -> Result<(), BotError>;

	async fn timeout(&self, channel: &str, user: &str, seconds: u32) -> Result<(), BotError>;
}

/// Handler that renders user messages to the log; handy as a smoke-test
/// default when wiring an adapter without a sink.
pub fn log_handler() -> Handler {
	Arc::new(|message: SharedMessage| {
		if message.is_user_message() {
			tracing::info!(platform = message.chat_name(), html = %message.render_combined(), "chat message");
		}
	})
}
