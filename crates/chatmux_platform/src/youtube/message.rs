#![forbid(unsafe_code)]

use chatmux_domain::Html;
use chrono::{DateTime, Utc};

use super::client::ChatItem;
use crate::ChatMessage;
use crate::render::{RenderCache, combined_fragment, escape_html};

/// One live chat entry, normalized from a polled page item.
#[derive(Debug)]
pub struct YtMessage {
	pub channel_id: String,
	pub author: String,
	pub chat_owner: bool,
	pub moderator: bool,
	pub text: String,
	pub sent_at: DateTime<Utc>,
	render: RenderCache,
}

impl YtMessage {
	pub(crate) fn from_item(item: ChatItem, channel_id: &str, fallback_time: DateTime<Utc>) -> Self {
		Self {
			channel_id: channel_id.to_string(),
			author: item.author_details.display_name,
			chat_owner: item.author_details.is_chat_owner,
			moderator: item.author_details.is_chat_moderator,
			text: item.snippet.display_message,
			sent_at: item.snippet.published_at.unwrap_or(fallback_time),
			render: RenderCache::default(),
		}
	}

	fn nickname_fragment(&self) -> Html {
		let badge = if self.chat_owner {
			r#"<div class="badge youtube-badge"><span class="chat-owner"></span></div>"#
		} else if self.moderator {
			r#"<div class="badge youtube-badge"><span class="chat-moderator"></span></div>"#
		} else {
			""
		};
		let nickname = format!(r#"<p class="nickname youtube-nickname">{}</p>"#, escape_html(&self.author));
		Html::new(format!(r#"<div class="nickname-badge youtube-nickname-badge">{badge}{nickname}</div>"#))
	}

	#[cfg(test)]
	pub(crate) fn computed_render_stages(&self) -> usize {
		self.render.computed_stages()
	}
}

impl ChatMessage for YtMessage {
	fn render_body(&self) -> Html {
		self.render
			.body(|| Html::new(format!(r#"<div class="message youtube-message">{}</div>"#, escape_html(&self.text))))
	}

	fn render_nickname(&self) -> Html {
		self.render.nickname(|| self.nickname_fragment())
	}

	fn render_combined(&self) -> Html {
		self.render
			.combined(|| combined_fragment("youtube", &self.render_nickname(), &self.render_body()))
	}

	fn chat_name(&self) -> &'static str {
		"youtube"
	}

	fn plain_text(&self) -> &str {
		&self.text
	}

	/// Plain substring match; YouTube has no structured mention field.
	fn mentions_user(&self, name: &str) -> bool {
		self.text.contains(name)
	}

	fn sender_name(&self) -> &str {
		&self.author
	}

	fn is_user_message(&self) -> bool {
		!self.author.is_empty()
	}

	fn channel_name(&self) -> String {
		self.channel_id.clone()
	}

	fn sender_color(&self) -> String {
		"#000".to_string()
	}

	fn is_moderation_event(&self) -> bool {
		false
	}
}
