#![forbid(unsafe_code)]

use chatmux_domain::{BotError, Html};
use serde::{Deserialize, Deserializer};

use super::updater::{self, GgSmile};
use crate::ChatMessage;
use crate::render::{RenderCache, combined_fragment};

const CLEAR_TYPE: &str = "CLEARCHAT";

/// `user_id` arrives as a number in `message` frames and as a string in
/// `user_ban` frames.
fn de_user_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
	let value = serde_json::Value::deserialize(deserializer)?;
	Ok(match value {
		serde_json::Value::Number(n) => n.to_string(),
		serde_json::Value::String(s) => s,
		_ => String::new(),
	})
}

/// One GoodGame chat event payload.
///
/// The platform escapes `text` and `user_name` server-side; renders embed
/// them as-is and never escape a second time.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct GgMessage {
	#[serde(rename = "channel_id")]
	pub channel: i64,
	#[serde(deserialize_with = "de_user_id")]
	pub user_id: String,
	pub user_name: String,
	pub user_rights: i64,
	pub color: String,
	pub text: String,
	pub icon: String,
	pub donat: i64,
	/// Bool on real traffic, but the field is loosely typed upstream.
	pub premium: serde_json::Value,
	pub premiums: Vec<i64>,
	#[serde(skip)]
	kind: String,
	#[serde(skip)]
	render: RenderCache,
}

impl GgMessage {
	/// Decode a `message` frame payload.
	pub fn from_payload(data: serde_json::Value) -> Result<Self, BotError> {
		let mut message: Self = serde_json::from_value(data).map_err(BotError::parse)?;
		message.premiums.sort_unstable();
		Ok(message)
	}

	/// Decode a `user_ban` frame payload into a moderation event.
	pub fn from_ban_payload(data: serde_json::Value) -> Result<Self, BotError> {
		let mut message = Self::from_payload(data)?;
		message.kind = CLEAR_TYPE.to_string();
		Ok(message)
	}

	pub fn is_premium(&self) -> bool {
		self.premium.as_bool().unwrap_or(false)
	}

	pub fn is_moderator(&self) -> bool {
		self.user_rights > 0
	}

	fn has_premium_channel(&self, channel_id: i64) -> bool {
		self.premiums.binary_search(&channel_id).is_ok()
	}

	/// A smile renders if it is global, from a channel the sender has
	/// premium on, or matches the sender's non-zero donat tier.
	fn may_use(&self, smile: &GgSmile) -> bool {
		smile.channel_id == 0 || self.has_premium_channel(smile.channel_id) || (self.donat == smile.donat && self.donat != 0)
	}

	fn body_fragment(&self) -> Html {
		let mut text = self.text.clone();
		let premium = self.is_premium();
		for word in self.text.split_whitespace() {
			if word.len() < 3 || !word.starts_with(':') || !word.ends_with(':') {
				continue;
			}
			let Some(smile) = updater::smile(&word[1..word.len() - 1]) else {
				continue;
			};
			if !self.may_use(&smile) {
				continue;
			}
			let url = if smile.animated && premium { &smile.img_gif } else { &smile.img_big };
			let img = format!(r#"<img class="smile gg-smile" src="{url}" alt="{}">"#, smile.name);
			text = text.replace(word, &img);
		}
		Html::new(format!(r#"<div class="message goodgame-message">{text}</div>"#))
	}

	fn nickname_fragment(&self) -> Html {
		let mut icons = String::new();
		if self.is_premium() {
			icons.push_str(r#"<span class="subscribe goodgame-subscribe"></span>"#);
		}
		if self.is_moderator() {
			icons.push_str(r#"<span class="moderator goodgame-moderator"></span>"#);
		}
		let nickname = format!(r#"<p class="nickname goodgame-nickname">{}</p>"#, self.user_name);
		Html::new(format!(r#"<div class="nickname-badge goodgame-nickname-badge">{icons}{nickname}</div>"#))
	}

	#[cfg(test)]
	pub(crate) fn computed_render_stages(&self) -> usize {
		self.render.computed_stages()
	}
}

impl ChatMessage for GgMessage {
	fn render_body(&self) -> Html {
		self.render.body(|| self.body_fragment())
	}

	fn render_nickname(&self) -> Html {
		self.render.nickname(|| self.nickname_fragment())
	}

	fn render_combined(&self) -> Html {
		self.render
			.combined(|| combined_fragment("goodgame", &self.render_nickname(), &self.render_body()))
	}

	fn chat_name(&self) -> &'static str {
		"goodgame"
	}

	fn plain_text(&self) -> &str {
		&self.text
	}

	fn mentions_user(&self, name: &str) -> bool {
		self.text.to_lowercase().contains(&format!("{},", name.to_lowercase()))
	}

	fn sender_name(&self) -> &str {
		&self.user_name
	}

	fn is_user_message(&self) -> bool {
		!self.user_name.is_empty() && self.kind != CLEAR_TYPE
	}

	fn channel_name(&self) -> String {
		self.channel.to_string()
	}

	fn sender_color(&self) -> String {
		if self.color.is_empty() {
			"#000".to_string()
		} else {
			self.color.clone()
		}
	}

	fn is_moderation_event(&self) -> bool {
		self.kind == CLEAR_TYPE
	}
}
