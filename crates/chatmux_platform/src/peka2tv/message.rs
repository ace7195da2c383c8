#![forbid(unsafe_code)]

use chatmux_domain::{BotError, Html};
use serde::Deserialize;

use super::updater;
use crate::ChatMessage;
use crate::render::{RenderCache, combined_fragment, escape_html};

const CLEAR_TYPE: &str = "CLEARCHAT";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PekaUser {
	pub id: i64,
	pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PekaStore {
	pub icon: i64,
	pub bonuses: Vec<i64>,
	pub subs: Vec<i64>,
}

/// One `/chat/message` event payload.
#[derive(Debug, Deserialize)]
pub struct PekaMessage {
	#[serde(default)]
	pub id: i64,
	#[serde(default)]
	pub channel: String,
	#[serde(default)]
	pub from: PekaUser,
	#[serde(default)]
	pub text: String,
	#[serde(default)]
	pub to: Option<PekaUser>,
	#[serde(rename = "type", default)]
	pub kind: String,
	#[serde(default)]
	pub store: PekaStore,
	#[serde(skip)]
	render: RenderCache,
}

/// A smile occurrence the sender is entitled to render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EmoteUse {
	/// The literal `:name:` token in the text.
	pub code: String,
	pub name: String,
	pub url: String,
}

/// Scan the text for `:name:` tokens and keep the ones the sender may use:
/// global smiles, or smiles owned by a bonus the sender holds. Tokens are
/// whole whitespace-separated words; each distinct code is kept once, in
/// order of first appearance.
pub(crate) fn collect_emotes(
	text: &str,
	lookup: impl Fn(&str) -> Option<updater::Smile>,
	has_bonus: impl Fn(i64) -> bool,
) -> Vec<EmoteUse> {
	let mut emotes: Vec<EmoteUse> = Vec::new();
	for word in text.split_whitespace() {
		if word.len() < 3 || !word.starts_with(':') || !word.ends_with(':') {
			continue;
		}
		let name = &word[1..word.len() - 1];
		if emotes.iter().any(|e| e.code == word) {
			continue;
		}
		let Some(smile) = lookup(name) else {
			continue;
		};
		if smile.bonus_id == 0 || has_bonus(smile.bonus_id) {
			emotes.push(EmoteUse {
				code: word.to_string(),
				name: name.to_string(),
				url: smile.url,
			});
		}
	}
	emotes
}

impl PekaMessage {
	/// Decode an event payload. Bonuses are sorted once so entitlement
	/// checks can binary-search.
	pub fn from_payload(data: serde_json::Value) -> Result<Self, BotError> {
		let mut message: Self = serde_json::from_value(data).map_err(BotError::parse)?;
		message.store.bonuses.sort_unstable();
		Ok(message)
	}

	fn has_bonus(&self, id: i64) -> bool {
		self.store.bonuses.binary_search(&id).is_ok()
	}

	fn body_fragment(&self) -> Html {
		let mut escaped = escape_html(&self.text);
		let emotes = collect_emotes(&self.text, updater::smile, |id| self.has_bonus(id));
		let mut allowance = updater::smile_allowance(|id| self.has_bonus(id));
		for emote in emotes {
			if allowance == 0 {
				break;
			}
			let img = format!(r#"<img class="smile peka-smile" src="{}" alt="{}">"#, emote.url, emote.name);
			escaped = escaped.replacen(&emote.code, &img, 1);
			allowance -= 1;
		}
		Html::new(format!(r#"<div class="message peka-message">{escaped}</div>"#))
	}

	fn nickname_fragment(&self) -> Html {
		let badge = if self.store.icon != 0 {
			updater::icon_url(self.store.icon)
				.map(|url| format!(r#"<img class="badge peka-badge" src="{url}">"#))
				.unwrap_or_default()
		} else {
			String::new()
		};
		let nickname = format!(r#"<p class="nickname peka-nickname">{}</p>"#, escape_html(&self.from.name));
		Html::new(format!(r#"<div class="nickname-badge peka-nickname-badge">{badge}{nickname}</div>"#))
	}

	#[cfg(test)]
	pub(crate) fn computed_render_stages(&self) -> usize {
		self.render.computed_stages()
	}
}

impl ChatMessage for PekaMessage {
	fn render_body(&self) -> Html {
		self.render.body(|| self.body_fragment())
	}

	fn render_nickname(&self) -> Html {
		self.render.nickname(|| self.nickname_fragment())
	}

	fn render_combined(&self) -> Html {
		self.render
			.combined(|| combined_fragment("peka", &self.render_nickname(), &self.render_body()))
	}

	fn chat_name(&self) -> &'static str {
		"peka2tv"
	}

	fn plain_text(&self) -> &str {
		&self.text
	}

	fn mentions_user(&self, name: &str) -> bool {
		self.to.as_ref().is_some_and(|to| to.name.eq_ignore_ascii_case(name))
	}

	fn sender_name(&self) -> &str {
		&self.from.name
	}

	fn is_user_message(&self) -> bool {
		self.from.id != 0
	}

	fn channel_name(&self) -> String {
		self.channel.clone()
	}

	fn sender_color(&self) -> String {
		let mut color = "#000".to_string();
		for id in &self.store.bonuses {
			if let Some(c) = updater::nick_color(*id) {
				color = c;
			}
		}
		color
	}

	fn is_moderation_event(&self) -> bool {
		self.kind == CLEAR_TYPE
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	fn seed_catalogue() {
		updater::install_test_catalogue(
			&[
				("peka", "http://peka2.tv/img/peka.png", 0),
				("vipsmile", "http://peka2.tv/img/vip.png", 201),
			],
			&[(202, "#00ff00"), (203, "#0000ff")],
			&[(204, 5)],
			&[(7, "http://peka2.tv/img/icon7.png")],
		);
	}

	fn message(value: serde_json::Value) -> PekaMessage {
		PekaMessage::from_payload(value).unwrap()
	}

	#[test]
	fn decodes_message_payload() {
		let m = message(json!({
			"id": 12345,
			"channel": "stream/1337",
			"from": {"id": 42, "name": "firence"},
			"text": "hello there",
			"type": "message",
			"store": {"icon": 0, "bonuses": [3, 1, 2], "subs": []}
		}));
		assert_eq!(m.channel_name(), "stream/1337");
		assert_eq!(m.sender_name(), "firence");
		assert_eq!(m.store.bonuses, vec![1, 2, 3]);
		assert!(m.is_user_message());
		assert!(!m.is_moderation_event());
		assert_eq!(m.chat_name(), "peka2tv");
	}

	#[test]
	fn system_and_clear_messages_are_flagged() {
		let m = message(json!({"channel": "stream/1", "from": {"id": 0, "name": ""}, "text": "x"}));
		assert!(!m.is_user_message());

		let m = message(json!({
			"channel": "stream/1",
			"from": {"id": 9, "name": "mod"},
			"text": "",
			"type": "CLEARCHAT"
		}));
		assert!(m.is_moderation_event());
	}

	#[test]
	fn emote_collection_requires_entitlement() {
		seed_catalogue();
		let lookup = updater::smile;

		let found = collect_emotes(":peka: hello :vipsmile:", lookup, |_| false);
		assert_eq!(found.len(), 1);
		assert_eq!(found[0].code, ":peka:");

		let found = collect_emotes(":peka: hello :vipsmile:", lookup, |id| id == 201);
		assert_eq!(found.len(), 2);
		assert_eq!(found[1].name, "vipsmile");
	}

	#[test]
	fn emote_tokens_must_be_whole_words() {
		seed_catalogue();
		let found = collect_emotes("x:peka: :peka :unknown: ::", updater::smile, |_| true);
		assert!(found.is_empty());
	}

	#[test]
	fn body_render_caps_smiles_at_allowance() {
		seed_catalogue();
		let m = message(json!({
			"channel": "stream/1",
			"from": {"id": 42, "name": "firence"},
			"text": ":peka: one :peka: two :peka:"
		}));
		let body = m.render_body();
		// default allowance is 2, and repeats of one code count once
		assert_eq!(body.as_str().matches(r#"<img class="smile peka-smile""#).count(), 1);
		assert!(body.as_str().contains(":peka: two :peka:"));
		assert!(body.as_str().starts_with(r#"<div class="message peka-message">"#));
	}

	#[test]
	fn raised_allowance_renders_more_distinct_smiles() {
		seed_catalogue();
		let m = message(json!({
			"channel": "stream/1",
			"from": {"id": 42, "name": "firence"},
			"text": ":peka: and :vipsmile: and :peka:",
			"store": {"icon": 0, "bonuses": [201, 204], "subs": []}
		}));
		let body = m.render_body();
		assert_eq!(body.as_str().matches("<img").count(), 2);
		assert!(body.as_str().contains("vip.png"));
	}

	#[test]
	fn nickname_render_includes_store_icon() {
		seed_catalogue();
		let m = message(json!({
			"channel": "stream/1",
			"from": {"id": 42, "name": "<b>firence</b>"},
			"text": "hi",
			"store": {"icon": 7, "bonuses": [], "subs": []}
		}));
		let nickname = m.render_nickname();
		assert_eq!(
			nickname.as_str(),
			r#"<div class="nickname-badge peka-nickname-badge"><img class="badge peka-badge" src="http://peka2.tv/img/icon7.png"><p class="nickname peka-nickname">&lt;b&gt;firence&lt;/b&gt;</p></div>"#
		);
	}

	#[test]
	fn sender_color_takes_last_matching_bonus() {
		seed_catalogue();
		let m = message(json!({
			"channel": "stream/1",
			"from": {"id": 42, "name": "firence"},
			"text": "hi",
			"store": {"icon": 0, "bonuses": [203, 202], "subs": []}
		}));
		// bonuses are sorted, so 203 wins
		assert_eq!(m.sender_color(), "#0000ff");

		let plain = message(json!({"channel": "s", "from": {"id": 1, "name": "n"}, "text": "hi"}));
		assert_eq!(plain.sender_color(), "#000");
	}

	#[test]
	fn mentions_match_the_to_field_case_insensitively() {
		let m = message(json!({
			"channel": "stream/1",
			"from": {"id": 42, "name": "firence"},
			"to": {"id": 7, "name": "GriDer"},
			"text": "GriDer, hi"
		}));
		assert!(m.mentions_user("grider"));
		assert!(m.mentions_user("GRIDER"));
		assert!(!m.mentions_user("firence"));

		let no_to = message(json!({"channel": "s", "from": {"id": 1, "name": "n"}, "text": "grider, hi"}));
		assert!(!no_to.mentions_user("grider"));
	}

	#[test]
	fn renders_are_memoized() {
		seed_catalogue();
		let m = message(json!({
			"channel": "stream/1",
			"from": {"id": 42, "name": "firence"},
			"text": ":peka:"
		}));
		let first = m.render_combined();
		assert_eq!(m.computed_render_stages(), 3);
		assert_eq!(first, m.render_combined());
		assert_eq!(m.computed_render_stages(), 3);
	}
}
