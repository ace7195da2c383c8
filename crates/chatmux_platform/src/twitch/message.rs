#![forbid(unsafe_code)]

use std::collections::HashMap;

use chatmux_domain::{BotError, Html};

use super::updater;
use crate::ChatMessage;
use crate::render::{RenderCache, combined_fragment, escape_html};

const EMOTE_URL_PREFIX: &str = "https://static-cdn.jtvnw.net/emoticons/v1/";

/// IRC command verbs the parser accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrcCommand {
	Privmsg,
	ClearChat,
	UserNotice,
	UserState,
	Join,
	RoomState,
}

impl IrcCommand {
	pub const fn as_wire(self) -> &'static str {
		match self {
			Self::Privmsg => "PRIVMSG",
			Self::ClearChat => "CLEARCHAT",
			Self::UserNotice => "USERNOTICE",
			Self::UserState => "USERSTATE",
			Self::Join => "JOIN",
			Self::RoomState => "ROOMSTATE",
		}
	}

	fn from_wire(s: &str) -> Result<Self, BotError> {
		match s {
			"PRIVMSG" => Ok(Self::Privmsg),
			"CLEARCHAT" => Ok(Self::ClearChat),
			"USERNOTICE" => Ok(Self::UserNotice),
			"USERSTATE" => Ok(Self::UserState),
			"JOIN" => Ok(Self::Join),
			"ROOMSTATE" => Ok(Self::RoomState),
			other => Err(BotError::Parse(format!("unsupported irc command: {other}"))),
		}
	}
}

/// One emote occurrence set inside a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TwitchEmote {
	pub id: String,
	pub name: String,
	/// How many ranges the emotes tag carried for this id.
	pub count: usize,
}

/// Normalized Twitch chat line.
///
/// Payload fields are immutable after [`parse_line`]; the render fragments
/// are memoized on first access.
#[derive(Debug)]
pub struct TwitchMessage {
	pub kind: IrcCommand,
	pub channel: String,
	pub text: String,
	/// Login of the sender; for CLEARCHAT this is the ban target carried in
	/// the trailing text.
	pub sender: String,
	pub display_name: String,
	pub color: String,
	/// Badge set name -> version, from the `badges` tag.
	pub badges: HashMap<String, String>,
	/// Tags with no dedicated field.
	pub tags: HashMap<String, String>,
	/// Emote name -> emote, resolved from the `emotes` tag against the text.
	pub emotes: HashMap<String, TwitchEmote>,
	pub is_mod: bool,
	pub room_id: u64,
	pub raw: String,
	render: RenderCache,
}

/// Parse a single tagged IRC line into a [`TwitchMessage`].
///
/// Grammar, in order: optional `@tag=value;...` prefix, `:origin` ending in
/// `tmi.twitch.tv` (with an optional `user!user@host` part), a command
/// verb, `#channel`, and an optional trailing `:text`. Anything else is a
/// [`BotError::Parse`]. PING lines are answered by the read loop before
/// this parser ever sees them.
pub fn parse_line(line: &str) -> Result<TwitchMessage, BotError> {
	let mut rest = line;

	let mut tags_raw = "";
	if let Some(after) = rest.strip_prefix('@') {
		let (tags, tail) = after
			.split_once(' ')
			.ok_or_else(|| BotError::Parse(format!("tag prefix without payload: {line}")))?;
		tags_raw = tags;
		rest = tail;
	}

	let rest = rest
		.strip_prefix(':')
		.ok_or_else(|| BotError::Parse(format!("missing origin prefix: {line}")))?;
	let (origin, rest) = rest
		.split_once(' ')
		.ok_or_else(|| BotError::Parse(format!("truncated line: {line}")))?;
	if !origin.ends_with("tmi.twitch.tv") {
		return Err(BotError::Parse(format!("unexpected origin host: {origin}")));
	}
	let sender = origin.split_once('!').map(|(user, _)| user.to_string()).unwrap_or_default();

	let (command, rest) = rest
		.split_once(' ')
		.ok_or_else(|| BotError::Parse(format!("missing channel: {line}")))?;
	let kind = IrcCommand::from_wire(command)?;

	let (channel_part, trailing) = match rest.split_once(' ') {
		Some((channel, trailing)) => (channel, Some(trailing)),
		None => (rest, None),
	};
	let channel = channel_part
		.strip_prefix('#')
		.ok_or_else(|| BotError::Parse(format!("missing #channel: {line}")))?;
	let text = trailing.map(|t| t.strip_prefix(':').unwrap_or(t)).unwrap_or("");

	let mut message = TwitchMessage {
		kind,
		channel: channel.to_string(),
		text: text.to_string(),
		sender,
		display_name: String::new(),
		color: String::new(),
		badges: HashMap::new(),
		tags: HashMap::new(),
		emotes: HashMap::new(),
		is_mod: false,
		room_id: 0,
		raw: line.to_string(),
		render: RenderCache::default(),
	};

	apply_tags(tags_raw, &mut message);

	if message.kind == IrcCommand::ClearChat {
		// CLEARCHAT carries the banned user as the trailing text.
		message.sender = message.text.clone();
	}

	Ok(message)
}

fn apply_tags(tags_raw: &str, message: &mut TwitchMessage) {
	for tag in tags_raw.split(';') {
		let (key, value) = tag.split_once('=').unwrap_or((tag, ""));
		match key {
			"" => {}
			"badges" => message.badges = parse_badges(value),
			"color" => message.color = value.to_string(),
			"display-name" => message.display_name = value.to_string(),
			"emotes" => message.emotes = parse_emotes(value, &message.text),
			"mod" => message.is_mod = value == "1",
			"room-id" => message.room_id = value.parse().unwrap_or(0),
			other => {
				message.tags.insert(other.to_string(), value.to_string());
			}
		}
	}
}

fn parse_badges(value: &str) -> HashMap<String, String> {
	let mut badges = HashMap::new();
	for badge in value.split(',') {
		if let Some((name, version)) = badge.split_once('/') {
			badges.insert(name.to_string(), version.to_string());
		}
	}
	badges
}

/// Resolve the `id:start-end,start-end/id:start-end` emote tag against the
/// message text. Offsets are Unicode codepoints, not bytes; groups with
/// out-of-range or malformed ranges are skipped.
fn parse_emotes(value: &str, text: &str) -> HashMap<String, TwitchEmote> {
	let mut emotes = HashMap::new();
	if value.is_empty() {
		return emotes;
	}

	let chars: Vec<char> = text.chars().collect();
	for group in value.split('/') {
		let Some((id, ranges)) = group.split_once(':') else {
			continue;
		};
		let count = ranges.split(',').count();
		let Some(first) = ranges.split(',').next() else {
			continue;
		};
		let Some((start, end)) = first.split_once('-') else {
			continue;
		};
		let (Ok(start), Ok(end)) = (start.parse::<usize>(), end.parse::<usize>()) else {
			continue;
		};
		let Some(slice) = chars.get(start..=end) else {
			continue;
		};
		let name: String = slice.iter().collect();
		emotes.insert(
			name.clone(),
			TwitchEmote {
				id: id.to_string(),
				name,
				count,
			},
		);
	}
	emotes
}

impl TwitchMessage {
	/// Body text with emote substitution, before the wrapping div.
	pub fn render_emoted_text(&self) -> String {
		let mut escaped = escape_html(&self.text);
		for emote in self.emotes.values() {
			let url = format!("{EMOTE_URL_PREFIX}{}/1.0", emote.id);
			let img = format!(r#"<img class="smile" src="{url}" alt="{}">"#, emote.name);
			escaped = escaped.replace(&emote.name, &img);
		}
		escaped
	}

	pub fn is_moderator(&self) -> bool {
		self.is_mod || self.badges.contains_key("moderator")
	}

	pub fn is_subscriber(&self) -> bool {
		self.badges.contains_key("subscriber")
	}

	fn nickname_fragment(&self) -> Html {
		let mut badges = String::new();
		for (name, version) in &self.badges {
			let resolved = if name == "subscriber" {
				updater::subscriber_badge(&self.channel, version)
			} else {
				updater::global_badge(name, version)
			};
			if let Some((url, title)) = resolved
				&& !url.is_empty()
			{
				badges.push_str(&format!(r#"<img class="badge twitch-badge" src="{url}" alt="{title}">"#));
			}
		}

		let display = if self.display_name.is_empty() {
			&self.sender
		} else {
			&self.display_name
		};
		let nickname = format!(r#"<p class="nickname twitch-nickname">{}</p>"#, escape_html(display));
		Html::new(format!(
			r#"<div class="nickname-badge twitch-nickname-badge">{badges}{nickname}</div>"#
		))
	}

	#[cfg(test)]
	pub(crate) fn computed_render_stages(&self) -> usize {
		self.render.computed_stages()
	}
}

impl ChatMessage for TwitchMessage {
	fn render_body(&self) -> Html {
		self.render
			.body(|| Html::new(format!(r#"<div class="message twitch-message">{}</div>"#, self.render_emoted_text())))
	}

	fn render_nickname(&self) -> Html {
		self.render.nickname(|| self.nickname_fragment())
	}

	fn render_combined(&self) -> Html {
		self.render
			.combined(|| combined_fragment("twitch", &self.render_nickname(), &self.render_body()))
	}

	fn chat_name(&self) -> &'static str {
		"twitch"
	}

	fn plain_text(&self) -> &str {
		&self.text
	}

	fn mentions_user(&self, name: &str) -> bool {
		self.text.to_lowercase().contains(&format!("@{}", name.to_lowercase()))
	}

	fn sender_name(&self) -> &str {
		&self.sender
	}

	fn is_user_message(&self) -> bool {
		self.kind == IrcCommand::Privmsg
	}

	fn channel_name(&self) -> String {
		self.channel.clone()
	}

	fn sender_color(&self) -> String {
		self.color.clone()
	}

	fn is_moderation_event(&self) -> bool {
		self.kind == IrcCommand::ClearChat
	}
}

#[cfg(test)]
mod tests {
	use proptest::prelude::*;

	use super::*;

	const PRIVMSG_LINE: &str = "@badges=subscriber/6;color=#E1630E;display-name=Haunterxx;emotes=88:11-18;id=04de4e6b-646d-4e02-94a9-d0ee80c93a3f;mod=0;room-id=24991333;sent-ts=1496852224609;subscriber=1;tmi-sent-ts=1496852221750;turbo=0;user-id=39647543;user-type= :haunterxx!haunterxx@haunterxx.tmi.twitch.tv PRIVMSG #imaqtpie :hashinshin PogChamp";

	const CLEARCHAT_LINE: &str = "@ban-duration=10;ban-reason=;room-id=24991333;target-user-id=135206893 :tmi.twitch.tv CLEARCHAT #imaqtpie :edyzetg";

	#[test]
	fn parses_privmsg_fixture() {
		let m = parse_line(PRIVMSG_LINE).unwrap();
		assert_eq!(m.kind, IrcCommand::Privmsg);
		assert_eq!(m.channel, "imaqtpie");
		assert_eq!(m.sender, "haunterxx");
		assert_eq!(m.display_name, "Haunterxx");
		assert_eq!(m.color, "#E1630E");
		assert_eq!(m.text, "hashinshin PogChamp");
		assert_eq!(m.room_id, 24991333);
		assert!(!m.is_mod);
		assert_eq!(m.badges.get("subscriber").map(String::as_str), Some("6"));
		assert_eq!(m.tags.get("user-id").map(String::as_str), Some("39647543"));
		assert_eq!(m.tags.get("user-type").map(String::as_str), Some(""));
		assert!(!m.tags.contains_key("badges"));

		let emote = m.emotes.get("PogChamp").unwrap();
		assert_eq!(emote.id, "88");
		assert_eq!(emote.count, 1);

		assert!(m.is_user_message());
		assert!(!m.is_moderation_event());
		assert!(m.is_subscriber());
		assert!(!m.is_moderator());
	}

	#[test]
	fn parses_clearchat_ban_fixture() {
		let m = parse_line(CLEARCHAT_LINE).unwrap();
		assert_eq!(m.kind, IrcCommand::ClearChat);
		assert_eq!(m.channel, "imaqtpie");
		assert_eq!(m.text, "edyzetg");
		assert_eq!(m.sender, "edyzetg");
		assert_eq!(m.room_id, 24991333);
		assert_eq!(m.tags.get("ban-duration").map(String::as_str), Some("10"));
		assert_eq!(m.tags.get("ban-reason").map(String::as_str), Some(""));
		assert!(!m.is_user_message());
		assert!(m.is_moderation_event());
	}

	#[test]
	fn rejects_non_irc_garbage() {
		assert!(matches!(parse_line("ggwpnotmessage"), Err(BotError::Parse(_))));
		assert!(matches!(
			parse_line(":nick!nick@irc.example.org PRIVMSG #chan :hi"),
			Err(BotError::Parse(_))
		));
		assert!(matches!(
			parse_line(":tmi.twitch.tv NOTICE #chan :unhandled verb"),
			Err(BotError::Parse(_))
		));
	}

	#[test]
	fn emote_ranges_are_codepoint_indexed() {
		// Cyrillic text before the emote shifts byte offsets away from
		// codepoint offsets.
		let m = parse_line(
			"@emotes=25:7-11 :x!x@x.tmi.twitch.tv PRIVMSG #c :привет Kappa",
		)
		.unwrap();
		let emote = m.emotes.get("Kappa").unwrap();
		assert_eq!(emote.id, "25");
		assert_eq!(emote.name, "Kappa");
	}

	#[test]
	fn emote_tag_with_multiple_ranges_counts_occurrences() {
		let m = parse_line("@emotes=25:0-4,6-10 :x!x@x.tmi.twitch.tv PRIVMSG #c :Kappa Kappa").unwrap();
		assert_eq!(m.emotes.get("Kappa").unwrap().count, 2);
	}

	#[test]
	fn malformed_emote_ranges_are_skipped() {
		let m = parse_line("@emotes=25:40-50 :x!x@x.tmi.twitch.tv PRIVMSG #c :short").unwrap();
		assert!(m.emotes.is_empty());

		let m = parse_line("@emotes=25:x-y/9:0-2 :x!x@x.tmi.twitch.tv PRIVMSG #c :hey there").unwrap();
		assert_eq!(m.emotes.len(), 1);
		assert!(m.emotes.contains_key("hey"));
	}

	#[test]
	fn mentions_are_at_prefixed_and_case_insensitive() {
		let m = parse_line(PRIVMSG_LINE).unwrap();
		assert!(!m.mentions_user("firence"));

		let with_mention = PRIVMSG_LINE.replace(":hashinshin PogChamp", ":@firence hashinshin PogChamp");
		let m = parse_line(&with_mention).unwrap();
		assert!(m.mentions_user("firence"));
		assert!(m.mentions_user("FiRence"));
		assert!(!m.mentions_user("irence!"));
	}

	#[test]
	fn body_render_substitutes_emotes() {
		let m = parse_line(PRIVMSG_LINE).unwrap();
		assert_eq!(
			m.render_emoted_text(),
			r#"hashinshin <img class="smile" src="https://static-cdn.jtvnw.net/emoticons/v1/88/1.0" alt="PogChamp">"#
		);
		assert_eq!(
			m.render_body().as_str(),
			r#"<div class="message twitch-message">hashinshin <img class="smile" src="https://static-cdn.jtvnw.net/emoticons/v1/88/1.0" alt="PogChamp"></div>"#
		);
	}

	#[test]
	fn renders_are_memoized() {
		let m = parse_line(PRIVMSG_LINE).unwrap();
		assert_eq!(m.computed_render_stages(), 0);

		let first = m.render_combined();
		// combined computes nickname and body exactly once each
		assert_eq!(m.computed_render_stages(), 3);

		let second = m.render_combined();
		assert_eq!(first, second);
		assert_eq!(m.render_body(), m.render_body());
		assert_eq!(m.computed_render_stages(), 3);
	}

	#[test]
	fn escapes_html_in_text_and_nickname() {
		let m = parse_line(":evil!evil@evil.tmi.twitch.tv PRIVMSG #c :<script>alert(1)</script>").unwrap();
		let body = m.render_body();
		assert!(body.as_str().contains("&lt;script&gt;alert(1)&lt;/script&gt;"));
		assert!(!body.as_str().contains("<script>"));
	}

	proptest! {
		// Generic (unrecognized) tags survive a parse round-trip: every
		// key=value literally encoded in the line reappears in the tag map.
		#[test]
		fn generic_tags_round_trip(
			tags in proptest::collection::btree_map("[a-z][a-z0-9-]{0,11}", "[a-zA-Z0-9#/:.]{0,12}", 1..6),
			text in "[a-zA-Z0-9 ]{1,30}",
		) {
			let reserved = ["badges", "color", "display-name", "emotes", "mod", "room-id"];
			let tags: std::collections::BTreeMap<_, _> =
				tags.into_iter().filter(|(k, _)| !reserved.contains(&k.as_str())).collect();
			prop_assume!(!tags.is_empty());

			let encoded = tags
				.iter()
				.map(|(k, v)| format!("{k}={v}"))
				.collect::<Vec<_>>()
				.join(";");
			let line = format!("@{encoded} :u!u@u.tmi.twitch.tv PRIVMSG #chan :{text}");

			let m = parse_line(&line).unwrap();
			prop_assert_eq!(m.text.as_str(), text.as_str());
			for (k, v) in &tags {
				prop_assert_eq!(m.tags.get(k.as_str()).map(String::as_str), Some(v.as_str()));
			}
		}
	}
}
