#![forbid(unsafe_code)]

use chatmux_domain::BotError;
use chrono::{DateTime, Utc};
use serde::Deserialize;

const SEARCH_URL: &str = "https://www.googleapis.com/youtube/v3/search";
const VIDEOS_URL: &str = "https://www.googleapis.com/youtube/v3/videos";
const MESSAGES_URL: &str = "https://www.googleapis.com/youtube/v3/liveChat/messages";
const BANS_URL: &str = "https://www.googleapis.com/youtube/v3/liveChat/bans";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct PageInfo {
	#[serde(rename = "totalResults")]
	pub total_results: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct VideoId {
	#[serde(rename = "videoId")]
	video_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SearchItem {
	id: VideoId,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SearchResponse {
	#[serde(rename = "pageInfo")]
	page_info: PageInfo,
	items: Vec<SearchItem>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LiveStreamingDetails {
	#[serde(rename = "activeLiveChatId")]
	active_live_chat_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct VideoItem {
	#[serde(rename = "liveStreamingDetails")]
	live_streaming_details: LiveStreamingDetails,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct VideosResponse {
	items: Vec<VideoItem>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub(crate) struct ItemSnippet {
	#[serde(rename = "displayMessage")]
	pub display_message: String,
	#[serde(rename = "publishedAt")]
	pub published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub(crate) struct ItemAuthor {
	#[serde(rename = "displayName")]
	pub display_name: String,
	#[serde(rename = "isChatOwner")]
	pub is_chat_owner: bool,
	#[serde(rename = "isChatModerator")]
	pub is_chat_moderator: bool,
}

/// One entry of a liveChat/messages page.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub(crate) struct ChatItem {
	pub snippet: ItemSnippet,
	#[serde(rename = "authorDetails")]
	pub author_details: ItemAuthor,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct MessagesPage {
	#[serde(rename = "pollingIntervalMillis")]
	pub polling_interval_millis: u64,
	#[serde(rename = "pageInfo")]
	pub page_info: PageInfo,
	pub items: Vec<ChatItem>,
}

/// Thin wrapper over the YouTube Data API v3 endpoints the adapter needs.
#[derive(Clone)]
pub(crate) struct YtClient {
	http: reqwest::Client,
	api_key: String,
}

impl YtClient {
	pub fn new(api_key: String) -> Self {
		Self {
			http: reqwest::Client::new(),
			api_key,
		}
	}

	/// Channel id -> live video -> active live chat id. Either hop coming
	/// back empty is a lookup failure, not a transport one.
	pub async fn resolve_chat_id(&self, channel_id: &str) -> Result<String, BotError> {
		let search: SearchResponse = self
			.http
			.get(SEARCH_URL)
			.query(&[
				("part", "snippet"),
				("channelId", channel_id),
				("type", "video"),
				("eventType", "live"),
				("key", &self.api_key),
			])
			.send()
			.await
			.map_err(BotError::transport)?
			.json()
			.await
			.map_err(BotError::parse)?;
		let Some(item) = search.items.first().filter(|_| search.page_info.total_results > 0) else {
			return Err(BotError::lookup(format!("channel {channel_id} has no live stream")));
		};

		let videos: VideosResponse = self
			.http
			.get(VIDEOS_URL)
			.query(&[
				("id", item.id.video_id.as_str()),
				("part", "liveStreamingDetails"),
				("key", &self.api_key),
			])
			.send()
			.await
			.map_err(BotError::transport)?
			.json()
			.await
			.map_err(BotError::parse)?;
		videos
			.items
			.first()
			.map(|v| v.live_streaming_details.active_live_chat_id.clone())
			.filter(|id| !id.is_empty())
			.ok_or_else(|| BotError::lookup(format!("no active chat for channel {channel_id}")))
	}

	pub async fn messages(&self, chat_id: &str) -> Result<MessagesPage, BotError> {
		self.http
			.get(MESSAGES_URL)
			.query(&[
				("liveChatId", chat_id),
				("part", "id,snippet,authorDetails"),
				("key", &self.api_key),
			])
			.send()
			.await
			.map_err(BotError::transport)?
			.error_for_status()
			.map_err(BotError::transport)?
			.json()
			.await
			.map_err(BotError::parse)
	}

	pub async fn send_message(&self, chat_id: &str, text: &str, oauth_token: &str) -> Result<(), BotError> {
		let body = serde_json::json!({
			"snippet": {
				"liveChatId": chat_id,
				"type": "textMessageEvent",
				"textMessageDetails": { "messageText": text }
			}
		});
		self.http
			.post(MESSAGES_URL)
			.query(&[("part", "snippet"), ("access_token", oauth_token), ("key", &self.api_key)])
			.json(&body)
			.send()
			.await
			.map_err(BotError::transport)?
			.error_for_status()
			.map_err(BotError::transport)?;
		Ok(())
	}

	pub async fn ban_user(&self, chat_id: &str, user_channel_id: &str, seconds: u32, oauth_token: &str) -> Result<(), BotError> {
		let body = serde_json::json!({
			"snippet": {
				"liveChatId": chat_id,
				"type": "temporary",
				"banDurationSeconds": seconds,
				"bannedUserDetails": { "channelId": user_channel_id }
			}
		});
		self.http
			.post(BANS_URL)
			.query(&[("part", "snippet"), ("access_token", oauth_token), ("key", &self.api_key)])
			.json(&body)
			.send()
			.await
			.map_err(BotError::transport)?
			.error_for_status()
			.map_err(BotError::transport)?;
		Ok(())
	}
}
