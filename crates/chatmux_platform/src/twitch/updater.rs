#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::Context;
use parking_lot::RwLock;
use serde::Deserialize;

const GLOBAL_BADGES_URL: &str = "https://badges.twitch.tv/v1/badges/global/display";
const CHANNEL_BADGES_URL: &str = "https://badges.twitch.tv/v1/badges/channels";
const KRAKEN_CHANNELS_URL: &str = "https://api.twitch.tv/kraken/channels";

const REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60);

static UPDATER: OnceLock<()> = OnceLock::new();
static CLIENT_ID: OnceLock<String> = OnceLock::new();

type BadgeMap = HashMap<String, HashMap<String, Badge>>;

fn global_badges() -> &'static RwLock<BadgeMap> {
	static CACHE: OnceLock<RwLock<BadgeMap>> = OnceLock::new();
	CACHE.get_or_init(|| RwLock::new(HashMap::new()))
}

/// channel login -> subscriber badge versions
fn channel_sub_badges() -> &'static RwLock<HashMap<String, HashMap<String, Badge>>> {
	static CACHE: OnceLock<RwLock<HashMap<String, HashMap<String, Badge>>>> = OnceLock::new();
	CACHE.get_or_init(|| RwLock::new(HashMap::new()))
}

#[derive(Debug, Clone, Deserialize)]
pub struct Badge {
	#[serde(default)]
	pub image_url_1x: String,
	#[serde(default)]
	pub image_url_2x: String,
	#[serde(default)]
	pub image_url_4x: String,
	#[serde(default)]
	pub title: String,
}

#[derive(Debug, Deserialize)]
struct BadgeVersions {
	#[serde(default)]
	versions: HashMap<String, Badge>,
}

#[derive(Debug, Deserialize)]
struct BadgesResponse {
	#[serde(default)]
	badge_sets: HashMap<String, BadgeVersions>,
}

#[derive(Debug, Deserialize)]
struct KrakenChannel {
	#[serde(rename = "_id")]
	id: u64,
}

/// Spawn the hourly global badge refresher. Repeated calls are no-ops; the
/// first caller's client id is kept for channel lookups.
pub fn ensure_badge_updater(client_id: Option<&str>) {
	if let Some(id) = client_id {
		let _ = CLIENT_ID.set(id.to_string());
	}
	UPDATER.get_or_init(|| {
		tokio::spawn(async {
			let mut interval = tokio::time::interval(REFRESH_INTERVAL);
			loop {
				interval.tick().await;
				if let Err(err) = refresh_global_badges().await {
					tracing::warn!("twitch global badge refresh failed: {err:#}");
				}
			}
		});
	});
}

async fn refresh_global_badges() -> anyhow::Result<()> {
	let resp: BadgesResponse = reqwest::get(GLOBAL_BADGES_URL)
		.await
		.context("requesting global badges")?
		.error_for_status()
		.context("global badges status")?
		.json()
		.await
		.context("decoding global badges")?;

	let sets: BadgeMap = resp.badge_sets.into_iter().map(|(name, set)| (name, set.versions)).collect();
	tracing::debug!(sets = sets.len(), "refreshed twitch global badges");
	*global_badges().write() = sets;
	Ok(())
}

/// Fetch and cache the subscriber badge set for a channel. Called once per
/// join; renders only ever read the cache.
pub async fn ensure_channel_sub_badges(channel: &str) {
	if channel_sub_badges().read().contains_key(channel) {
		return;
	}
	match fetch_channel_sub_badges(channel).await {
		Ok(versions) => {
			channel_sub_badges().write().insert(channel.to_string(), versions);
		}
		Err(err) => {
			tracing::warn!(channel, "twitch subscriber badge fetch failed: {err:#}");
		}
	}
}

async fn fetch_channel_sub_badges(channel: &str) -> anyhow::Result<HashMap<String, Badge>> {
	let client_id = CLIENT_ID.get().context("no client id configured")?;
	let client = reqwest::Client::new();

	let chan: KrakenChannel = client
		.get(format!("{KRAKEN_CHANNELS_URL}/{channel}"))
		.header("Client-ID", client_id)
		.send()
		.await
		.context("requesting channel id")?
		.error_for_status()
		.context("channel id status")?
		.json()
		.await
		.context("decoding channel id")?;

	let resp: BadgesResponse = client
		.get(format!("{CHANNEL_BADGES_URL}/{}/display", chan.id))
		.send()
		.await
		.context("requesting channel badges")?
		.error_for_status()
		.context("channel badges status")?
		.json()
		.await
		.context("decoding channel badges")?;

	Ok(resp
		.badge_sets
		.into_iter()
		.find(|(name, _)| name == "subscriber")
		.map(|(_, set)| set.versions)
		.unwrap_or_default())
}

/// Resolve a badge from the global set: `(image url, title)`.
pub fn global_badge(set: &str, version: &str) -> Option<(String, String)> {
	let cache = global_badges().read();
	let badge = cache.get(set)?.get(version)?;
	Some((badge.image_url_1x.clone(), badge.title.clone()))
}

/// Resolve a channel's subscriber badge by version.
pub fn subscriber_badge(channel: &str, version: &str) -> Option<(String, String)> {
	let cache = channel_sub_badges().read();
	let badge = cache.get(channel)?.get(version)?;
	Some((badge.image_url_1x.clone(), badge.title.clone()))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn decodes_badge_sets_payload() {
		let payload = r#"{
			"badge_sets": {
				"subscriber": {
					"versions": {
						"6": {
							"image_url_1x": "https://static-cdn.jtvnw.net/badges/v1/abc/1",
							"image_url_2x": "https://static-cdn.jtvnw.net/badges/v1/abc/2",
							"image_url_4x": "https://static-cdn.jtvnw.net/badges/v1/abc/3",
							"title": "6-Month Subscriber"
						}
					}
				}
			}
		}"#;
		let resp: BadgesResponse = serde_json::from_str(payload).unwrap();
		let badge = &resp.badge_sets["subscriber"].versions["6"];
		assert_eq!(badge.title, "6-Month Subscriber");
		assert!(badge.image_url_1x.ends_with("/abc/1"));
	}

	#[test]
	fn badge_lookup_misses_are_none() {
		assert!(global_badge("no-such-set", "1").is_none());
		assert!(subscriber_badge("no-such-channel", "1").is_none());
	}

	#[test]
	fn subscriber_cache_serves_inserted_channel() {
		let mut versions = HashMap::new();
		versions.insert(
			"6".to_string(),
			Badge {
				image_url_1x: "https://example.invalid/sub6".to_string(),
				image_url_2x: String::new(),
				image_url_4x: String::new(),
				title: "Subscriber".to_string(),
			},
		);
		channel_sub_badges().write().insert("testchannel".to_string(), versions);

		let (url, title) = subscriber_badge("testchannel", "6").unwrap();
		assert_eq!(url, "https://example.invalid/sub6");
		assert_eq!(title, "Subscriber");
		assert!(subscriber_badge("testchannel", "7").is_none());
	}
}
