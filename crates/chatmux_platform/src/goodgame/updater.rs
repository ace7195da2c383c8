#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::Context;
use parking_lot::RwLock;
use serde::Deserialize;

const GLOBAL_JS_URL: &str = "https://goodgame.ru/js/minified/global.js";

const REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60);

static UPDATER: OnceLock<()> = OnceLock::new();

/// One GoodGame smile. `channel_id == 0` means globally available.
#[derive(Debug, Clone, Default)]
pub(crate) struct GgSmile {
	pub id: i64,
	pub name: String,
	pub donat: i64,
	pub animated: bool,
	pub img_big: String,
	pub img_gif: String,
	pub channel_id: i64,
}

fn smiles() -> &'static RwLock<HashMap<String, GgSmile>> {
	static CACHE: OnceLock<RwLock<HashMap<String, GgSmile>>> = OnceLock::new();
	CACHE.get_or_init(|| RwLock::new(HashMap::new()))
}

#[derive(Debug, Deserialize)]
struct SmileJs {
	id: String,
	name: String,
	#[serde(default)]
	donat: i64,
	#[serde(default)]
	animated: bool,
	#[serde(default)]
	img_big: String,
	#[serde(default)]
	img_gif: String,
	#[serde(default)]
	channel_id: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GlobalJs {
	#[serde(rename = "smiles")]
	smiles: Vec<SmileJs>,
	#[serde(rename = "Channel_Smiles")]
	channel_smiles: HashMap<String, Vec<SmileJs>>,
}

/// Spawn the hourly smile catalogue refresher; repeated calls are no-ops.
pub(crate) fn ensure_smile_updater() {
	UPDATER.get_or_init(|| {
		tokio::spawn(async {
			let mut interval = tokio::time::interval(REFRESH_INTERVAL);
			loop {
				interval.tick().await;
				if let Err(err) = refresh().await {
					tracing::warn!("goodgame smile refresh failed: {err:#}");
				}
			}
		});
	});
}

async fn refresh() -> anyhow::Result<()> {
	let js = reqwest::get(GLOBAL_JS_URL)
		.await
		.context("requesting global.js")?
		.error_for_status()
		.context("global.js status")?
		.text()
		.await
		.context("reading global.js")?;
	let parsed = parse_global_js(&js)?;
	let count = merge_catalogue(parsed);
	tracing::debug!(smiles = count, "refreshed goodgame smiles");
	Ok(())
}

/// The smile catalogue ships as a JS object literal inside `global.js`.
/// Cut everything before the first `{`, quote the known bare keys, drop the
/// trailing statement semicolon, and the remainder parses as JSON.
pub(crate) fn js_to_json(js: &str) -> anyhow::Result<String> {
	let start = js.find('{').context("no object literal in global.js")?;
	let mut json = js[start..].to_string();
	for (bare, quoted) in [
		("Smiles", r#""smiles""#),
		("Channel_Smiles", r#""Channel_Smiles""#),
		("timezone_offset", r#""timezone_offset""#),
		("icons", r#""icons""#),
		("Content_Width", r#""Content_Width""#),
		("};", "}"),
	] {
		json = json.replacen(bare, quoted, 1);
	}
	Ok(json)
}

fn parse_global_js(js: &str) -> anyhow::Result<GlobalJs> {
	let json = js_to_json(js)?;
	serde_json::from_str(&json).context("decoding smile catalogue")
}

fn channel_id_of(value: &serde_json::Value) -> i64 {
	match value {
		serde_json::Value::Number(n) => n.as_i64().unwrap_or(0),
		serde_json::Value::String(s) => s.parse().unwrap_or(0),
		_ => 0,
	}
}

fn merge_catalogue(parsed: GlobalJs) -> usize {
	let mut cache = smiles().write();
	// channel smiles first: a same-named global smile wins
	for entries in parsed.channel_smiles.into_values() {
		for smile in entries {
			let channel_id = channel_id_of(&smile.channel_id);
			insert_smile(&mut cache, smile, channel_id);
		}
	}
	for smile in parsed.smiles {
		insert_smile(&mut cache, smile, 0);
	}
	cache.len()
}

fn insert_smile(cache: &mut HashMap<String, GgSmile>, smile: SmileJs, channel_id: i64) {
	let id = smile.id.parse().unwrap_or(0);
	cache.insert(
		smile.name.clone(),
		GgSmile {
			id,
			name: smile.name,
			donat: smile.donat,
			animated: smile.animated,
			img_big: smile.img_big,
			img_gif: smile.img_gif,
			channel_id,
		},
	);
}

pub(crate) fn smile(name: &str) -> Option<GgSmile> {
	smiles().read().get(name).cloned()
}

#[cfg(test)]
pub(crate) fn install_test_catalogue(entries: Vec<GgSmile>) {
	let mut cache = smiles().write();
	for smile in entries {
		cache.insert(smile.name.clone(), smile);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const GLOBAL_JS_FIXTURE: &str = r#"var Global = {Smiles: [
		{"id": "1", "name": "pozdravlyau", "donat": 0, "animated": false, "img_big": "https://static.goodgame.ru/images/smiles/pozdravlyau-big.png", "img_gif": ""},
		{"id": "2", "name": "lucky", "donat": 5, "animated": true, "img_big": "https://static.goodgame.ru/images/smiles/lucky-big.png", "img_gif": "https://static.goodgame.ru/images/smiles/lucky.gif"}
	], Channel_Smiles: {
		"1644": [{"id": "901", "name": "miker", "donat": 0, "animated": false, "img_big": "https://static.goodgame.ru/images/smiles/miker-big.png", "img_gif": "", "channel_id": "1644"}]
	}, timezone_offset: 180, Content_Width: 1280};"#;

	#[test]
	fn js_literal_becomes_json() {
		let json = js_to_json(GLOBAL_JS_FIXTURE).unwrap();
		assert!(json.starts_with(r#"{"smiles""#));
		assert!(json.ends_with('}'));
		let value: serde_json::Value = serde_json::from_str(&json).unwrap();
		assert_eq!(value["timezone_offset"], 180);
	}

	#[test]
	fn catalogue_merges_global_and_channel_smiles() {
		let parsed = parse_global_js(GLOBAL_JS_FIXTURE).unwrap();
		merge_catalogue(parsed);

		let global = smile("pozdravlyau").unwrap();
		assert_eq!(global.id, 1);
		assert_eq!(global.channel_id, 0);

		let paid = smile("lucky").unwrap();
		assert!(paid.animated);
		assert_eq!(paid.donat, 5);

		let channel = smile("miker").unwrap();
		assert_eq!(channel.channel_id, 1644);
		assert!(smile("nosuchsmile").is_none());
	}

	#[test]
	fn garbage_js_is_an_error() {
		assert!(js_to_json("no object here").is_err());
		assert!(parse_global_js("var x = {Smiles: [{]};").is_err());
	}
}
