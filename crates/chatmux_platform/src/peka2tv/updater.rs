#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::Context;
use parking_lot::RwLock;
use serde::Deserialize;

const SMILES_URL: &str = "http://peka2.tv/api/smile";
const BONUS_STORE_URL: &str = "http://peka2.tv/api/store/bonus/list";
const ICONS_URL: &str = "http://peka2.tv/api/icon/list";

const REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// One chat emote: the image plus the bonus that unlocks it (0 = global).
#[derive(Debug, Clone, Default)]
pub(crate) struct Smile {
	pub url: String,
	pub bonus_id: i64,
}

static UPDATER: OnceLock<()> = OnceLock::new();

fn smiles() -> &'static RwLock<HashMap<String, Smile>> {
	static CACHE: OnceLock<RwLock<HashMap<String, Smile>>> = OnceLock::new();
	CACHE.get_or_init(|| RwLock::new(HashMap::new()))
}

fn nick_colors() -> &'static RwLock<HashMap<i64, String>> {
	static CACHE: OnceLock<RwLock<HashMap<i64, String>>> = OnceLock::new();
	CACHE.get_or_init(|| RwLock::new(HashMap::new()))
}

/// bonus id -> smiles-per-message allowance
fn message_allowances() -> &'static RwLock<HashMap<i64, usize>> {
	static CACHE: OnceLock<RwLock<HashMap<i64, usize>>> = OnceLock::new();
	CACHE.get_or_init(|| RwLock::new(HashMap::new()))
}

fn icons() -> &'static RwLock<HashMap<i64, String>> {
	static CACHE: OnceLock<RwLock<HashMap<i64, String>>> = OnceLock::new();
	CACHE.get_or_init(|| RwLock::new(HashMap::new()))
}

#[derive(Debug, Deserialize)]
struct SmileEntry {
	code: String,
	url: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct BonusConfig {
	smiles: Vec<String>,
	amount: usize,
	color: String,
}

#[derive(Debug, Deserialize)]
struct BonusEntry {
	id: i64,
	#[serde(default)]
	config: BonusConfig,
	#[serde(rename = "type", default)]
	kind: String,
}

#[derive(Debug, Deserialize)]
struct IconEntry {
	id: i64,
	url: String,
}

/// Spawn the hourly smile/bonus/icon refresher; repeated calls are no-ops.
pub(crate) fn ensure_store_updater() {
	UPDATER.get_or_init(|| {
		tokio::spawn(async {
			let mut interval = tokio::time::interval(REFRESH_INTERVAL);
			loop {
				interval.tick().await;
				if let Err(err) = refresh().await {
					tracing::warn!("peka2tv store refresh failed: {err:#}");
				}
			}
		});
	});
}

async fn refresh() -> anyhow::Result<()> {
	let smile_entries: Vec<SmileEntry> = fetch_json(SMILES_URL).await?;
	merge_smiles(smile_entries.into_iter().map(|s| (s.code, s.url)));

	let bonuses: Vec<BonusEntry> = fetch_json(BONUS_STORE_URL).await?;
	merge_bonuses(&bonuses);

	let icon_entries: Vec<IconEntry> = fetch_json(ICONS_URL).await?;
	icons().write().extend(icon_entries.into_iter().map(|i| (i.id, i.url)));

	tracing::debug!(smiles = smiles().read().len(), "refreshed peka2tv store");
	Ok(())
}

async fn fetch_json<T: serde::de::DeserializeOwned>(url: &str) -> anyhow::Result<T> {
	reqwest::get(url)
		.await
		.with_context(|| format!("requesting {url}"))?
		.error_for_status()
		.with_context(|| format!("status from {url}"))?
		.json()
		.await
		.with_context(|| format!("decoding {url}"))
}

fn merge_smiles(entries: impl IntoIterator<Item = (String, String)>) {
	let mut cache = smiles().write();
	for (code, url) in entries {
		cache.entry(code).or_default().url = url;
	}
}

fn merge_bonuses(bonuses: &[BonusEntry]) {
	for bonus in bonuses {
		match bonus.kind.as_str() {
			"smiles" => {
				let mut cache = smiles().write();
				for code in &bonus.config.smiles {
					cache.entry(code.clone()).or_default().bonus_id = bonus.id;
				}
			}
			"nickColor" => {
				nick_colors().write().insert(bonus.id, bonus.config.color.clone());
			}
			"smilesPerMessage" => {
				message_allowances().write().insert(bonus.id, bonus.config.amount);
			}
			_ => {}
		}
	}
}

pub(crate) fn smile(code: &str) -> Option<Smile> {
	smiles().read().get(code).cloned()
}

pub(crate) fn nick_color(bonus_id: i64) -> Option<String> {
	nick_colors().read().get(&bonus_id).cloned()
}

/// Per-message emote allowance for a sender: default 2, raised by the
/// largest `smilesPerMessage` bonus the sender holds.
pub(crate) fn smile_allowance(has_bonus: impl Fn(i64) -> bool) -> usize {
	let mut max = 2;
	for (id, amount) in message_allowances().read().iter() {
		if *amount > max && has_bonus(*id) {
			max = *amount;
		}
	}
	max
}

pub(crate) fn icon_url(id: i64) -> Option<String> {
	icons().read().get(&id).cloned()
}

#[cfg(test)]
pub(crate) fn install_test_catalogue(
	smile_entries: &[(&str, &str, i64)],
	colors: &[(i64, &str)],
	allowances: &[(i64, usize)],
	icon_entries: &[(i64, &str)],
) {
	let mut cache = smiles().write();
	for (code, url, bonus_id) in smile_entries {
		cache.insert(
			code.to_string(),
			Smile {
				url: url.to_string(),
				bonus_id: *bonus_id,
			},
		);
	}
	drop(cache);
	nick_colors().write().extend(colors.iter().map(|(id, c)| (*id, c.to_string())));
	message_allowances().write().extend(allowances.iter().copied());
	icons().write().extend(icon_entries.iter().map(|(id, url)| (*id, url.to_string())));
}
