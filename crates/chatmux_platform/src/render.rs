#![forbid(unsafe_code)]

use std::sync::OnceLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use chatmux_domain::Html;

/// Per-message memoization of the three render stages.
///
/// Messages are immutable after parse, so there is no invalidation path:
/// each stage is computed at most once and the cached fragment is returned
/// unconditionally afterwards.
#[derive(Debug, Default)]
pub(crate) struct RenderCache {
	nickname: OnceLock<Html>,
	body: OnceLock<Html>,
	combined: OnceLock<Html>,
	computed: AtomicUsize,
}

impl RenderCache {
	pub(crate) fn nickname(&self, compute: impl FnOnce() -> Html) -> Html {
		self.nickname
			.get_or_init(|| {
				self.computed.fetch_add(1, Ordering::Relaxed);
				compute()
			})
			.clone()
	}

	pub(crate) fn body(&self, compute: impl FnOnce() -> Html) -> Html {
		self.body
			.get_or_init(|| {
				self.computed.fetch_add(1, Ordering::Relaxed);
				compute()
			})
			.clone()
	}

	pub(crate) fn combined(&self, compute: impl FnOnce() -> Html) -> Html {
		self.combined
			.get_or_init(|| {
				self.computed.fetch_add(1, Ordering::Relaxed);
				compute()
			})
			.clone()
	}

	/// Number of stages computed so far; lets tests prove a second render
	/// call hits the cache.
	pub(crate) fn computed_stages(&self) -> usize {
		self.computed.load(Ordering::Relaxed)
	}
}

/// Escape text for embedding in an HTML fragment.
pub fn escape_html(text: &str) -> String {
	let mut out = String::with_capacity(text.len());
	for c in text.chars() {
		match c {
			'&' => out.push_str("&amp;"),
			'<' => out.push_str("&lt;"),
			'>' => out.push_str("&gt;"),
			'"' => out.push_str("&#34;"),
			'\'' => out.push_str("&#39;"),
			other => out.push(other),
		}
	}
	out
}

/// Combined block shared by every platform: nickname + separator + body.
pub(crate) fn combined_fragment(platform: &str, nickname: &Html, body: &Html) -> Html {
	Html::new(format!(
		r#"<div class="full-message {platform}-full-message">{nickname}<span class="separator {platform}-separator"></span>{body}</div>"#
	))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn escapes_html_special_characters() {
		assert_eq!(escape_html(r#"<b>&"x"'y'</b>"#), "&lt;b&gt;&amp;&#34;x&#34;&#39;y&#39;&lt;/b&gt;");
		assert_eq!(escape_html("plain текст"), "plain текст");
	}

	#[test]
	fn cache_computes_each_stage_once() {
		let cache = RenderCache::default();

		let first = cache.body(|| Html::new("computed"));
		let second = cache.body(|| Html::new("must not run"));
		assert_eq!(first, second);
		assert_eq!(cache.computed_stages(), 1);

		cache.nickname(|| Html::new("nick"));
		cache.combined(|| Html::new("full"));
		assert_eq!(cache.computed_stages(), 3);
	}
}
