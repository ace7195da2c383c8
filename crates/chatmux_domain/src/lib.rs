#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Supported chat platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
	Twitch,
	Peka2tv,
	GoodGame,
	YouTube,
}

impl Platform {
	/// Stable string identifier, also used in CSS class names.
	pub const fn as_str(self) -> &'static str {
		match self {
			Platform::Twitch => "twitch",
			Platform::Peka2tv => "peka2tv",
			Platform::GoodGame => "goodgame",
			Platform::YouTube => "youtube",
		}
	}
}

impl fmt::Display for Platform {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown platform: {0}")]
	UnknownPlatform(String),
}

impl FromStr for Platform {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"twitch" => Ok(Platform::Twitch),
			"peka2tv" | "peka" => Ok(Platform::Peka2tv),
			"goodgame" | "gg" => Ok(Platform::GoodGame),
			"youtube" | "yt" => Ok(Platform::YouTube),
			other => Err(ParseIdError::UnknownPlatform(other.to_string())),
		}
	}
}

/// A rendered HTML fragment.
///
/// Render methods memoize these on the message instance; once produced the
/// fragment is stable for the lifetime of the message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Html(String);

impl Html {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for Html {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl From<String> for Html {
	fn from(s: String) -> Self {
		Self(s)
	}
}

/// Adapter error taxonomy.
///
/// Read loops handle `Transport` and `Parse` locally (reconnect / drop);
/// everything else propagates to the caller as a value. Adapters never
/// panic on any of these in normal operation.
#[derive(Debug, Error)]
pub enum BotError {
	/// Dial/read/write failure. Triggers the reconnect path unless the
	/// disconnect was user-initiated.
	#[error("transport: {0}")]
	Transport(String),

	/// Bad credentials or token. Fatal for the adapter, never auto-retried.
	#[error("auth: {0}")]
	Auth(String),

	/// Malformed frame or line. Logged and dropped inside read loops.
	#[error("parse: {0}")]
	Parse(String),

	/// Capability not implemented by this platform.
	#[error("unsupported operation: {0}")]
	Unsupported(&'static str),

	/// Channel/stream resolution failure, returned synchronously from join.
	#[error("lookup: {0}")]
	Lookup(String),

	/// Operation attempted before connect (or after disconnect).
	#[error("not connected")]
	NotConnected,
}

impl BotError {
	pub fn transport(err: impl fmt::Display) -> Self {
		Self::Transport(err.to_string())
	}

	pub fn auth(err: impl fmt::Display) -> Self {
		Self::Auth(err.to_string())
	}

	pub fn parse(err: impl fmt::Display) -> Self {
		Self::Parse(err.to_string())
	}

	pub fn lookup(err: impl fmt::Display) -> Self {
		Self::Lookup(err.to_string())
	}

	/// True only for errors the caller should treat as "try again later"
	/// rather than a misuse of the API.
	pub fn is_transient(&self) -> bool {
		matches!(self, Self::Transport(_) | Self::Lookup(_))
	}
}
