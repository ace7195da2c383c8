#![forbid(unsafe_code)]

mod bot;
mod message;
mod updater;

pub use bot::{TwitchBot, TwitchConfig};
pub use message::{IrcCommand, TwitchEmote, TwitchMessage, parse_line};
