#![forbid(unsafe_code)]

mod bot;
mod message;
mod updater;

pub use bot::GgBot;
pub use message::GgMessage;
