#![forbid(unsafe_code)]

mod bot;
mod client;
mod message;

pub use bot::YtBot;
pub use message::YtMessage;
