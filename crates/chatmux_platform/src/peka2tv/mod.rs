#![forbid(unsafe_code)]

mod bot;
mod message;
mod updater;

pub use bot::PekaBot;
pub use message::{PekaMessage, PekaStore, PekaUser};
