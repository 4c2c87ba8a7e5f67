//! IRC client connection engine.
//!
//! One [`client::connect`] call drives one server connection in a spawned
//! task. Consumers send commands through the returned
//! [`client::ClientHandle`] and receive [`event::Event`]s on a channel.

pub mod client;
pub mod event;
pub mod irc;
