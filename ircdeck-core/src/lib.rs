//! Live-session synchronization core for the ircdeck web client.
//!
//! Sits between the multi-server backend (anything implementing
//! [`backend::Backend`]) and the connected display clients:
//!
//! - [`tree`] derives the ordered server → channel/query display tree.
//! - [`focus`] holds the single shared focused node.
//! - [`history`] recalls submitted input per session.
//! - [`notify`] is the bounded notification handoff.
//! - [`stream`] drives each client's push loop and routes client commands.
//!
//! Nothing here touches a socket directly; transports plug in through
//! [`stream::FragmentSink`].

pub mod backend;
pub mod error;
pub mod focus;
pub mod fragment;
pub mod history;
pub mod input;
pub mod notify;
pub mod stream;
pub mod tree;
