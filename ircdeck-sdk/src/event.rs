//! Events emitted by the IRC client for the consumer to apply.

use std::collections::HashMap;

/// Events that a running connection emits to its consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// TCP (and TLS, if requested) connection established.
    Connected,

    /// Registration complete. `nick` is our confirmed nick.
    Registered {
        nick: String,
    },

    /// SASL succeeded.
    Authenticated {
        account: String,
    },
    AuthFailed {
        reason: String,
    },

    /// Someone (possibly us) joined a channel.
    Joined {
        channel: String,
        nick: String,
    },

    /// Someone (possibly us) left a channel.
    Parted {
        channel: String,
        nick: String,
    },

    /// Someone was kicked from a channel.
    Kicked {
        channel: String,
        nick: String,
        by: String,
        reason: String,
    },

    /// A PRIVMSG or user NOTICE to a channel or to us.
    Message {
        from: String,
        target: String,
        text: String,
        notice: bool,
        tags: HashMap<String, String>,
    },

    /// NAMES reply (353); may arrive in several parts.
    Names {
        channel: String,
        nicks: Vec<String>,
    },

    /// Topic received on join (332) or changed live.
    TopicChanged {
        channel: String,
        topic: String,
        set_by: Option<String>,
    },

    NickChanged {
        old_nick: String,
        new_nick: String,
    },

    UserQuit {
        nick: String,
        reason: String,
    },

    /// Server notice, MOTD line, or error numeric.
    ServerNotice {
        text: String,
    },

    /// Connection closed.
    Disconnected {
        reason: String,
    },
}
