//! Input-line parsing.

/// A parsed slash command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputCommand {
    Join {
        channel: String,
        key: Option<String>,
    },
    /// Part `channel`, or the focused channel when `None`.
    Part {
        channel: Option<String>,
        reason: Option<String>,
    },
    /// Send a private message and open a query with `target`.
    Msg { target: String, text: String },
    Me(String),
    Nick(String),
    /// Set the focused channel's topic, or request it when `None`.
    Topic(Option<String>),
    /// Raw line sent to the server verbatim.
    Quote(String),
    /// Close the focused query, or part the focused channel.
    Close,
    Quit(Option<String>),
}

/// What to do with one submitted line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// Send to the focused window.
    Text(String),
    Command(InputCommand),
    /// Nothing to do.
    Empty,
}

impl Input {
    pub fn parse(line: &str) -> Self {
        if line.trim().is_empty() {
            return Input::Empty;
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Input::Text(line.to_string());
        };
        if rest.starts_with('/') {
            return Input::Text(rest.to_string());
        }

        let (cmd, args) = match rest.split_once(' ') {
            Some((cmd, args)) => (cmd, args.trim()),
            None => (rest, ""),
        };
        let (first, tail) = split_word(args);

        let command = match cmd.to_ascii_lowercase().as_str() {
            "join" | "j" => first.map(|channel| InputCommand::Join {
                channel: channel.to_string(),
                key: split_word(tail).0.map(str::to_string),
            }),
            "part" | "leave" => match first {
                Some(channel) if is_channel(channel) => Some(InputCommand::Part {
                    channel: Some(channel.to_string()),
                    reason: non_empty(tail),
                }),
                _ => Some(InputCommand::Part {
                    channel: None,
                    reason: non_empty(args),
                }),
            },
            "msg" | "query" => match (first, non_empty(tail)) {
                (Some(target), Some(text)) => Some(InputCommand::Msg {
                    target: target.to_string(),
                    text,
                }),
                _ => None,
            },
            "me" => non_empty(args).map(InputCommand::Me),
            "nick" => first.map(|nick| InputCommand::Nick(nick.to_string())),
            "topic" => Some(InputCommand::Topic(non_empty(args))),
            "quote" | "raw" => non_empty(args).map(InputCommand::Quote),
            "close" => Some(InputCommand::Close),
            "quit" => Some(InputCommand::Quit(non_empty(args))),
            "" => None,
            other => {
                let verb = other.to_ascii_uppercase();
                Some(InputCommand::Quote(if args.is_empty() {
                    verb
                } else {
                    format!("{verb} {args}")
                }))
            }
        };
        command.map_or(Input::Empty, Input::Command)
    }
}

/// Whether `name` looks like a channel rather than a nick.
pub fn is_channel(name: &str) -> bool {
    name.starts_with(['#', '&', '+', '!'])
}

fn split_word(s: &str) -> (Option<&str>, &str) {
    let s = s.trim_start();
    if s.is_empty() {
        return (None, "");
    }
    match s.split_once(' ') {
        Some((word, rest)) => (Some(word), rest.trim_start()),
        None => (Some(s), ""),
    }
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(line: &str) -> InputCommand {
        match Input::parse(line) {
            Input::Command(c) => c,
            other => panic!("{line:?} parsed as {other:?}"),
        }
    }

    #[test]
    fn plain_text_and_escapes() {
        assert_eq!(Input::parse("hello"), Input::Text("hello".to_string()));
        assert_eq!(Input::parse("//me waves"), Input::Text("/me waves".to_string()));
        assert_eq!(Input::parse("   "), Input::Empty);
        assert_eq!(Input::parse("/"), Input::Empty);
    }

    #[test]
    fn join_and_part() {
        assert_eq!(
            cmd("/join #rust secret"),
            InputCommand::Join {
                channel: "#rust".to_string(),
                key: Some("secret".to_string())
            }
        );
        assert_eq!(Input::parse("/join"), Input::Empty);
        assert_eq!(
            cmd("/part #rust bye all"),
            InputCommand::Part {
                channel: Some("#rust".to_string()),
                reason: Some("bye all".to_string())
            }
        );
        assert_eq!(
            cmd("/part later"),
            InputCommand::Part {
                channel: None,
                reason: Some("later".to_string())
            }
        );
    }

    #[test]
    fn msg_requires_target_and_text() {
        assert_eq!(
            cmd("/msg bob hi there"),
            InputCommand::Msg {
                target: "bob".to_string(),
                text: "hi there".to_string()
            }
        );
        assert_eq!(Input::parse("/msg bob"), Input::Empty);
    }

    #[test]
    fn misc_commands() {
        assert_eq!(cmd("/ME waves"), InputCommand::Me("waves".to_string()));
        assert_eq!(cmd("/nick deck2"), InputCommand::Nick("deck2".to_string()));
        assert_eq!(cmd("/topic"), InputCommand::Topic(None));
        assert_eq!(cmd("/topic new topic"), InputCommand::Topic(Some("new topic".to_string())));
        assert_eq!(cmd("/close"), InputCommand::Close);
        assert_eq!(cmd("/quit"), InputCommand::Quit(None));
        assert_eq!(cmd("/quote MODE #x +m"), InputCommand::Quote("MODE #x +m".to_string()));
    }

    #[test]
    fn unknown_commands_are_sent_raw() {
        assert_eq!(cmd("/whois alice"), InputCommand::Quote("WHOIS alice".to_string()));
        assert_eq!(cmd("/motd"), InputCommand::Quote("MOTD".to_string()));
    }
}
