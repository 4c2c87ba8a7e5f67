//! IRC client connection.
//!
//! Manages the TCP (optionally TLS) connection, registration, CAP/SASL
//! negotiation and keepalive, and turns server lines into [`Event`]s.
//!
//! ## Reconnection
//!
//! The engine does not reconnect by itself. Consumers watch for
//! [`Event::Disconnected`] and call [`connect`] again with their own backoff.

use std::sync::Arc;

use anyhow::Result;
use base64::Engine;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls;

use crate::event::Event;
use crate::irc::{self, Message};

/// SASL PLAIN credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaslCredentials {
    pub username: String,
    pub password: String,
}

/// Configuration for connecting to an IRC server.
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    /// Server address (host:port).
    pub server_addr: String,
    /// Desired nickname.
    pub nick: String,
    /// Username (ident).
    pub user: String,
    /// Real name.
    pub realname: String,
    /// Use TLS.
    pub tls: bool,
    /// Authenticate with SASL PLAIN during registration.
    pub sasl: Option<SaslCredentials>,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:6667".to_string(),
            nick: "ircdeck".to_string(),
            user: "ircdeck".to_string(),
            realname: "ircdeck".to_string(),
            tls: false,
            sasl: None,
        }
    }
}

/// Commands the consumer can send to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Join { channel: String, key: Option<String> },
    Part { channel: String, reason: Option<String> },
    Privmsg { target: String, text: String },
    Nick(String),
    Topic { channel: String, topic: Option<String> },
    Raw(String),
    Quit(Option<String>),
}

/// A handle to a running IRC client connection.
#[derive(Clone, Debug)]
pub struct ClientHandle {
    cmd_tx: mpsc::Sender<Command>,
}

impl ClientHandle {
    pub async fn join(&self, channel: &str, key: Option<&str>) -> Result<()> {
        self.send(Command::Join {
            channel: channel.to_string(),
            key: key.map(str::to_string),
        })
        .await
    }

    pub async fn part(&self, channel: &str, reason: Option<&str>) -> Result<()> {
        self.send(Command::Part {
            channel: channel.to_string(),
            reason: reason.map(str::to_string),
        })
        .await
    }

    pub async fn privmsg(&self, target: &str, text: &str) -> Result<()> {
        self.send(Command::Privmsg {
            target: target.to_string(),
            text: text.to_string(),
        })
        .await
    }

    /// CTCP ACTION (`/me`).
    pub async fn action(&self, target: &str, text: &str) -> Result<()> {
        self.privmsg(target, &format!("\x01ACTION {text}\x01")).await
    }

    pub async fn nick(&self, nick: &str) -> Result<()> {
        self.send(Command::Nick(nick.to_string())).await
    }

    /// Set the topic, or query it when `topic` is `None`.
    pub async fn topic(&self, channel: &str, topic: Option<&str>) -> Result<()> {
        self.send(Command::Topic {
            channel: channel.to_string(),
            topic: topic.map(str::to_string),
        })
        .await
    }

    pub async fn raw(&self, line: &str) -> Result<()> {
        self.send(Command::Raw(line.to_string())).await
    }

    pub async fn quit(&self, message: Option<&str>) -> Result<()> {
        self.send(Command::Quit(message.map(str::to_string))).await
    }

    async fn send(&self, cmd: Command) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| anyhow::anyhow!("connection task has exited"))
    }

    /// Build a handle around an existing command channel (used by tests and
    /// consumers that drive their own transport).
    pub fn from_sender(cmd_tx: mpsc::Sender<Command>) -> Self {
        Self { cmd_tx }
    }
}

/// Connect to an IRC server and run the client.
///
/// Returns a handle for sending commands and a receiver for events. The
/// connection runs in a spawned task; failures surface as
/// [`Event::Disconnected`].
pub fn connect(config: ConnectConfig) -> (ClientHandle, mpsc::Receiver<Event>) {
    let (event_tx, event_rx) = mpsc::channel(4096);
    let (cmd_tx, cmd_rx) = mpsc::channel(256);

    tokio::spawn(async move {
        if let Err(e) = run_client(config, event_tx.clone(), cmd_rx).await {
            let _ = event_tx
                .send(Event::Disconnected {
                    reason: e.to_string(),
                })
                .await;
        }
    });

    (ClientHandle { cmd_tx }, event_rx)
}

async fn run_client(
    config: ConnectConfig,
    event_tx: mpsc::Sender<Event>,
    cmd_rx: mpsc::Receiver<Command>,
) -> Result<()> {
    tracing::debug!("Resolving {}...", config.server_addr);
    let tcp = TcpStream::connect(&config.server_addr)
        .await
        .map_err(|e| anyhow::anyhow!("TCP connect to {} failed: {e}", config.server_addr))?;

    if config.tls {
        let connector = TlsConnector::from(Arc::new(rustls_default_config()));
        let host = config
            .server_addr
            .rsplit_once(':')
            .map(|(h, _)| h)
            .unwrap_or(&config.server_addr);
        let dns_name = rustls::pki_types::ServerName::try_from(host.to_string())?;
        let tls = connector
            .connect(dns_name, tcp)
            .await
            .map_err(|e| anyhow::anyhow!("TLS handshake with {} failed: {e}", config.server_addr))?;
        tracing::debug!("TLS handshake with {} complete", config.server_addr);
        let _ = event_tx.send(Event::Connected).await;
        let (reader, writer) = tokio::io::split(tls);
        run_irc(BufReader::new(reader), writer, &config, event_tx, cmd_rx).await
    } else {
        tracing::debug!("TCP connected to {} (plain)", config.server_addr);
        let _ = event_tx.send(Event::Connected).await;
        let (reader, writer) = tokio::io::split(tcp);
        run_irc(BufReader::new(reader), writer, &config, event_tx, cmd_rx).await
    }
}

fn rustls_default_config() -> rustls::ClientConfig {
    let _ = rustls::crypto::ring::default_provider().install_default();
    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth()
}

/// Drive the IRC protocol over an established stream.
pub async fn run_irc<R, W>(
    mut reader: R,
    mut writer: W,
    config: &ConnectConfig,
    event_tx: mpsc::Sender<Event>,
    mut cmd_rx: mpsc::Receiver<Command>,
) -> Result<()>
where
    R: tokio::io::AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    writer.write_all(b"CAP LS 302\r\n").await?;
    writer
        .write_all(format!("NICK {}\r\n", config.nick).as_bytes())
        .await?;
    writer
        .write_all(format!("USER {} 0 * :{}\r\n", config.user, config.realname).as_bytes())
        .await?;

    let mut registered = false;
    let mut nick_tries: u32 = 0;
    let mut pending_commands: Vec<Command> = Vec::new();
    let mut line_buf = String::new();
    let mut last_activity = tokio::time::Instant::now();
    let ping_interval = tokio::time::Duration::from_secs(60);
    let ping_timeout = tokio::time::Duration::from_secs(120);
    let mut last_ping: Option<tokio::time::Instant> = None;

    loop {
        tokio::select! {
            result = reader.read_line(&mut line_buf) => {
                let n = result?;
                if n == 0 {
                    let _ = event_tx.send(Event::Disconnected { reason: "EOF".to_string() }).await;
                    break;
                }
                last_activity = tokio::time::Instant::now();

                if let Some(msg) = Message::parse(&line_buf) {
                    match msg.command.as_str() {
                        // ERR_NICKNAMEINUSE
                        "433" if !registered => {
                            nick_tries = nick_tries.saturating_add(1);
                            if nick_tries <= 5 {
                                let alt = format!("{}{}", config.nick, "_".repeat(nick_tries as usize));
                                writer.write_all(format!("NICK {alt}\r\n").as_bytes()).await?;
                            } else {
                                let _ = event_tx.send(Event::Disconnected { reason: "Nick in use".to_string() }).await;
                                break;
                            }
                        }
                        "CAP" => handle_cap_response(&msg, config, &mut writer).await?,
                        "AUTHENTICATE" => {
                            if msg.params.first().map(String::as_str) == Some("+")
                                && let Some(ref creds) = config.sasl
                            {
                                let payload = format!("{0}\0{0}\0{1}", creds.username, creds.password);
                                let encoded = base64::engine::general_purpose::STANDARD.encode(payload.as_bytes());
                                writer.write_all(format!("AUTHENTICATE {encoded}\r\n").as_bytes()).await?;
                            }
                        }
                        // RPL_SASLSUCCESS
                        "903" => {
                            let account = config.sasl.as_ref().map(|c| c.username.clone()).unwrap_or_default();
                            let _ = event_tx.send(Event::Authenticated { account }).await;
                            writer.write_all(b"CAP END\r\n").await?;
                        }
                        // ERR_SASLFAIL / ERR_SASLTOOLONG / ERR_SASLABORTED
                        "904" | "905" | "906" => {
                            let reason = msg.params.last().cloned().unwrap_or_else(|| "SASL failed".to_string());
                            let _ = event_tx.send(Event::AuthFailed { reason }).await;
                            writer.write_all(b"CAP END\r\n").await?;
                        }
                        "001" => {
                            let nick = msg.params.first().cloned().unwrap_or_default();
                            registered = true;
                            let _ = event_tx.send(Event::Registered { nick }).await;
                            for cmd in pending_commands.drain(..) {
                                execute_command(&mut writer, cmd).await?;
                            }
                        }
                        "PING" => {
                            let token = msg.params.first().map(String::as_str).unwrap_or("");
                            writer.write_all(format!("PONG :{token}\r\n").as_bytes()).await?;
                        }
                        "353" if msg.params.len() >= 4 => {
                            let channel = msg.params[2].clone();
                            let nicks = msg.params[3].split_whitespace().map(str::to_string).collect();
                            let _ = event_tx.send(Event::Names { channel, nicks }).await;
                        }
                        "332" if msg.params.len() >= 3 => {
                            let _ = event_tx.send(Event::TopicChanged {
                                channel: msg.params[1].clone(),
                                topic: msg.params[2].clone(),
                                set_by: None,
                            }).await;
                        }
                        "TOPIC" if !msg.params.is_empty() => {
                            let _ = event_tx.send(Event::TopicChanged {
                                channel: msg.params[0].clone(),
                                topic: msg.params.get(1).cloned().unwrap_or_default(),
                                set_by: msg.source_nick().map(str::to_string),
                            }).await;
                        }
                        "JOIN" => {
                            let channel = msg.params.first().cloned().unwrap_or_default();
                            let nick = msg.source_nick().unwrap_or("").to_string();
                            let _ = event_tx.send(Event::Joined { channel, nick }).await;
                        }
                        "PART" => {
                            let channel = msg.params.first().cloned().unwrap_or_default();
                            let nick = msg.source_nick().unwrap_or("").to_string();
                            let _ = event_tx.send(Event::Parted { channel, nick }).await;
                        }
                        "KICK" if msg.params.len() >= 2 => {
                            let _ = event_tx.send(Event::Kicked {
                                channel: msg.params[0].clone(),
                                nick: msg.params[1].clone(),
                                by: msg.source_nick().unwrap_or("server").to_string(),
                                reason: msg.params.get(2).cloned().unwrap_or_default(),
                            }).await;
                        }
                        "NICK" => {
                            let old_nick = msg.source_nick().unwrap_or("").to_string();
                            let new_nick = msg.params.first().cloned().unwrap_or_default();
                            if !old_nick.is_empty() && !new_nick.is_empty() {
                                let _ = event_tx.send(Event::NickChanged { old_nick, new_nick }).await;
                            }
                        }
                        "QUIT" => {
                            let nick = msg.source_nick().unwrap_or("").to_string();
                            let reason = msg.params.first().cloned().unwrap_or_default();
                            let _ = event_tx.send(Event::UserQuit { nick, reason }).await;
                        }
                        "PRIVMSG" | "NOTICE" if msg.params.len() >= 2 => {
                            let prefix = msg.prefix.as_deref().unwrap_or("");
                            if msg.command == "NOTICE" && !prefix.contains('!') {
                                // No hostmask: the server itself is talking.
                                let _ = event_tx.send(Event::ServerNotice { text: msg.params[1].clone() }).await;
                            } else {
                                let _ = event_tx.send(Event::Message {
                                    from: msg.source_nick().unwrap_or("").to_string(),
                                    target: msg.params[0].clone(),
                                    text: msg.params[1].clone(),
                                    notice: msg.command == "NOTICE",
                                    tags: msg.tags.clone(),
                                }).await;
                            }
                        }
                        _ => {
                            if let Some(text) = numeric_notice(&msg) {
                                let _ = event_tx.send(Event::ServerNotice { text }).await;
                            }
                        }
                    }
                }

                line_buf.clear();
            }
            Some(cmd) = cmd_rx.recv() => {
                if registered || matches!(cmd, Command::Quit(_)) {
                    let quitting = matches!(cmd, Command::Quit(_));
                    execute_command(&mut writer, cmd).await?;
                    if quitting {
                        writer.flush().await?;
                        let _ = event_tx.send(Event::Disconnected { reason: "Quit".to_string() }).await;
                        break;
                    }
                } else {
                    pending_commands.push(cmd);
                }
            }
            _ = tokio::time::sleep_until(last_ping.map_or(last_activity, |p| p.max(last_activity)) + ping_interval) => {
                if last_activity.elapsed() > ping_timeout {
                    let _ = event_tx.send(Event::Disconnected { reason: "Ping timeout".to_string() }).await;
                    break;
                }
                writer.write_all(b"PING :keepalive\r\n").await?;
                last_ping = Some(tokio::time::Instant::now());
            }
        }
    }

    Ok(())
}

/// Numerics worth showing in the status window: errors and the MOTD.
fn numeric_notice(msg: &Message) -> Option<String> {
    let num: u16 = msg.command.parse().ok()?;
    // param[0] is our own nick
    let body = if msg.params.len() > 1 {
        msg.params[1..].join(" ")
    } else {
        msg.params.join(" ")
    };
    match num {
        1..=5 | 372 | 375 | 376 => Some(body),
        400..=599 => Some(body),
        _ => None,
    }
}

/// Execute a single IRC command on the wire.
///
/// Line breaks and NULs never reach the wire from a parameter. Message text
/// is split into one PRIVMSG per line; every other field has them stripped.
async fn execute_command<W: AsyncWrite + Unpin>(writer: &mut W, cmd: Command) -> Result<()> {
    let lines = match cmd {
        Command::Privmsg { target, text } => {
            let target = one_line(&target);
            let kind = if irc::is_channel(&target) { "channel" } else { "query" };
            tracing::trace!(%target, kind, "-> PRIVMSG");
            text.split(['\r', '\n'])
                .map(one_line)
                .filter(|l| !l.is_empty())
                .map(|l| format!("PRIVMSG {target} :{l}"))
                .collect()
        }
        Command::Join { channel, key: Some(key) } => {
            vec![format!("JOIN {} {}", one_line(&channel), one_line(&key))]
        }
        Command::Join { channel, key: None } => vec![format!("JOIN {}", one_line(&channel))],
        Command::Part { channel, reason: Some(reason) } => {
            vec![format!("PART {} :{}", one_line(&channel), one_line(&reason))]
        }
        Command::Part { channel, reason: None } => vec![format!("PART {}", one_line(&channel))],
        Command::Nick(nick) => vec![format!("NICK {}", one_line(&nick))],
        Command::Topic { channel, topic: Some(topic) } => {
            vec![format!("TOPIC {} :{}", one_line(&channel), one_line(&topic))]
        }
        Command::Topic { channel, topic: None } => vec![format!("TOPIC {}", one_line(&channel))],
        Command::Raw(line) => vec![one_line(&line)],
        Command::Quit(Some(m)) => vec![format!("QUIT :{}", one_line(&m))],
        Command::Quit(None) => vec!["QUIT".to_string()],
    };
    for line in lines.into_iter().filter(|l| !l.is_empty()) {
        writer.write_all(format!("{line}\r\n").as_bytes()).await?;
    }
    Ok(())
}

fn one_line(s: &str) -> String {
    s.chars().filter(|c| !matches!(c, '\r' | '\n' | '\0')).collect()
}

async fn handle_cap_response<W: AsyncWrite + Unpin>(
    msg: &Message,
    config: &ConnectConfig,
    writer: &mut W,
) -> Result<()> {
    let subcmd = msg.params.get(1).map(|s| s.to_ascii_uppercase());
    match subcmd.as_deref() {
        Some("LS") => {
            // Multi-line LS ("CAP * LS * :caps..."): wait for the final line.
            if msg.params.get(2).map(String::as_str) == Some("*") {
                return Ok(());
            }
            let caps_str = msg.params.last().map(String::as_str).unwrap_or("");
            let offered: Vec<&str> = caps_str
                .split_whitespace()
                .map(|c| c.split('=').next().unwrap_or(c))
                .collect();
            let mut req_caps: Vec<&str> = ["message-tags", "server-time", "multi-prefix"]
                .into_iter()
                .filter(|cap| offered.contains(cap))
                .collect();
            if config.sasl.is_some() && offered.contains(&"sasl") {
                req_caps.push("sasl");
            }
            if req_caps.is_empty() {
                writer.write_all(b"CAP END\r\n").await?;
            } else {
                let req = format!("CAP REQ :{}\r\n", req_caps.join(" "));
                writer.write_all(req.as_bytes()).await?;
            }
        }
        Some("ACK") => {
            let caps = msg.params.last().map(String::as_str).unwrap_or("");
            if caps.split_whitespace().any(|c| c == "sasl") {
                writer.write_all(b"AUTHENTICATE PLAIN\r\n").await?;
            } else {
                writer.write_all(b"CAP END\r\n").await?;
            }
        }
        Some("NAK") => {
            writer.write_all(b"CAP END\r\n").await?;
        }
        _ => {}
    }
    Ok(())
}
