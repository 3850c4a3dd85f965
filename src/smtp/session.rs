//! One SMTP conversation.
//!
//! Only the subset a submitting application needs: HELO/EHLO, MAIL, RCPT,
//! DATA, RSET, NOOP, QUIT. The envelope is tracked for sequencing and logs
//! only; recipients come from the message headers.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::config::ListenerConfig;
use crate::relay::{InboundTransaction, TransactionHandler};

/// Longest command line accepted.
const MAX_COMMAND_LINE: u64 = 1024;

/// Idle time allowed between client lines.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Connected,
    Greeted,
    MailFrom,
    RcptTo,
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Helo,
    Ehlo,
    Mail(String),
    Rcpt(String),
    Data,
    Rset,
    Noop,
    Quit,
    Unknown,
    Empty,
}

impl Command {
    fn parse(line: &str) -> Self {
        let line = line.trim_end_matches(['\r', '\n']);
        let (verb, rest) = line.split_once(' ').unwrap_or((line, ""));
        match verb.to_ascii_uppercase().as_str() {
            "" => Self::Empty,
            "HELO" => Self::Helo,
            "EHLO" => Self::Ehlo,
            "MAIL" => Self::Mail(path_arg(rest, "FROM:")),
            "RCPT" => Self::Rcpt(path_arg(rest, "TO:")),
            "DATA" => Self::Data,
            "RSET" => Self::Rset,
            "NOOP" => Self::Noop,
            "QUIT" => Self::Quit,
            _ => Self::Unknown,
        }
    }
}

/// Pull `addr` out of `FROM:<addr> PARAMS` / `TO:<addr>`.
fn path_arg(rest: &str, prefix: &str) -> String {
    let rest = rest.trim();
    let rest = match rest.get(..prefix.len()) {
        Some(p) if p.eq_ignore_ascii_case(prefix) => &rest[prefix.len()..],
        _ => rest,
    };
    let rest = rest.trim_start();
    let path = rest.split_whitespace().next().unwrap_or("");
    path.trim_start_matches('<').trim_end_matches('>').to_string()
}

/// Drives a single client connection.
pub struct Session<S> {
    stream: BufReader<S>,
    peer: Option<String>,
    handler: Arc<TransactionHandler>,
    config: Arc<ListenerConfig>,
    state: State,
    sender: Option<String>,
    envelope_recipients: Vec<String>,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(
        stream: S,
        peer: Option<String>,
        handler: Arc<TransactionHandler>,
        config: Arc<ListenerConfig>,
    ) -> Self {
        Self {
            stream: BufReader::new(stream),
            peer,
            handler,
            config,
            state: State::Connected,
            sender: None,
            envelope_recipients: Vec::new(),
        }
    }

    /// Run the conversation until QUIT, EOF or an idle timeout.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let greeting = format!("220 {} ESMTP notify-relay ready", self.config.banner_host);
        self.reply(&greeting).await?;

        let mut line = Vec::new();
        loop {
            line.clear();
            let read = tokio::time::timeout(
                IDLE_TIMEOUT,
                (&mut self.stream)
                    .take(MAX_COMMAND_LINE)
                    .read_until(b'\n', &mut line),
            )
            .await;
            let n = match read {
                Ok(result) => result?,
                Err(_) => {
                    self.reply("421 Idle timeout, closing connection").await?;
                    return Ok(());
                }
            };
            if n == 0 {
                tracing::debug!(peer = ?self.peer, "Client closed connection");
                return Ok(());
            }
            if !line.ends_with(b"\n") {
                self.reply("500 Line too long").await?;
                return Ok(());
            }

            let command = Command::parse(&String::from_utf8_lossy(&line));
            if !self.dispatch(command).await? {
                return Ok(());
            }
        }
    }

    /// Handle one command. Returns `false` when the connection should close.
    async fn dispatch(&mut self, command: Command) -> anyhow::Result<bool> {
        match command {
            Command::Helo => {
                self.reset_envelope(State::Greeted);
                let reply = format!("250 {}", self.config.banner_host);
                self.reply(&reply).await?;
            }
            Command::Ehlo => {
                self.reset_envelope(State::Greeted);
                let reply = format!(
                    "250-{}\r\n250-8BITMIME\r\n250 SIZE {}",
                    self.config.banner_host, self.config.max_message_bytes
                );
                self.reply(&reply).await?;
            }
            Command::Mail(from) => {
                if self.state != State::Greeted {
                    self.reply("503 Bad sequence of commands").await?;
                } else {
                    self.sender = Some(from);
                    self.state = State::MailFrom;
                    self.reply("250 OK").await?;
                }
            }
            Command::Rcpt(to) => {
                if !matches!(self.state, State::MailFrom | State::RcptTo) {
                    self.reply("503 Bad sequence of commands").await?;
                } else {
                    self.envelope_recipients.push(to);
                    self.state = State::RcptTo;
                    self.reply("250 OK").await?;
                }
            }
            Command::Data => {
                if self.state != State::RcptTo {
                    self.reply("503 Bad sequence of commands").await?;
                } else {
                    self.reply("354 End data with <CR><LF>.<CR><LF>").await?;
                    let reply = self.receive_data().await?;
                    self.reset_envelope(State::Greeted);
                    self.reply(&reply).await?;
                }
            }
            Command::Rset => {
                let state = if self.state == State::Connected {
                    State::Connected
                } else {
                    State::Greeted
                };
                self.reset_envelope(state);
                self.reply("250 OK").await?;
            }
            Command::Noop => self.reply("250 OK").await?,
            Command::Quit => {
                self.reply("221 Bye").await?;
                return Ok(false);
            }
            Command::Empty => self.reply("500 Syntax error, command unrecognized").await?,
            Command::Unknown => self.reply("502 Command not implemented").await?,
        }
        Ok(true)
    }

    /// Read the DATA section and relay it. Returns the reply line.
    async fn receive_data(&mut self) -> anyhow::Result<String> {
        let max = self.config.max_message_bytes;
        let mut payload = Vec::new();
        let mut oversized = false;
        let mut at_line_start = true;
        let mut chunk = Vec::new();

        loop {
            chunk.clear();
            let n = tokio::time::timeout(
                IDLE_TIMEOUT,
                (&mut self.stream)
                    .take(max as u64 + 3)
                    .read_until(b'\n', &mut chunk),
            )
            .await??;
            if n == 0 {
                anyhow::bail!("connection closed during DATA");
            }

            let starts_line = at_line_start;
            at_line_start = chunk.ends_with(b"\n");
            if starts_line && (chunk == b".\r\n" || chunk == b".\n") {
                break;
            }
            if oversized {
                continue;
            }

            let data = if starts_line && chunk.starts_with(b"..") {
                &chunk[1..]
            } else {
                &chunk[..]
            };
            if payload.len() + data.len() > max {
                oversized = true;
                payload = Vec::new();
                continue;
            }
            payload.extend_from_slice(data);
        }

        if oversized {
            tracing::warn!(peer = ?self.peer, max, "Message exceeds size limit");
            return Ok("552 Message size exceeds fixed maximum message size".to_string());
        }

        tracing::info!(
            peer = ?self.peer,
            sender = ?self.sender,
            envelope_recipients = self.envelope_recipients.len(),
            bytes = payload.len(),
            "Received email data"
        );
        let result = self
            .handler
            .handle(InboundTransaction {
                peer_address: self.peer.clone(),
                raw_payload: payload,
            })
            .await;
        Ok(result.to_string())
    }

    fn reset_envelope(&mut self, state: State) {
        self.state = state;
        self.sender = None;
        self.envelope_recipients.clear();
    }

    async fn reply(&mut self, line: &str) -> std::io::Result<()> {
        let stream = self.stream.get_mut();
        stream.write_all(line.as_bytes()).await?;
        stream.write_all(b"\r\n").await?;
        stream.flush().await
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    use super::*;
    use crate::delivery::{DeliveryConfig, Notification, NotificationProvider, NotificationReceipt};
    use crate::error::ProviderError;
    use crate::policy::PolicyConfig;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingProvider {
        sent: Mutex<Vec<Notification>>,
    }

    #[async_trait::async_trait]
    impl NotificationProvider for RecordingProvider {
        fn name(&self) -> &str {
            "recording"
        }

        async fn send_notification(
            &self,
            notification: &Notification,
        ) -> Result<NotificationReceipt, ProviderError> {
            self.sent.lock().unwrap().push(notification.clone());
            Ok(NotificationReceipt { id: "n-1".into() })
        }
    }

    struct Client {
        reader: BufReader<tokio::io::ReadHalf<DuplexStream>>,
        writer: tokio::io::WriteHalf<DuplexStream>,
    }

    impl Client {
        async fn line(&mut self) -> String {
            let mut line = String::new();
            self.reader.read_line(&mut line).await.unwrap();
            line.trim_end().to_string()
        }

        async fn send(&mut self, data: &str) {
            self.writer.write_all(data.as_bytes()).await.unwrap();
        }

        async fn command(&mut self, cmd: &str) -> String {
            self.send(&format!("{cmd}\r\n")).await;
            self.line().await
        }
    }

    fn start(
        peer: Option<&str>,
        max_message_bytes: usize,
    ) -> (Client, Arc<RecordingProvider>, tokio::task::JoinHandle<anyhow::Result<()>>) {
        let provider = Arc::new(RecordingProvider::default());
        let handler = Arc::new(TransactionHandler::with_provider(
            PolicyConfig::default(),
            Arc::new(|html: &str| html.to_string()),
            provider.clone(),
            None,
            DeliveryConfig::default(),
        ));
        let config = Arc::new(ListenerConfig {
            max_message_bytes,
            ..Default::default()
        });
        let (client_side, server_side) = tokio::io::duplex(64 * 1024);
        let session = Session::new(server_side, peer.map(str::to_string), handler, config);
        let task = tokio::spawn(session.run());
        let (read, write) = tokio::io::split(client_side);
        (
            Client {
                reader: BufReader::new(read),
                writer: write,
            },
            provider,
            task,
        )
    }

    const MESSAGE: &str = "From: app@internal\r\nTo: ops@x.com\r\nSubject: Disk\r\n\r\n..dotted line\r\nbody\r\n.\r\n";

    // ── Command parsing ─────────────────────────────────────────────

    #[test]
    fn parse_commands() {
        assert_eq!(Command::parse("ehlo client\r\n"), Command::Ehlo);
        assert_eq!(
            Command::parse("MAIL FROM:<a@x.com> BODY=8BITMIME\r\n"),
            Command::Mail("a@x.com".into())
        );
        assert_eq!(
            Command::parse("rcpt to: <b@x.com>\r\n"),
            Command::Rcpt("b@x.com".into())
        );
        assert_eq!(Command::parse("MAIL FROM:<>\r\n"), Command::Mail(String::new()));
        assert_eq!(Command::parse("\r\n"), Command::Empty);
        assert_eq!(Command::parse("VRFY x\r\n"), Command::Unknown);
    }

    // ── Conversations ───────────────────────────────────────────────

    #[tokio::test]
    async fn full_transaction_is_relayed() {
        let (mut client, provider, task) = start(Some("127.0.0.1"), 1024 * 1024);

        assert!(client.line().await.starts_with("220 "));
        client.send("EHLO test\r\n").await;
        assert_eq!(client.line().await, "250-notify-relay");
        assert_eq!(client.line().await, "250-8BITMIME");
        assert!(client.line().await.starts_with("250 SIZE"));
        assert_eq!(client.command("MAIL FROM:<app@internal>").await, "250 OK");
        assert_eq!(client.command("RCPT TO:<ops@x.com>").await, "250 OK");
        assert!(client.command("DATA").await.starts_with("354"));
        client.send(MESSAGE).await;
        assert_eq!(client.line().await, "250 Message accepted");
        assert_eq!(client.command("QUIT").await, "221 Bye");
        task.await.unwrap().unwrap();

        let sent = provider.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].recipient, "ops@x.com");
        assert_eq!(sent[0].subject, "Disk");
        assert!(sent[0].body.starts_with(".dotted line"));
    }

    #[tokio::test]
    async fn untrusted_peer_gets_550_after_data() {
        let (mut client, provider, _task) = start(Some("203.0.113.7"), 1024 * 1024);

        client.line().await;
        assert_eq!(client.command("HELO test").await, "250 notify-relay");
        client.command("MAIL FROM:<a@b>").await;
        client.command("RCPT TO:<ops@x.com>").await;
        client.command("DATA").await;
        client.send(MESSAGE).await;
        assert_eq!(client.line().await, "550 Source IP unacceptable");
        assert!(provider.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn out_of_order_commands_are_refused() {
        let (mut client, _provider, _task) = start(Some("127.0.0.1"), 1024);

        client.line().await;
        assert_eq!(client.command("MAIL FROM:<a@b>").await, "503 Bad sequence of commands");
        client.command("HELO test").await;
        assert_eq!(client.command("DATA").await, "503 Bad sequence of commands");
        assert_eq!(client.command("RCPT TO:<x@y>").await, "503 Bad sequence of commands");
        assert_eq!(client.command("NOOP").await, "250 OK");
        assert_eq!(client.command("STARTTLS").await, "502 Command not implemented");
    }

    #[tokio::test]
    async fn rset_clears_envelope() {
        let (mut client, _provider, _task) = start(Some("127.0.0.1"), 1024);

        client.line().await;
        client.command("HELO test").await;
        client.command("MAIL FROM:<a@b>").await;
        client.command("RCPT TO:<x@y>").await;
        assert_eq!(client.command("RSET").await, "250 OK");
        assert_eq!(client.command("DATA").await, "503 Bad sequence of commands");
        assert_eq!(client.command("MAIL FROM:<a@b>").await, "250 OK");
    }

    #[tokio::test]
    async fn oversized_message_is_refused() {
        let (mut client, provider, _task) = start(Some("127.0.0.1"), 64);

        client.line().await;
        client.command("HELO test").await;
        client.command("MAIL FROM:<a@b>").await;
        client.command("RCPT TO:<ops@x.com>").await;
        client.command("DATA").await;
        client.send(&format!("To: ops@x.com\r\nSubject: s\r\n\r\n{}\r\n.\r\n", "x".repeat(200)))
            .await;
        assert!(client.line().await.starts_with("552 "));
        assert!(provider.sent.lock().unwrap().is_empty());
        // Session is still usable.
        assert_eq!(client.command("NOOP").await, "250 OK");
    }
}
