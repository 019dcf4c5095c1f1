//! Mailbox fixture over POP3
//!
//! Test inboxes use the address as both user name and password. An inbox that
//! rejects the login has never received mail and reads as empty.

use std::time::Duration;

use async_trait::async_trait;
use mailparse::{addrparse_header, DispositionType, MailAddr, MailHeaderMap, ParsedMail};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::config::MailboxConfig;
use crate::error::{AccordError, AccordResult};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailMessage {
    pub subject: Option<String>,
    pub from: Vec<String>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub text_content: Option<String>,
    pub html_content: Option<String>,
    pub inline_contents: Vec<InlineContent>,
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineContent {
    pub content_id: String,
    pub content_type: String,
    pub filename: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub filename: Option<String>,
    pub content_type: String,
}

/// Parses a raw RFC 822 message
pub fn parse_message(raw: &[u8]) -> AccordResult<EmailMessage> {
    let mail = mailparse::parse_mail(raw)?;
    let mut message = EmailMessage {
        subject: mail.headers.get_first_value("Subject"),
        from: addresses(&mail, "From")?,
        to: addresses(&mail, "To")?,
        cc: addresses(&mail, "Cc")?,
        bcc: addresses(&mail, "Bcc")?,
        ..Default::default()
    };
    walk_parts(&mail, &mut message)?;
    Ok(message)
}

fn addresses(mail: &ParsedMail, name: &str) -> AccordResult<Vec<String>> {
    let Some(header) = mail.headers.get_first_header(name) else {
        return Ok(Vec::new());
    };
    let mut out = Vec::new();
    for addr in addrparse_header(header)?.iter() {
        match addr {
            MailAddr::Single(single) => out.push(single.addr.clone()),
            MailAddr::Group(group) => out.extend(group.addrs.iter().map(|a| a.addr.clone())),
        }
    }
    Ok(out)
}

fn append(slot: &mut Option<String>, body: String) {
    match slot {
        Some(existing) => existing.push_str(&body),
        None => *slot = Some(body),
    }
}

fn walk_parts(part: &ParsedMail, message: &mut EmailMessage) -> AccordResult<()> {
    if !part.subparts.is_empty() {
        for sub in &part.subparts {
            walk_parts(sub, message)?;
        }
        return Ok(());
    }

    let mimetype = part.ctype.mimetype.to_ascii_lowercase();
    let has_disposition = part
        .headers
        .get_first_value("Content-Disposition")
        .is_some();
    let disposition = part.get_content_disposition();
    let filename = disposition
        .params
        .get("filename")
        .or_else(|| part.ctype.params.get("name"))
        .cloned();

    if !has_disposition || matches!(disposition.disposition, DispositionType::Inline) {
        let content_id = part
            .headers
            .get_first_value("Content-ID")
            .map(|id| id.trim().trim_start_matches('<').trim_end_matches('>').to_string());
        match content_id {
            Some(content_id) if has_disposition => message.inline_contents.push(InlineContent {
                content_id,
                content_type: mimetype,
                filename,
            }),
            _ if mimetype == "text/plain" => append(&mut message.text_content, part.get_body()?),
            _ if mimetype == "text/html" => append(&mut message.html_content, part.get_body()?),
            Some(content_id) => message.inline_contents.push(InlineContent {
                content_id,
                content_type: mimetype,
                filename,
            }),
            None => debug!("Skipping {} part without disposition", mimetype),
        }
        return Ok(());
    }

    message.attachments.push(Attachment {
        filename,
        content_type: mimetype,
    });
    Ok(())
}

/// Attribute value, or whitespace-collapsed text, of the first element
/// matching `selector`
pub fn html_element(html: &str, selector: &str, attribute: Option<&str>) -> AccordResult<String> {
    let parsed = Selector::parse(selector).map_err(|e| {
        AccordError::InvalidConfig(format!("Invalid selector {}: {:?}", selector, e))
    })?;
    let document = Html::parse_document(html);
    let element = document
        .select(&parsed)
        .next()
        .ok_or_else(|| AccordError::assertion(format!("No element matches {}", selector)))?;

    match attribute {
        Some(name) => element
            .value()
            .attr(name)
            .map(str::to_string)
            .ok_or_else(|| {
                AccordError::assertion(format!("Element {} has no attribute {}", selector, name))
            }),
        None => Ok(element
            .text()
            .flat_map(str::split_whitespace)
            .collect::<Vec<_>>()
            .join(" ")),
    }
}

#[async_trait]
pub trait Mailbox: Send + Sync {
    /// Deletes every message in the inbox
    async fn clear(&self, address: &str) -> AccordResult<()>;

    async fn messages(&self, address: &str) -> AccordResult<Vec<EmailMessage>>;

    async fn first_message(&self, address: &str) -> AccordResult<Option<EmailMessage>> {
        Ok(self.messages(address).await?.into_iter().next())
    }

    async fn html_element_at(
        &self,
        address: &str,
        selector: &str,
        attribute: Option<&str>,
    ) -> AccordResult<String> {
        let message = self
            .first_message(address)
            .await?
            .ok_or_else(|| AccordError::assertion(format!("No message for {}", address)))?;
        let html = message
            .html_content
            .ok_or_else(|| AccordError::assertion(format!("First message for {} has no HTML", address)))?;
        html_element(&html, selector, attribute)
    }
}

/// POP3 inbox client
pub struct Pop3Mailbox {
    host: String,
    port: u16,
    timeout: Duration,
}

impl Pop3Mailbox {
    pub fn new(config: &MailboxConfig) -> Self {
        info!("Mailbox server {}:{}", config.host, config.port);
        Self {
            host: config.host.clone(),
            port: config.port,
            timeout: config.timeout(),
        }
    }

    /// Logged-in session, or `None` when the inbox rejects the credentials
    async fn open(&self, address: &str) -> AccordResult<Option<Pop3Session>> {
        let mut session = Pop3Session::connect(&self.host, self.port, self.timeout).await?;
        if session.login(address, address).await? {
            Ok(Some(session))
        } else {
            debug!("Mailbox {} rejected login, treating as empty", address);
            let _ = session.quit().await;
            Ok(None)
        }
    }
}

#[async_trait]
impl Mailbox for Pop3Mailbox {
    async fn clear(&self, address: &str) -> AccordResult<()> {
        let Some(mut session) = self.open(address).await? else {
            return Ok(());
        };
        let count = session.stat().await?;
        for n in 1..=count {
            session.delete(n).await?;
        }
        session.quit().await?;
        info!("Cleared {} message(s) from {}", count, address);
        Ok(())
    }

    async fn messages(&self, address: &str) -> AccordResult<Vec<EmailMessage>> {
        let Some(mut session) = self.open(address).await? else {
            return Ok(Vec::new());
        };
        let count = session.stat().await?;
        let mut messages = Vec::with_capacity(count);
        for n in 1..=count {
            let raw = session.retrieve(n).await?;
            messages.push(parse_message(&raw)?);
        }
        session.quit().await?;
        Ok(messages)
    }
}

struct Pop3Session {
    stream: BufReader<TcpStream>,
    timeout: Duration,
}

impl Pop3Session {
    async fn connect(host: &str, port: u16, limit: Duration) -> AccordResult<Self> {
        let stream = timeout(limit, TcpStream::connect((host, port)))
            .await
            .map_err(|_| AccordError::Mailbox(format!("Connecting to {}:{} timed out", host, port)))??;
        let mut session = Self {
            stream: BufReader::new(stream),
            timeout: limit,
        };
        let greeting = session.read_line().await?;
        if !greeting.starts_with("+OK") {
            return Err(AccordError::Mailbox(format!("Unexpected greeting: {}", greeting)));
        }
        Ok(session)
    }

    async fn read_raw_line(&mut self) -> AccordResult<Vec<u8>> {
        let mut line = Vec::new();
        let read = timeout(self.timeout, self.stream.read_until(b'\n', &mut line))
            .await
            .map_err(|_| AccordError::Mailbox("Read timed out".to_string()))??;
        if read == 0 {
            return Err(AccordError::Mailbox("Connection closed".to_string()));
        }
        while matches!(line.last(), Some(b'\r' | b'\n')) {
            line.pop();
        }
        Ok(line)
    }

    /// Status line; message bodies go through `retrieve` untouched
    async fn read_line(&mut self) -> AccordResult<String> {
        let line = self.read_raw_line().await?;
        Ok(String::from_utf8_lossy(&line).into_owned())
    }

    /// Sends a command; `Ok(Err(..))` carries a `-ERR` reply
    async fn command(&mut self, command: &str) -> AccordResult<Result<String, String>> {
        self.stream
            .get_mut()
            .write_all(format!("{}\r\n", command).as_bytes())
            .await?;
        let reply = self.read_line().await?;
        if let Some(rest) = reply.strip_prefix("+OK") {
            Ok(Ok(rest.trim().to_string()))
        } else {
            Ok(Err(reply))
        }
    }

    async fn expect_ok(&mut self, command: &str) -> AccordResult<String> {
        let verb = command.split(' ').next().unwrap_or(command);
        self.command(command)
            .await?
            .map_err(|reply| AccordError::Mailbox(format!("{} failed: {}", verb, reply)))
    }

    async fn login(&mut self, user: &str, password: &str) -> AccordResult<bool> {
        if self.command(&format!("USER {}", user)).await?.is_err() {
            return Ok(false);
        }
        Ok(self.command(&format!("PASS {}", password)).await?.is_ok())
    }

    async fn stat(&mut self) -> AccordResult<usize> {
        let reply = self.expect_ok("STAT").await?;
        reply
            .split_whitespace()
            .next()
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| AccordError::Mailbox(format!("Malformed STAT reply: {}", reply)))
    }

    async fn retrieve(&mut self, n: usize) -> AccordResult<Vec<u8>> {
        self.expect_ok(&format!("RETR {}", n)).await?;
        let mut raw = Vec::new();
        loop {
            let line = self.read_raw_line().await?;
            if line == b"." {
                break;
            }
            let line = line.strip_prefix(b".").unwrap_or(&line[..]);
            raw.extend_from_slice(line);
            raw.extend_from_slice(b"\r\n");
        }
        Ok(raw)
    }

    async fn delete(&mut self, n: usize) -> AccordResult<()> {
        self.expect_ok(&format!("DELE {}", n)).await.map(|_| ())
    }

    /// Ends the session, committing deletions
    async fn quit(&mut self) -> AccordResult<()> {
        self.expect_ok("QUIT").await.map(|_| ())
    }
}
