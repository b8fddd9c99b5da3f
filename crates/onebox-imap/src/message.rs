//! Fetched message types

use mail_parser::{Address, HeaderValue, MessageParser, MimeHeaders};
use serde::{Deserialize, Serialize};

/// Maximum snippet length in characters
const SNIPPET_LENGTH: usize = 200;

/// Email address with optional display name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailAddress {
    /// Display name (e.g., "John Doe")
    pub name: Option<String>,
    /// Email address (e.g., "john@example.com")
    pub address: String,
}

impl EmailAddress {
    pub fn new(name: Option<String>, address: String) -> Self {
        Self { name, address }
    }

    /// Format as "Name <address>" or just "address"
    pub fn to_display_string(&self) -> String {
        match &self.name {
            Some(name) if !name.is_empty() => format!("{} <{}>", name, self.address),
            _ => self.address.clone(),
        }
    }
}

impl std::fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_display_string())
    }
}

/// Attachment metadata (content is not retained)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub size: usize,
}

/// A message as retrieved from the server, parsed but not yet stored
#[derive(Debug, Clone, Default)]
pub struct FetchedMessage {
    /// Server-assigned UID, unique within the folder
    pub uid: u32,
    pub message_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    pub subject: Option<String>,
    pub from: Vec<EmailAddress>,
    pub to: Vec<EmailAddress>,
    pub cc: Vec<EmailAddress>,
    /// Date header as unix seconds
    pub date: Option<i64>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub attachments: Vec<Attachment>,
    /// Header fields in wire order, continuation lines unfolded
    pub raw_headers: Vec<(String, String)>,
}

impl FetchedMessage {
    /// Parse an RFC 5322 message
    ///
    /// Never fails: a message mail-parser cannot make sense of still yields a
    /// record carrying its UID and raw headers, so the sync engine can store it
    /// and move on.
    pub fn parse(uid: u32, raw: &[u8]) -> Self {
        let raw_headers = parse_header_block(raw);

        let Some(message) = MessageParser::default().parse(raw) else {
            return Self {
                uid,
                raw_headers,
                ..Self::default()
            };
        };

        let references = match message.references() {
            HeaderValue::Text(id) => vec![id.to_string()],
            HeaderValue::TextList(ids) => ids.iter().map(|id| id.to_string()).collect(),
            _ => Vec::new(),
        };

        let in_reply_to = match message.in_reply_to() {
            HeaderValue::Text(id) => Some(id.to_string()),
            HeaderValue::TextList(ids) => ids.first().map(|id| id.to_string()),
            _ => None,
        };

        let attachments = message
            .attachments()
            .map(|part| Attachment {
                filename: part.attachment_name().unwrap_or("unnamed").to_string(),
                content_type: part
                    .content_type()
                    .map(|ct| match ct.subtype() {
                        Some(sub) => format!("{}/{}", ct.ctype(), sub),
                        None => ct.ctype().to_string(),
                    })
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
                size: part.len(),
            })
            .collect();

        Self {
            uid,
            message_id: message.message_id().map(str::to_string),
            in_reply_to,
            references,
            subject: message.subject().map(str::to_string),
            from: addresses(message.from()),
            to: addresses(message.to()),
            cc: addresses(message.cc()),
            date: message.date().map(|d| d.to_timestamp()),
            body_text: message.body_text(0).map(|b| b.into_owned()),
            body_html: message.body_html(0).map(|b| b.into_owned()),
            attachments,
            raw_headers,
        }
    }

    /// Conversation identifier: the thread root if known, else the message itself
    pub fn thread_id(&self) -> Option<String> {
        self.references
            .first()
            .cloned()
            .or_else(|| self.in_reply_to.clone())
            .or_else(|| self.message_id.clone())
    }

    /// First characters of the plain-text body with whitespace collapsed
    pub fn snippet(&self) -> Option<String> {
        let text = self.body_text.as_deref()?;
        let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.is_empty() {
            return None;
        }
        Some(collapsed.chars().take(SNIPPET_LENGTH).collect())
    }
}

/// Render an address list the way it is stored: comma separated
pub fn join_addresses(addresses: &[EmailAddress]) -> String {
    addresses
        .iter()
        .map(EmailAddress::to_display_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn addresses(address: Option<&Address<'_>>) -> Vec<EmailAddress> {
    let Some(address) = address else {
        return Vec::new();
    };

    let convert = |addr: &mail_parser::Addr<'_>| {
        addr.address.as_ref().map(|a| {
            EmailAddress::new(
                addr.name.as_ref().map(|n| n.to_string()),
                a.to_string(),
            )
        })
    };

    match address {
        Address::List(list) => list.iter().filter_map(convert).collect(),
        Address::Group(groups) => groups
            .iter()
            .flat_map(|g| g.addresses.iter())
            .filter_map(convert)
            .collect(),
    }
}

/// Split the header section off a raw message and unfold it
fn parse_header_block(raw: &[u8]) -> Vec<(String, String)> {
    let text = String::from_utf8_lossy(raw);
    let end = text
        .find("\r\n\r\n")
        .or_else(|| text.find("\n\n"))
        .unwrap_or(text.len());

    let mut headers: Vec<(String, String)> = Vec::new();
    for line in text[..end].lines() {
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some((_, value)) = headers.last_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAW: &[u8] = b"Message-ID: <reply-2@example.com>\r\n\
From: Ada Lovelace <ada@example.com>\r\n\
To: bob@example.com, Carol <carol@example.com>\r\n\
Subject: Re: Engine\r\n\
\x20notes\r\n\
In-Reply-To: <root-1@example.com>\r\n\
References: <root-1@example.com> <reply-1@example.com>\r\n\
Date: Tue, 1 Jul 2025 10:00:00 +0000\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
Sounds   good,\r\nlet's   meet on Thursday.\r\n";

    #[test]
    fn test_parse_envelope_and_body() {
        let msg = FetchedMessage::parse(42, RAW);
        assert_eq!(msg.uid, 42);
        assert_eq!(msg.message_id.as_deref(), Some("reply-2@example.com"));
        assert_eq!(msg.from.len(), 1);
        assert_eq!(msg.from[0].address, "ada@example.com");
        assert_eq!(join_addresses(&msg.from), "Ada Lovelace <ada@example.com>");
        assert_eq!(msg.to.len(), 2);
        assert_eq!(msg.date, Some(1_751_364_000));
        assert!(msg.body_text.as_deref().unwrap().contains("Thursday"));
    }

    #[test]
    fn test_thread_id_prefers_root_reference() {
        let msg = FetchedMessage::parse(1, RAW);
        assert_eq!(msg.thread_id().as_deref(), Some("root-1@example.com"));

        let lone = FetchedMessage {
            message_id: Some("solo@example.com".into()),
            ..FetchedMessage::default()
        };
        assert_eq!(lone.thread_id().as_deref(), Some("solo@example.com"));
    }

    #[test]
    fn test_snippet_collapses_whitespace() {
        let msg = FetchedMessage::parse(1, RAW);
        assert_eq!(
            msg.snippet().as_deref(),
            Some("Sounds good, let's meet on Thursday.")
        );
    }

    #[test]
    fn test_raw_headers_are_unfolded() {
        let msg = FetchedMessage::parse(1, RAW);
        let subject = msg
            .raw_headers
            .iter()
            .find(|(name, _)| name == "Subject")
            .map(|(_, value)| value.as_str());
        assert_eq!(subject, Some("Re: Engine notes"));
    }

    #[test]
    fn test_unparseable_message_keeps_uid() {
        let msg = FetchedMessage::parse(7, b"");
        assert_eq!(msg.uid, 7);
        assert!(msg.subject.is_none());
        assert!(msg.snippet().is_none());
    }
}
