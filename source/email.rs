// Envelope-level message model. Bodies stay on disk (body cache) or on the server; only the
// header skeleton and per-session flags live in memory and in the header cache.

use crate::{date, imap::state, rfc2047};
use anyhow::Context as _;
use mailparse::MailHeaderMap as _;
use serde::{Deserialize, Serialize};

// Flag state as last reconciled with the server, plus the local-only `old`.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Flags {
  pub read: bool,
  pub old: bool,
  pub deleted: bool,
  pub flagged: bool,
  pub replied: bool,
  pub recent: bool,
  pub draft: bool,
}

// Offsets of the body within the stored message file.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Body {
  pub length: u64,
  pub offset: u64,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Envelope {
  pub date: Option<String>,
  pub from: Option<String>,
  pub sender: Option<String>,
  pub reply_to: Option<String>,
  pub to: Option<String>,
  pub cc: Option<String>,
  pub subject: Option<String>,
  pub message_id: Option<String>,
  pub references: Vec<String>,
  pub in_reply_to: Vec<String>,
  pub content_type: Option<String>,
  pub content_description: Option<String>,
  pub lines: Option<u32>,
  pub list_post: Option<String>,
  pub list_subscribe: Option<String>,
  pub list_unsubscribe: Option<String>,
  pub x_label: Option<String>,
  pub x_original_to: Option<String>,
  // Seconds since the epoch parsed out of Date, so sorting needs no reparse.
  pub sent: Option<i64>,
}

fn decode_header(raw: &[u8]) -> String {
  rfc2047::decode(raw, None)
}

fn split_ids(raw: &str) -> Vec<String> {
  raw
    .split_ascii_whitespace()
    .filter(|token| token.starts_with('<'))
    .map(str::to_string)
    .collect()
}

impl Envelope {
  // Build an envelope from a raw RFC 822 header block. Splitting is delegated to the external
  // header reader; every value still flows through the encoded-word codec and the date parser.
  pub fn from_headers(bytes: &[u8]) -> anyhow::Result<Self> {
    let (headers, _) = mailparse::parse_headers(bytes).context("couldn't parse headers")?;
    let mut envelope = Self::default();
    let get = |name: &str| -> Option<String> {
      headers
        .get_first_header(name)
        .map(|header| decode_header(header.get_value_raw()))
    };
    envelope.date = get("Date");
    envelope.from = get("From");
    envelope.sender = get("Sender");
    envelope.reply_to = get("Reply-To");
    envelope.to = get("To");
    envelope.cc = get("Cc");
    envelope.subject = get("Subject");
    envelope.message_id = get("Message-Id");
    envelope.references = get("References").map(|raw| split_ids(&raw)).unwrap_or_default();
    envelope.in_reply_to = get("In-Reply-To").map(|raw| split_ids(&raw)).unwrap_or_default();
    envelope.content_type = get("Content-Type");
    envelope.content_description = get("Content-Description");
    envelope.lines = get("Lines").and_then(|raw| raw.trim().parse().ok());
    envelope.list_post = get("List-Post");
    envelope.list_subscribe = get("List-Subscribe");
    envelope.list_unsubscribe = get("List-Unsubscribe");
    envelope.x_label = get("X-Label");
    envelope.x_original_to = get("X-Original-To");
    envelope.sent = envelope
      .date
      .as_deref()
      .and_then(date::parse_date)
      .map(|(epoch, _)| epoch);
    Ok(envelope)
  }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Email {
  // Stable position in the mailbox arena.
  pub index: usize,
  pub flags: Flags,
  // A local modification is waiting to be pushed to the server.
  pub changed: bool,
  // Still present since the last expunge reconciliation; false means logically expunged and the
  // next mailbox pass compacts it away.
  pub active: bool,
  pub body: Body,
  pub tags: Vec<String>,
  // Server INTERNALDATE.
  pub received: i64,
  pub env: Envelope,
  // Backend-owned slot.
  pub edata: Option<state::Edata>,
}

impl Email {
  pub fn new(index: usize) -> Self {
    Self {
      index,
      active: true,
      ..Self::default()
    }
  }

  pub fn edata(&self) -> anyhow::Result<&state::Edata> {
    self.edata.as_ref().context("email without IMAP data")
  }

  pub fn edata_mut(&mut self) -> anyhow::Result<&mut state::Edata> {
    self.edata.as_mut().context("email without IMAP data")
  }
}
