// https://www.rfc-editor.org/rfc/rfc3501 - IMAP4rev1
// https://www.rfc-editor.org/rfc/rfc2177 - IDLE
// https://www.rfc-editor.org/rfc/rfc4315 - UIDPLUS
// https://www.rfc-editor.org/rfc/rfc5161 - ENABLE
// https://www.rfc-editor.org/rfc/rfc7162 - CONDSTORE/QRESYNC
// https://www.rfc-editor.org/rfc/rfc7888 - LITERAL+

use base64::Engine as _;
use std::{borrow, collections, fmt};

pub mod auth;
pub mod command;
pub mod parser;
pub mod state;
pub mod sync;

// Inclusive UID or MSN range.
#[derive(Clone, Debug, PartialEq)]
pub struct Range(pub u32, pub u32);

impl Range {
  pub fn contains(&self, value: u32) -> bool {
    self.0 <= value && value <= self.1
  }
}

// `a,b:c,d` - the wire form of a set of ranges.
pub fn format_sequence_set(ranges: &[Range]) -> String {
  let mut output = String::new();
  for (i, range) in ranges.iter().enumerate() {
    if i > 0 {
      output.push(',');
    }
    if range.0 == range.1 {
      output += &range.0.to_string();
    } else {
      output += &format!("{}:{}", range.0, range.1);
    }
  }
  output
}

#[derive(Debug, PartialEq)]
pub enum MailboxName<'input> {
  Inbox,
  Other(borrow::Cow<'input, [u8]>),
}

impl<'input> MailboxName<'input> {
  pub fn into_bytes(self) -> Vec<u8> {
    match self {
      MailboxName::Inbox => b"INBOX".to_vec(),
      MailboxName::Other(borrow::Cow::Owned(mailbox)) => mailbox,
      MailboxName::Other(borrow::Cow::Borrowed(mailbox)) => mailbox.to_vec(),
    }
  }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum State {
  Ok,
  No,
  Bad,
}

impl fmt::Display for State {
  fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
    match self {
      State::Ok => write!(formatter, "OK"),
      State::No => write!(formatter, "NO"),
      State::Bad => write!(formatter, "BAD"),
    }
  }
}

// https://www.rfc-editor.org/rfc/rfc3501#section-7.1
// resp-text-code, plus the UIDPLUS and CONDSTORE/QRESYNC additions.
#[derive(Debug, PartialEq)]
pub enum RespCode<'input> {
  Alert,
  Capability(Vec<&'input [u8]>),
  UidValidity(u32),
  UidNext(u32),
  HighestModSeq(u64),
  NoModSeq,
  TryCreate,
  Closed,
  ReadOnly,
  ReadWrite,
  PermanentFlags(Vec<&'input [u8]>),
  AppendUid {
    uidvalidity: u32,
    uid: u32,
  },
  CopyUid {
    uidvalidity: u32,
    from: Vec<Range>,
    to: Vec<Range>,
  },
  Modified(Vec<Range>),
  Other(&'input [u8]),
}

#[derive(Debug, PartialEq)]
pub struct Cond<'input> {
  pub state: State,
  pub code: Option<RespCode<'input>>,
  pub text: &'input [u8],
}

#[derive(Debug, PartialEq)]
pub enum StatusItem {
  Messages(u32),
  Recent(u32),
  UidNext(u32),
  UidValidity(u32),
  Unseen(u32),
  HighestModSeq(u64),
}

#[derive(Debug, PartialEq)]
pub enum Untagged<'input> {
  Exists(u32),
  Recent(u32),
  Expunge(u32),
  Vanished {
    earlier: bool,
    uids: Vec<Range>,
  },
  // FETCH is absent on purpose: the engine recognises it with the fetch_start rule and tokenises
  // the attribute stream itself so body literals can stream to a sink.
  Flags(Vec<&'input [u8]>),
  Capability(Vec<&'input [u8]>),
  Enabled(Vec<&'input [u8]>),
  List {
    flags: Vec<&'input [u8]>,
    delimiter: Option<u8>,
    mailbox: MailboxName<'input>,
  },
  Lsub {
    flags: Vec<&'input [u8]>,
    delimiter: Option<u8>,
    mailbox: MailboxName<'input>,
  },
  Status {
    mailbox: MailboxName<'input>,
    items: Vec<StatusItem>,
  },
  Bye(&'input [u8]),
  Cond(Cond<'input>),
}

// One `ATOM value` out of a FETCH attribute stream.
#[derive(Debug, PartialEq)]
pub enum FetchAttr<'input> {
  Uid(u32),
  Flags(Vec<&'input [u8]>),
  InternalDate(Vec<u8>),
  Rfc822Size(u64),
  ModSeq(u64),
  // BODY[...] or RFC822.HEADER followed by a literal: the engine drains `length` octets into the
  // caller's sink before asking for the next token.
  BodyLiteral {
    length: u32,
  },
  BodyInline(Option<borrow::Cow<'input, [u8]>>),
  Ignored,
}

#[derive(Clone, Debug, Default)]
pub struct Capabilities(collections::HashSet<String>);

impl Capabilities {
  pub fn update<'input>(&mut self, capabilities: &[&'input [u8]]) {
    self.0.clear();
    for capability in capabilities {
      self
        .0
        .insert(String::from_utf8_lossy(capability).to_ascii_uppercase());
    }
  }

  pub fn has(&self, capability: &str) -> bool {
    self.0.contains(&capability.to_ascii_uppercase())
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }
}

// https://www.rfc-editor.org/rfc/rfc2595#section-6
// PLAIN: authorization, authentication and password NUL-separated, base64'd. Non-US-ASCII
// characters are permitted as long as they are represented in UTF-8.
pub fn plain(user: &str, password: &str) -> String {
  let engine = base64::engine::GeneralPurpose::new(
    &base64::alphabet::STANDARD,
    base64::engine::general_purpose::PAD,
  );
  engine.encode(format!("\0{user}\0{password}"))
}

fn mutf7_engine() -> base64::engine::GeneralPurpose {
  base64::engine::GeneralPurpose::new(
    &base64::alphabet::IMAP_MUTF7,
    base64::engine::general_purpose::NO_PAD,
  )
}

// https://www.rfc-editor.org/rfc/rfc3501#section-5.1.3
// "&" is used to shift to modified BASE64 and "-" to shift back to US-ASCII.
pub fn utf7_to_utf8(input: &[u8]) -> Option<String> {
  let engine = mutf7_engine();
  let mut buffer = Vec::new();
  let mut output = String::new();
  let mut i = 0;
  while i < input.len() {
    match input[i] {
      b'&' => {
        let start = i;
        loop {
          i += 1;
          if i == input.len() {
            return None;
          }
          if input[i] == b'-' {
            break;
          }
        }
        if start + 1 == i {
          // The character "&" (0x26) is represented by the two-octet sequence "&-".
          output.push('&');
        } else {
          // https://www.rfc-editor.org/rfc/rfc2152
          // Unicode is encoded using Modified Base64 by first converting Unicode 16-bit quantities
          // to an octet stream (with the most significant octet first).
          buffer.truncate(0);
          buffer
            .try_reserve(base64::decoded_len_estimate(i - (start + 1)))
            .ok()?;
          engine.decode_vec(&input[start + 1..i], &mut buffer).ok()?;

          let mut decoder = encoding_rs::UTF_16BE.new_decoder_without_bom_handling();
          output
            .try_reserve(decoder.max_utf8_buffer_length_without_replacement(buffer.len())?)
            .ok()?;
          let (result, _) = decoder.decode_to_string_without_replacement(
            &buffer,
            &mut output,
            true, // last
          );
          match result {
            encoding_rs::DecoderResult::InputEmpty => (),
            _ => return None,
          }
        }
      }
      // In modified UTF-7, printable US-ASCII characters, except for "&", represent themselves;
      // that is, characters with octet values 0x20-0x25 and 0x27-0x7e.
      c @ 0x20..=0x25 | c @ 0x27..=0x7e => output.push(c as char),
      _ => return None,
    }
    i += 1;
  }
  Some(output)
}

// The munging direction: mailbox names go on the wire in modified UTF-7 unless the server
// advertised UTF8=ACCEPT.
pub fn utf8_to_utf7(input: &str) -> Vec<u8> {
  let engine = mutf7_engine();
  let mut output = Vec::new();
  let mut shifted: Vec<u8> = Vec::new();
  let flush = |shifted: &mut Vec<u8>, output: &mut Vec<u8>| {
    if !shifted.is_empty() {
      output.push(b'&');
      output.extend_from_slice(engine.encode(&shifted).as_bytes());
      output.push(b'-');
      shifted.clear();
    }
  };
  for c in input.chars() {
    match c {
      '&' => {
        flush(&mut shifted, &mut output);
        output.extend_from_slice(b"&-");
      }
      '\x20'..='\x25' | '\x27'..='\x7e' => {
        flush(&mut shifted, &mut output);
        output.push(c as u8);
      }
      c => {
        let mut units = [0u16; 2];
        for unit in c.encode_utf16(&mut units) {
          shifted.extend_from_slice(&unit.to_be_bytes());
        }
      }
    }
  }
  flush(&mut shifted, &mut output);
  output
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  #[test]
  fn utf7_to_ut8() {
    // https://www.rfc-editor.org/rfc/rfc3501#section-5.1.3
    assert_eq!("", utf7_to_utf8(b"").unwrap());
    assert_eq!("&", utf7_to_utf8(b"&-").unwrap());
    // [...] a mailbox name which mixes English, Chinese, and Japanese text:
    assert_eq!(
      "~peter/mail/台北/日本語",
      utf7_to_utf8(b"~peter/mail/&U,BTFw-/&ZeVnLIqe-").unwrap()
    );
    // [...] the string "&Jjo!" is not a valid mailbox name because it does not contain a shift to
    // US-ASCII before the "!".
    assert_eq!(None, utf7_to_utf8(b"&Jjo!"));
    // The correct form is "&Jjo-!".
    assert_eq!("☺!", utf7_to_utf8(b"&Jjo-!").unwrap());
  }

  #[test]
  fn utf8_to_utf7_roundtrip() {
    for mailbox in ["INBOX", "&", "~peter/mail/台北/日本語", "☺!", "mixed 台 text"] {
      let munged = utf8_to_utf7(mailbox);
      assert_eq!(mailbox, utf7_to_utf8(&munged).unwrap(), "{munged:?}");
    }
    assert_eq!(b"&-".to_vec(), utf8_to_utf7("&"));
    assert_eq!(b"&U,BTFw-".to_vec(), utf8_to_utf7("台北"));
  }

  #[test]
  fn sequence_sets() {
    assert_eq!("1", format_sequence_set(&[Range(1, 1)]));
    assert_eq!(
      "1:3,5,7:9",
      format_sequence_set(&[Range(1, 3), Range(5, 5), Range(7, 9)])
    );
  }
}
