// https://www.rfc-editor.org/rfc/rfc2047 - MIME Part Three: Message Header Extensions
//
// encoded-word = "=?" charset "?" encoding "?" encoded-text "?="
// An encoded-word may not be more than 75 characters long and each header line containing one may
// not exceed 76 characters.

use crate::charset;
use base64::Engine as _;
use once_cell::sync::Lazy;

const MAX_WORD: usize = 75;
const MAX_LINE: usize = 76;
// Words are packed against this so a word still fits on a continuation line behind the HT.
const WORD_BUDGET: usize = MAX_LINE - 8;

// Label for input that failed conversion from its declared charset and is passed through raw.
const UNKNOWN: &str = "unknown-8bit";

fn base64_engine() -> base64::engine::GeneralPurpose {
  base64::engine::GeneralPurpose::new(
    &base64::alphabet::STANDARD,
    base64::engine::GeneralPurposeConfig::new()
      .with_decode_padding_mode(base64::engine::DecodePaddingMode::Indifferent),
  )
}

fn is_space(byte: u8) -> bool {
  byte == b' ' || byte == b'\t'
}

// https://www.rfc-editor.org/rfc/rfc2047#section-4.2
// Printable ASCII other than "=", "?", "_" may stand for itself; space becomes "_".
fn q_safe(byte: u8) -> bool {
  byte.is_ascii_graphic() && byte != b'=' && byte != b'?' && byte != b'_'
}

fn q_len(bytes: &[u8]) -> usize {
  bytes
    .iter()
    .map(|byte| if q_safe(*byte) || *byte == b' ' { 1 } else { 3 })
    .sum()
}

fn b_len(length: usize) -> usize {
  (length + 2) / 3 * 4
}

fn q_encode(bytes: &[u8]) -> String {
  let mut output = String::with_capacity(q_len(bytes));
  for byte in bytes {
    match byte {
      b' ' => output.push('_'),
      byte if q_safe(*byte) => output.push(*byte as char),
      byte => output.push_str(&format!("={byte:02X}")),
    }
  }
  output
}

// Best effort: a broken escape ends the word, everything decoded so far is kept.
fn q_decode(text: &[u8]) -> Vec<u8> {
  let mut output = Vec::with_capacity(text.len());
  let mut i = 0;
  while i < text.len() {
    match text[i] {
      b'_' => output.push(b' '),
      b'=' => {
        let hex = |byte: u8| (byte as char).to_digit(16);
        match (text.get(i + 1).and_then(|b| hex(*b)), text.get(i + 2).and_then(|b| hex(*b))) {
          (Some(high), Some(low)) => {
            output.push((high * 16 + low) as u8);
            i += 2;
          }
          _ => break,
        }
      }
      byte => output.push(byte),
    }
    i += 1;
  }
  output
}

// Best effort: on a broken octet, retry on the prefix up to the failure and keep that.
fn b_decode(text: &[u8]) -> Vec<u8> {
  let engine = base64_engine();
  let mut text = text;
  loop {
    match engine.decode(text) {
      Ok(bytes) => return bytes,
      Err(base64::DecodeError::InvalidByte(offset, _)) => {
        text = &text[..offset - offset % 4];
      }
      Err(_) => {
        if text.len() < 4 {
          return Vec::new();
        }
        text = &text[..text.len() - text.len() % 4 - 4];
      }
    }
  }
}

static WORD: Lazy<regex::bytes::Regex> = Lazy::new(|| {
  regex::bytes::Regex::new(r"=\?([^?\x00-\x20]+)\?([qQbB])\?([^?\x00-\x20]*)\?=")
    .unwrap() // The pattern is a constant.
});

// Decode every encoded word in a header value. Adjacent words sharing a charset are concatenated
// before conversion so multi-byte characters split across words survive; whitespace between two
// encoded words is dropped per the RFC. `assumed` converts raw 8-bit runs when configured.
pub fn decode(input: &[u8], assumed: Option<&str>) -> String {
  let mut output = String::new();
  let mut pending: Vec<u8> = Vec::new();
  let mut pending_charset: Option<String> = None;

  let flush = |pending: &mut Vec<u8>, pending_charset: &mut Option<String>, output: &mut String| {
    if let Some(charset) = pending_charset.take() {
      match charset::decode(pending.as_slice(), &charset)
        .or_else(|| charset::decode_lossy(pending.as_slice(), &charset))
      {
        Some(decoded) => output.push_str(&decoded),
        // Unknown charsets fall through unconverted.
        None => output.push_str(&String::from_utf8_lossy(pending)),
      }
      pending.clear();
    }
  };

  let verbatim = |bytes: &[u8], output: &mut String| {
    if !bytes.is_ascii() {
      if let Some(decoded) = assumed.and_then(|assumed| charset::decode_lossy(bytes, assumed)) {
        output.push_str(&decoded);
        return;
      }
    }
    output.push_str(&String::from_utf8_lossy(bytes));
  };

  let mut last_end = 0;
  let mut previous_was_word = false;
  for captures in WORD.captures_iter(input) {
    let whole = captures.get(0).unwrap(); // Group 0 always exists.
    let between = &input[last_end..whole.start()];
    let drop_between = previous_was_word && !between.is_empty() && between.iter().all(|b| is_space(*b));
    if !drop_between && !between.is_empty() {
      flush(&mut pending, &mut pending_charset, &mut output);
      verbatim(between, &mut output);
    }

    let charset = String::from_utf8_lossy(&captures[1]).into_owned();
    let bytes = match captures[2][0].to_ascii_uppercase() {
      b'Q' => q_decode(&captures[3]),
      _ => b_decode(&captures[3]),
    };
    if pending_charset.as_deref() != Some(charset.as_str()) {
      flush(&mut pending, &mut pending_charset, &mut output);
      pending_charset = Some(charset);
    }
    pending.extend_from_slice(&bytes);
    last_end = whole.end();
    previous_was_word = true;
  }
  // The last chunk is always flushed.
  flush(&mut pending, &mut pending_charset, &mut output);
  if last_end < input.len() {
    verbatim(&input[last_end..], &mut output);
  }
  output
}

fn needs_encoding(bytes: &[u8], i: usize, specials: &[u8]) -> bool {
  let byte = bytes[i];
  if byte >= 0x80 || byte == 0x7f || (byte < 0x20 && byte != b'\t') {
    return true;
  }
  if specials.contains(&byte) {
    return true;
  }
  // A literal "=?" after whitespace would read back as an encoded word.
  byte == b'='
    && bytes.get(i + 1) == Some(&b'?')
    && (i == 0 || is_space(bytes[i - 1]))
}

#[derive(Debug)]
struct Word {
  charset: String,
  base64: bool,
  text: String,
}

impl Word {
  fn emit(&self) -> String {
    format!(
      "=?{}?{}?{}?=",
      self.charset,
      if self.base64 { 'B' } else { 'Q' },
      self.text
    )
  }
}

fn make_word(converted: &[u8], charset: &str, force_b: bool) -> Word {
  let base64 = force_b || b_len(converted.len()) < q_len(converted);
  let text = if base64 {
    base64_engine().encode(converted)
  } else {
    q_encode(converted)
  };
  Word {
    charset: charset.to_string(),
    base64,
    text,
  }
}

// Greedily pack characters into words so each encoded word stays within 75 bytes. Every block is
// converted on its own, which keeps stateful charsets (ISO 2022 shifts) self-contained per word.
fn split_words(region: &str, charset: &str) -> Vec<Word> {
  // https://www.rfc-editor.org/rfc/rfc1468
  // ISO-2022-JP escape sequences do not survive quoted-printable readably; always base64.
  let force_b = charset.eq_ignore_ascii_case("iso-2022-jp");
  let overhead = charset.len() + 7; // =? ?X? ?=
  let mut words = Vec::new();
  let mut start = 0;
  let mut end = 0;
  let mut converted: Vec<u8> = Vec::new();
  for (offset, c) in region.char_indices() {
    let next = offset + c.len_utf8();
    let candidate = match charset::encode(&region[start..next], charset) {
      Some(candidate) => candidate,
      // The charset was validated against the whole region; a block can only fail if the caller
      // forced an unknown label, in which case raw UTF-8 goes out under that label.
      None => region[start..next].as_bytes().to_vec(),
    };
    let length = if force_b {
      b_len(candidate.len())
    } else {
      b_len(candidate.len()).min(q_len(&candidate))
    };
    if overhead + length > WORD_BUDGET && end > start {
      words.push(make_word(&converted, charset, force_b));
      start = offset;
      converted = match charset::encode(&region[start..next], charset) {
        Some(converted) => converted,
        None => region[start..next].as_bytes().to_vec(),
      };
    } else {
      converted = candidate;
    }
    end = next;
  }
  if end > start || words.is_empty() {
    words.push(make_word(&converted, charset, force_b));
  }
  words
}

fn fold(prefix: &str, words: &[Word], suffix: &str) -> String {
  let mut output = String::from(prefix);
  let mut column = charset::string_width(prefix, 0, false);
  for (i, word) in words.iter().enumerate() {
    let text = word.emit();
    if i > 0 {
      if column + 1 + text.len() > MAX_LINE {
        output.push_str("\r\n\t");
        column = 8;
      } else {
        output.push(' ');
        column += 1;
      }
    } else if column + text.len() > MAX_LINE && !output.is_empty() {
      output.push_str("\r\n\t");
      column = 8;
    }
    output.push_str(&text);
    column += text.len();
  }
  output.push_str(suffix);
  output
}

// Encode a header value already in the process charset. `charsets` is a colon-separated
// preference list; `specials` adds bytes that must not appear bare (RFC 822 address specials for
// structured fields).
pub fn encode(input: &str, charsets: &str, specials: &[u8]) -> String {
  let bytes = input.as_bytes();
  let mut first = None;
  let mut last = 0;
  for i in 0..bytes.len() {
    if needs_encoding(bytes, i, specials) {
      first.get_or_insert(i);
      last = i + 1;
    }
  }
  let Some(mut first) = first else {
    return input.to_string();
  };
  // Widen to word boundaries; they are ASCII whitespace so the str slices stay valid and no word
  // starts or ends inside a UTF-8 sequence.
  while first > 0 && !is_space(bytes[first - 1]) {
    first -= 1;
  }
  while last < bytes.len() && !is_space(bytes[last]) {
    last += 1;
  }
  let region = &input[first..last];

  // Shortest converted output wins, ties go to list order.
  let mut chosen: Option<(&str, usize)> = None;
  for candidate in charsets.split(':').map(str::trim).filter(|c| !c.is_empty()) {
    if let Some(converted) = charset::encode(region, candidate) {
      if chosen.map_or(true, |(_, length)| converted.len() < length) {
        chosen = Some((candidate, converted.len()));
      }
    }
  }
  let charset = chosen.map(|(charset, _)| charset).unwrap_or("utf-8");

  fold(&input[..first], &split_words(region, charset), &input[last..])
}

// Raw bytes whose declared charset failed conversion: pass them through labelled as 8-bit
// unknown so the receiver can at least round-trip them.
pub fn encode_bytes(input: &[u8], fromcode: &str, charsets: &str, specials: &[u8]) -> String {
  match charset::decode(input, fromcode) {
    Some(decoded) => encode(&decoded, charsets, specials),
    None => {
      let mut words = Vec::new();
      for chunk in input.chunks((WORD_BUDGET - UNKNOWN.len() - 7) / 3) {
        words.push(make_word(chunk, UNKNOWN, false));
      }
      fold("", &words, "")
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  #[test]
  fn decode_split_multibyte() {
    // U+2600 U+2601 split across two words; the gap disappears and the bytes merge.
    assert_eq!("☀☁", decode(b"=?utf-8?B?4piA?= =?utf-8?B?4piB?=", None));
  }

  #[test]
  fn decode_q_underscore() {
    assert_eq!("Hello World", decode(b"=?iso-8859-1?Q?Hello_World?=", None));
  }

  #[test]
  fn decode_preserves_plain_runs() {
    assert_eq!(
      "plain ☀ and more",
      decode(b"plain =?utf-8?B?4piA?= and more", None)
    );
    // Whitespace next to a single word survives on the unencoded side.
    assert_eq!("a ☀", decode(b"a =?utf-8?B?4piA?=", None));
  }

  #[test]
  fn decode_unknown_charset_falls_through() {
    assert_eq!("abc", decode(b"=?x-klingon?Q?abc?=", None));
  }

  #[test]
  fn decode_broken_content() {
    // Broken Q escape: keeps what was accumulated before it.
    assert_eq!("ab", decode(b"=?us-ascii?Q?ab=Zx?=", None));
    // Broken base64: the damaged tail group is dropped.
    assert_eq!("☀", decode(b"=?utf-8?B?4piA!!!!?=", None));
  }

  #[test]
  fn decode_assumed_charset() {
    assert_eq!("café", decode(b"caf\xe9", Some("iso-8859-1")));
    assert_eq!("caf\u{fffd}", decode(b"caf\xe9", None));
  }

  #[test]
  fn encode_ascii_is_untouched() {
    assert_eq!("plain ascii", encode("plain ascii", "us-ascii:utf-8", b""));
  }

  #[test]
  fn encode_prefers_shortest_charset() {
    // Latin text fits ISO 8859-1 in fewer bytes than UTF-8.
    let encoded = encode("café", "iso-8859-1:utf-8", b"");
    assert!(encoded.starts_with("=?iso-8859-1?"), "{encoded}");
    assert_eq!("café", decode(encoded.as_bytes(), None));
  }

  #[test]
  fn encode_window_covers_whole_words() {
    let encoded = encode("before wörd after", "utf-8", b"");
    // The word containing the 8-bit character is encoded whole, its neighbours stay bare.
    assert!(encoded.starts_with("before ="), "{encoded}");
    assert!(encoded.ends_with(" after"), "{encoded}");
    assert_eq!("before wörd after", decode(encoded.as_bytes(), None));
  }

  #[test]
  fn encode_literal_marker() {
    // A bare "=?" after whitespace must not survive as-is.
    let encoded = encode("look =?utf-8?Q?fake?= here", "utf-8", b"");
    assert!(!encoded.contains(" =?utf-8?Q?fake?= "), "{encoded}");
    assert_eq!(
      "look =?utf-8?Q?fake?= here",
      decode(encoded.as_bytes(), None)
    );
  }

  #[test]
  fn encode_iso_2022_jp_is_base64() {
    let encoded = encode("日本語テキスト", "iso-2022-jp:utf-8", b"");
    assert!(encoded.starts_with("=?iso-2022-jp?B?"), "{encoded}");
    assert_eq!("日本語テキスト", decode(encoded.as_bytes(), None));
  }

  #[test]
  fn encode_word_and_line_limits() {
    let input = "Übergångsställe på långgatan och ytterligare några ord med åäö i sig";
    for charsets in ["utf-8", "iso-8859-1", "iso-2022-jp:utf-8"] {
      let encoded = encode(input, charsets, b"");
      for line in encoded.split("\r\n") {
        let width = match line.strip_prefix('\t') {
          Some(rest) => 8 + charset::string_width(rest, 8, false),
          None => charset::string_width(line, 0, false),
        };
        assert!(width <= MAX_LINE, "line too long ({width}): {line}");
        for word in line.split_whitespace() {
          if word.starts_with("=?") {
            assert!(word.len() <= MAX_WORD, "word too long: {word}");
          }
        }
      }
      assert_eq!(input, decode(encoded.as_bytes(), None));
    }
  }

  #[test]
  fn encode_roundtrip() {
    for (input, charsets) in [
      ("héllo wörld", "utf-8"),
      ("héllo wörld", "iso-8859-1:utf-8"),
      ("こんにちは", "iso-2022-jp:utf-8"),
      ("mixed ascii és ünicode tail", "utf-8"),
    ] {
      let encoded = encode(input, charsets, b"");
      assert_eq!(input, decode(encoded.as_bytes(), None), "{charsets}");
    }
  }

  #[test]
  fn encode_unconvertible_bytes() {
    let encoded = encode_bytes(b"caf\xe9", "utf-8", "utf-8", b"");
    assert!(encoded.starts_with("=?unknown-8bit?"), "{encoded}");
  }
}
