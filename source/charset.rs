// Character-set plumbing for header display and the encoded-word codec. Conversion goes through
// encoding_rs with the WHATWG label registry; width follows wcwidth conventions for a terminal
// cell grid.

use std::str;

// https://encoding.spec.whatwg.org/#names-and-labels
// The WHATWG registry maps "us-ascii" to windows-1252, which would silently accept 8-bit input.
// Mail wants the strict reading.
fn is_ascii_label(label: &str) -> bool {
  label.eq_ignore_ascii_case("us-ascii") || label.eq_ignore_ascii_case("ascii")
}

pub fn lookup(label: &str) -> Option<&'static encoding_rs::Encoding> {
  encoding_rs::Encoding::for_label(label.trim().as_bytes())
}

// Decode bytes labelled `from` into UTF-8. None when the label is unknown or the input is
// malformed for that charset.
pub fn decode(bytes: &[u8], from: &str) -> Option<String> {
  if is_ascii_label(from) {
    if !bytes.is_ascii() {
      return None;
    }
    return Some(str::from_utf8(bytes).ok()?.to_string());
  }
  let encoding = lookup(from)?;
  let mut decoder = encoding.new_decoder_without_bom_handling();
  let mut output = String::with_capacity(decoder.max_utf8_buffer_length_without_replacement(
    bytes.len(),
  )?);
  let (result, _) = decoder.decode_to_string_without_replacement(bytes, &mut output, true);
  match result {
    encoding_rs::DecoderResult::InputEmpty => Some(output),
    _ => None,
  }
}

// Decode with U+FFFD replacement instead of failing; the label must still be known.
pub fn decode_lossy(bytes: &[u8], from: &str) -> Option<String> {
  if is_ascii_label(from) {
    return Some(bytes.iter().map(|b| if b.is_ascii() { *b as char } else { '\u{fffd}' }).collect());
  }
  let encoding = lookup(from)?;
  let (output, _, _) = encoding.decode(bytes);
  Some(output.into_owned())
}

// Encode UTF-8 into the charset labelled `to`. None when the label is unknown or a character has
// no representation there (no numeric-reference fallbacks on the wire).
pub fn encode(string: &str, to: &str) -> Option<Vec<u8>> {
  if is_ascii_label(to) {
    if !string.is_ascii() {
      return None;
    }
    return Some(string.as_bytes().to_vec());
  }
  let encoding = lookup(to)?;
  let mut encoder = encoding.new_encoder();
  let mut output =
    Vec::with_capacity(encoder.max_buffer_length_from_utf8_without_replacement(string.len())?);
  let (result, _) = encoder.encode_from_utf8_to_vec_without_replacement(string, &mut output, true);
  match result {
    encoding_rs::EncoderResult::InputEmpty => Some(output),
    _ => None,
  }
}

// Convert between two labelled charsets. Identity labels short-circuit without validation.
pub fn convert(bytes: &[u8], from: &str, to: &str) -> Option<Vec<u8>> {
  if from.eq_ignore_ascii_case(to) {
    return Some(bytes.to_vec());
  }
  encode(&decode(bytes, from)?, to)
}

// True when the string carries no uppercase letter in any script.
pub fn is_lowercase(string: &str) -> bool {
  !string.chars().any(char::is_uppercase)
}

fn is_combining(c: char) -> bool {
  matches!(c,
    '\u{0300}'..='\u{036f}'
    | '\u{0483}'..='\u{0489}'
    | '\u{0591}'..='\u{05bd}'
    | '\u{0610}'..='\u{061a}'
    | '\u{064b}'..='\u{065f}'
    | '\u{0e31}'
    | '\u{0e34}'..='\u{0e3a}'
    | '\u{0e47}'..='\u{0e4e}'
    | '\u{1ab0}'..='\u{1aff}'
    | '\u{1dc0}'..='\u{1dff}'
    | '\u{20d0}'..='\u{20ff}'
    | '\u{fe20}'..='\u{fe2f}')
}

fn is_zero_width(c: char) -> bool {
  matches!(c, '\u{200b}'..='\u{200f}' | '\u{feff}' | '\u{00ad}')
}

fn is_wide(c: char) -> bool {
  // East Asian Wide and Fullwidth, the ranges a terminal renders as two cells.
  matches!(c,
    '\u{1100}'..='\u{115f}'
    | '\u{2e80}'..='\u{a4cf}'
    | '\u{a960}'..='\u{a97f}'
    | '\u{ac00}'..='\u{d7a3}'
    | '\u{f900}'..='\u{faff}'
    | '\u{fe30}'..='\u{fe4f}'
    | '\u{ff00}'..='\u{ff60}'
    | '\u{ffe0}'..='\u{ffe6}'
    | '\u{1f300}'..='\u{1f64f}'
    | '\u{1f900}'..='\u{1f9ff}'
    | '\u{20000}'..='\u{2fffd}'
    | '\u{30000}'..='\u{3fffd}')
}

// Terminal cell width of one character. Invisible and combining characters take no cell.
pub fn char_width(c: char) -> usize {
  if c.is_control() || is_combining(c) || is_zero_width(c) {
    return 0;
  }
  if is_wide(c) {
    return 2;
  }
  1
}

// Byte length and cell width of the next character, given the current column (tabs expand to the
// next multiple of 8).
pub fn next_char_width(string: &str, column: usize) -> Option<(usize, usize)> {
  let c = string.chars().next()?;
  if c == '\t' {
    return Some((1, 8 - (column % 8)));
  }
  Some((c.len_utf8(), char_width(c)))
}

// Cell width of a whole string starting at `column`. In display context a space directly after a
// newline reads as an 8-column indent.
pub fn string_width(string: &str, mut column: usize, display: bool) -> usize {
  let start = column;
  let mut after_newline = false;
  for c in string.chars() {
    match c {
      '\n' => {
        after_newline = true;
        continue;
      }
      ' ' if display && after_newline => column += 8,
      '\t' => column += 8 - (column % 8),
      _ => column += char_width(c),
    }
    after_newline = false;
  }
  column - start
}

// Soft hyphen, bidi marks, isolates and embeddings: codepoints that reorder or hide neighbouring
// text when echoed to a terminal.
pub fn is_display_corrupting(c: char) -> bool {
  matches!(c,
    '\u{00ad}'
    | '\u{200e}'
    | '\u{200f}'
    | '\u{feff}'
    | '\u{2066}'..='\u{2069}'
    | '\u{202a}'..='\u{202e}')
}

// Replace unprintable characters with '?'. The replacement character itself is kept when the
// input really contained one (it is printable), but display-corrupting codepoints never survive.
pub fn filter_unprintable(string: &str) -> String {
  let mut output = String::with_capacity(string.len());
  for c in string.chars() {
    if is_display_corrupting(c) || (c.is_control() && c != '\t') {
      output.push('?');
    } else {
      output.push(c);
    }
  }
  output
}
