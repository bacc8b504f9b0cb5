// https://www.rfc-editor.org/rfc/rfc3501#section-6.2.2 - AUTHENTICATE
// https://www.rfc-editor.org/rfc/rfc2195 - CRAM-MD5
// https://www.rfc-editor.org/rfc/rfc2595#section-6 - PLAIN
//
// Prioritised chain: CRAM-MD5, then PLAIN, then plain old LOGIN. A NO moves on to the next
// mechanism; anything else (transport, user abort) ends the chain.

use super::command::{Account, Command};
use crate::connection;
use base64::Engine as _;
use zeroize::Zeroize as _;

#[derive(zeroize::Zeroize, zeroize::ZeroizeOnDrop)]
pub struct Credentials {
  pub user: String,
  pub password: String,
}

fn engine() -> base64::engine::GeneralPurpose {
  base64::engine::GeneralPurpose::new(
    &base64::alphabet::STANDARD,
    base64::engine::general_purpose::PAD,
  )
}

// https://www.rfc-editor.org/rfc/rfc2104
// H(K XOR opad, H(K XOR ipad, text)), block size 64 for MD5.
fn hmac_md5(key: &[u8], message: &[u8]) -> [u8; 16] {
  const BLOCK: usize = 64;
  let mut key = if key.len() > BLOCK {
    md5::compute(key).0.to_vec()
  } else {
    key.to_vec()
  };
  key.resize(BLOCK, 0);
  let mut inner: Vec<u8> = key.iter().map(|byte| byte ^ 0x36).collect();
  inner.extend_from_slice(message);
  let inner_digest = md5::compute(&inner);
  let mut outer: Vec<u8> = key.iter().map(|byte| byte ^ 0x5c).collect();
  outer.extend_from_slice(&inner_digest.0);
  let digest = md5::compute(&outer);
  key.zeroize();
  inner.zeroize();
  outer.zeroize();
  digest.0
}

// The response is `user <lowercase hex digest>`, base64'd.
fn cram_md5_answer(credentials: &Credentials, challenge: &[u8]) -> anyhow::Result<Vec<u8>> {
  let engine = engine();
  let challenge = engine
    .decode(challenge.trim_ascii())
    .map_err(|error| anyhow::anyhow!("undecodable CRAM-MD5 challenge: {error}"))?;
  let digest = hmac_md5(credentials.password.as_bytes(), &challenge);
  let mut answer = format!("{} ", credentials.user);
  for byte in digest {
    answer += &format!("{byte:02x}");
  }
  let encoded = engine.encode(&answer);
  answer.zeroize();
  Ok(encoded.into_bytes())
}

// https://www.rfc-editor.org/rfc/rfc3501#section-9
// quoted = DQUOTE *QUOTED-CHAR DQUOTE; backslash and double quote need escaping.
fn quote(input: &str) -> String {
  let mut output = String::with_capacity(input.len() + 2);
  output.push('"');
  for c in input.chars() {
    if c == '"' || c == '\\' {
      output.push('\\');
    }
    output.push(c);
  }
  output.push('"');
  output
}

pub fn authenticate<RW>(
  account: &mut Account<RW>,
  credentials: &Credentials,
) -> anyhow::Result<()>
where
  RW: connection::ReadWrite,
{
  if account.capabilities.has("AUTH=CRAM-MD5") {
    log::debug!("authenticating with CRAM-MD5");
    let mut answer = |challenge: &[u8]| cram_md5_answer(credentials, challenge);
    let completion = account.exec(
      None,
      Command::new(b"AUTHENTICATE CRAM-MD5".to_vec())
        .sensitive()
        .on_continue(&mut answer),
    )?;
    if completion.ok() {
      return refresh(account);
    }
    log::info!("CRAM-MD5 authentication refused: {}", completion.text);
  }

  if account.capabilities.has("AUTH=PLAIN") {
    log::debug!("authenticating with PLAIN");
    let mut answer = |_challenge: &[u8]| -> anyhow::Result<Vec<u8>> {
      Ok(
        super::plain(&credentials.user, &credentials.password)
          .into_bytes(),
      )
    };
    let completion = account.exec(
      None,
      Command::new(b"AUTHENTICATE PLAIN".to_vec())
        .sensitive()
        .on_continue(&mut answer),
    )?;
    if completion.ok() {
      return refresh(account);
    }
    log::info!("PLAIN authentication refused: {}", completion.text);
  }

  // https://www.rfc-editor.org/rfc/rfc3501#section-6.2.3
  if !account.capabilities.has("LOGINDISABLED") {
    log::debug!("authenticating with LOGIN");
    let completion = account.exec(
      None,
      Command::new(
        format!(
          "LOGIN {} {}",
          quote(&credentials.user),
          quote(&credentials.password)
        )
        .into_bytes(),
      )
      .sensitive(),
    )?;
    if completion.ok() {
      return refresh(account);
    }
    log::info!("LOGIN refused: {}", completion.text);
  }

  anyhow::bail!("no authentication method succeeded")
}

// https://www.rfc-editor.org/rfc/rfc3501#section-6.2.2
// A server MAY include a CAPABILITY response code in the tagged OK response of a successful
// AUTHENTICATE command; when it doesn't, ask again since capabilities usually grow after login.
fn refresh<RW>(account: &mut Account<RW>) -> anyhow::Result<()>
where
  RW: connection::ReadWrite,
{
  account
    .exec(None, Command::new(b"CAPABILITY".to_vec()))?
    .ensure_ok("CAPABILITY")?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  #[test]
  fn hmac_md5_test_vector() {
    // https://www.rfc-editor.org/rfc/rfc2195#section-2
    let digest = hmac_md5(
      b"tanstaaftanstaaf",
      b"<1896.697170952@postoffice.reston.mci.net>",
    );
    let mut hex = String::new();
    for byte in digest {
      hex += &format!("{byte:02x}");
    }
    assert_eq!("b913a602c7eda7a495b4e6e7334d3890", hex);
  }

  #[test]
  fn cram_md5_exchange() -> anyhow::Result<()> {
    let credentials = Credentials {
      user: "tim".to_string(),
      password: "tanstaaftanstaaf".to_string(),
    };
    let challenge = engine().encode(b"<1896.697170952@postoffice.reston.mci.net>");
    let answer = cram_md5_answer(&credentials, challenge.as_bytes())?;
    let decoded = engine().decode(&answer)?;
    assert_eq!(
      b"tim b913a602c7eda7a495b4e6e7334d3890".to_vec(),
      decoded
    );
    Ok(())
  }

  #[test]
  fn quoting() {
    assert_eq!("\"user\"", quote("user"));
    assert_eq!("\"pa\\\"ss\\\\word\"", quote("pa\"ss\\word"));
  }
}
