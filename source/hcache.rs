// Persistent header cache: an envelope skeleton per key so reopening a large mailbox doesn't
// refetch headers the server already sent once. Entries are MessagePack records behind a CRC
// stamp of the record layout; any mismatch reads as a miss, never as an error.

use crate::{buffer, email, imap::state};
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use std::{fmt, fs, io::Write as _, path};

// Bumped whenever the record layout changes; old entries then fail the gate and refill on miss.
const SCHEMA: &str = "tern-hcache-1 envelope body flags received uidvalidity uid keywords";

fn schema_crc() -> u32 {
  crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC).checksum(SCHEMA.as_bytes())
}

// Everything needed to resurrect an Email without talking to the server.
#[derive(Debug, Deserialize, PartialEq, Serialize)]
pub struct Record {
  pub env: email::Envelope,
  pub body: email::Body,
  pub flags: email::Flags,
  pub received: i64,
  pub uidvalidity: u32,
  pub uid: u32,
  pub keywords: Vec<String>,
  pub system_keywords: Vec<String>,
}

impl Record {
  pub fn from_email(email: &email::Email, uidvalidity: u32) -> anyhow::Result<Self> {
    let edata = email.edata()?;
    Ok(Self {
      env: email.env.clone(),
      body: email.body,
      flags: email.flags,
      received: email.received,
      uidvalidity,
      uid: edata.uid,
      keywords: edata.keywords.clone(),
      system_keywords: edata.system_keywords.clone(),
    })
  }

  // The caller owns the result; `active` starts true and `parsed` false (only the skeleton came
  // out of the cache).
  pub fn into_email(self, index: usize) -> email::Email {
    let mut email = email::Email::new(index);
    email.env = self.env;
    email.body = self.body;
    email.flags = self.flags;
    email.received = self.received;
    email.edata = Some(state::Edata {
      uid: self.uid,
      server_flags: self.flags,
      keywords: self.keywords,
      system_keywords: self.system_keywords,
      ..state::Edata::default()
    });
    email
  }
}

// The five operations a swappable store has to provide; close is Drop.
pub trait Backend {
  fn fetch(&self, key: &[u8]) -> Option<Vec<u8>>;
  fn store(&mut self, key: &[u8], bytes: &[u8]) -> anyhow::Result<()>;
  fn delete(&mut self, key: &[u8]) -> anyhow::Result<()>;
  fn name(&self) -> &'static str;
}

// Keys are arbitrary bytes; anything outside the filename-safe set is %XX-escaped.
pub(crate) fn escape_key(key: &[u8]) -> String {
  let mut name = String::with_capacity(key.len());
  for byte in key {
    match byte {
      b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'.' | b'-' | b'_' => name.push(*byte as char),
      byte => name += &format!("%{byte:02X}"),
    }
  }
  name
}

// File-per-key store with staged-rename writes.
pub struct Fs {
  directory: path::PathBuf,
}

impl Fs {
  pub fn open(directory: &path::Path) -> anyhow::Result<Self> {
    fs::create_dir_all(directory)
      .with_context(|| format!("couldn't create {directory:?}"))?;
    Ok(Self {
      directory: directory.to_path_buf(),
    })
  }
}

impl Backend for Fs {
  fn fetch(&self, key: &[u8]) -> Option<Vec<u8>> {
    fs::read(self.directory.join(escape_key(key))).ok()
  }

  fn store(&mut self, key: &[u8], bytes: &[u8]) -> anyhow::Result<()> {
    let staging = self
      .directory
      .join(format!(".{}", uuid::Uuid::new_v4().hyphenated()));
    let mut file = fs::File::create(&staging)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&staging, self.directory.join(escape_key(key)))?;
    Ok(())
  }

  fn delete(&mut self, key: &[u8]) -> anyhow::Result<()> {
    match fs::remove_file(self.directory.join(escape_key(key))) {
      Ok(()) => Ok(()),
      Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
      Err(error) => Err(error)?,
    }
  }

  fn name(&self) -> &'static str {
    "fs"
  }
}

pub struct HeaderCache {
  backend: Box<dyn Backend>,
}

impl fmt::Debug for HeaderCache {
  fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
    formatter
      .debug_struct("HeaderCache")
      .field("backend", &self.backend.name())
      .finish()
  }
}

impl HeaderCache {
  // One handle per mailbox, single writer. `namer` maps the folder to its subdirectory; the
  // default escapes it the same way as keys.
  pub fn open(
    path: &path::Path,
    folder: &str,
    namer: Option<&dyn Fn(&str) -> String>,
  ) -> anyhow::Result<Self> {
    let subdirectory = match namer {
      Some(namer) => namer(folder),
      None => escape_key(folder.as_bytes()),
    };
    Ok(Self {
      backend: Box::new(Fs::open(&path.join(subdirectory))?),
    })
  }

  pub fn with_backend(backend: Box<dyn Backend>) -> Self {
    Self { backend }
  }

  pub fn backend_name(&self) -> &'static str {
    self.backend.name()
  }

  // A CRC or deserialisation failure is a miss: the entry will be refilled from the server.
  pub fn fetch(&self, key: &[u8]) -> Option<Record> {
    let bytes = self.backend.fetch(key)?;
    let (stamp, rest) = bytes.split_first_chunk::<4>()?;
    if u32::from_le_bytes(*stamp) != schema_crc() {
      log::debug!("stale header cache entry for {}", escape_key(key));
      return None;
    }
    match rmp_serde::from_slice(rest) {
      Ok(record) => Some(record),
      Err(error) => {
        log::debug!("undecodable header cache entry for {}: {error}", escape_key(key));
        None
      }
    }
  }

  pub fn store(&mut self, key: &[u8], email: &email::Email, uidvalidity: u32) -> anyhow::Result<()> {
    let record = Record::from_email(email, uidvalidity)?;
    // Bulk header downloads store thousands of entries; the scratch space cycles through the
    // buffer pool instead of the allocator.
    let mut bytes = buffer::get();
    bytes.add_bytes(&schema_crc().to_le_bytes());
    bytes.add_bytes(&rmp_serde::to_vec(&record)?);
    let result = self.backend.store(key, bytes.as_slice());
    buffer::release(bytes);
    result
  }

  // Raw variants for the mailbox meta keys; no CRC gate, the driver validates the values.
  pub fn fetch_raw(&self, key: &[u8]) -> Option<Vec<u8>> {
    self.backend.fetch(key)
  }

  pub fn store_raw(&mut self, key: &[u8], bytes: &[u8]) -> anyhow::Result<()> {
    self.backend.store(key, bytes)
  }

  pub fn delete(&mut self, key: &[u8]) -> anyhow::Result<()> {
    self.backend.delete(key)
  }
}

// Reserved meta keys.
pub const UIDVALIDITY: &[u8] = b"/UIDVALIDITY";
pub const UIDNEXT: &[u8] = b"/UIDNEXT";
pub const MODSEQ: &[u8] = b"/MODSEQ";
pub const UIDSEQSET: &[u8] = b"/UIDSEQSET";

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  fn sample_email() -> email::Email {
    let mut email = email::Email::new(0);
    email.env.subject = Some("hello".to_string());
    email.env.message_id = Some("<1@example.net>".to_string());
    email.received = 1705309662;
    email.flags.read = true;
    email.edata = Some(state::Edata {
      uid: 42,
      msn: 3,
      keywords: vec!["$Label".to_string()],
      ..state::Edata::default()
    });
    email
  }

  #[test]
  fn roundtrip() -> anyhow::Result<()> {
    let directory = tempfile::tempdir()?;
    let mut cache = HeaderCache::open(directory.path(), "INBOX", None)?;
    cache.store(b"42", &sample_email(), 7)?;

    let record = cache.fetch(b"42").unwrap();
    assert_eq!(42, record.uid);
    assert_eq!(7, record.uidvalidity);
    let email = record.into_email(5);
    assert_eq!(5, email.index);
    assert_eq!(Some("hello".to_string()), email.env.subject);
    assert!(email.flags.read);
    assert!(email.active);
    assert!(!email.edata()?.parsed);
    assert_eq!(vec!["$Label".to_string()], email.edata()?.keywords);
    Ok(())
  }

  #[test]
  fn crc_gate() -> anyhow::Result<()> {
    let directory = tempfile::tempdir()?;
    let mut cache = HeaderCache::open(directory.path(), "INBOX", None)?;
    cache.store(b"42", &sample_email(), 7)?;

    // Flip the stamp: the entry reads as absent, not as an error.
    let mut bytes = cache.fetch_raw(b"42").unwrap();
    bytes[0] ^= 0xff;
    cache.store_raw(b"42", &bytes)?;
    assert!(cache.fetch(b"42").is_none());

    // Garbage behind a valid stamp is also just a miss.
    let mut bytes = schema_crc().to_le_bytes().to_vec();
    bytes.extend_from_slice(b"junk");
    cache.store_raw(b"42", &bytes)?;
    assert!(cache.fetch(b"42").is_none());
    Ok(())
  }

  #[test]
  fn meta_keys_and_delete() -> anyhow::Result<()> {
    let directory = tempfile::tempdir()?;
    let mut cache = HeaderCache::open(directory.path(), "folder/sub", None)?;
    cache.store_raw(UIDVALIDITY, b"1676645821")?;
    cache.store_raw(MODSEQ, b"715194045007")?;
    assert_eq!(Some(b"1676645821".to_vec()), cache.fetch_raw(UIDVALIDITY));
    assert_eq!(None, cache.fetch_raw(UIDNEXT));
    cache.delete(UIDVALIDITY)?;
    assert_eq!(None, cache.fetch_raw(UIDVALIDITY));
    // Deleting a missing key is not an error.
    cache.delete(UIDVALIDITY)?;
    Ok(())
  }

  #[test]
  fn folders_do_not_collide() -> anyhow::Result<()> {
    let directory = tempfile::tempdir()?;
    let mut first = HeaderCache::open(directory.path(), "a/b", None)?;
    let mut second = HeaderCache::open(directory.path(), "a.b", None)?;
    first.store_raw(b"k", b"first")?;
    second.store_raw(b"k", b"second")?;
    assert_eq!(Some(b"first".to_vec()), first.fetch_raw(b"k"));
    assert_eq!(Some(b"second".to_vec()), second.fetch_raw(b"k"));
    Ok(())
  }
}
