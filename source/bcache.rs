// On-disk message body store, one ordinary file per message keyed "{uidvalidity}-{uid}". Writes
// land in a staging file first and become visible on commit, so a crash leaves either the old
// body or nothing, never a truncated one.

use crate::hcache::escape_key;
use anyhow::Context as _;
use std::{
  fs,
  io::{self, Write as _},
  path,
};

pub fn key(uidvalidity: u32, uid: u32) -> String {
  format!("{uidvalidity}-{uid}")
}

fn parse_key(id: &str) -> Option<(u32, u32)> {
  let (uidvalidity, uid) = id.split_once('-')?;
  Some((uidvalidity.parse().ok()?, uid.parse().ok()?))
}

#[derive(Debug)]
pub struct BodyCache {
  directory: path::PathBuf,
}

// A staged entry; nothing is visible under the key until commit.
#[derive(Debug)]
pub struct Writer {
  file: fs::File,
  staging: path::PathBuf,
  committed: path::PathBuf,
}

impl io::Write for Writer {
  fn write(&mut self, buffer: &[u8]) -> io::Result<usize> {
    self.file.write(buffer)
  }

  fn flush(&mut self) -> io::Result<()> {
    self.file.flush()
  }
}

impl Writer {
  pub fn commit(self) -> anyhow::Result<()> {
    self.file.sync_all()?;
    fs::rename(&self.staging, &self.committed)
      .with_context(|| format!("couldn't commit {:?}", self.committed))?;
    Ok(())
  }

  // Dropping without commit leaves the staging file behind for `clean` to sweep; abandon removes
  // it eagerly.
  pub fn abandon(self) {
    let _ = fs::remove_file(&self.staging);
  }
}

impl BodyCache {
  // The directory is derived from the account and the munged mailbox name so two mailboxes never
  // share a namespace.
  pub fn open(root: &path::Path, account: &str, mailbox: &str) -> anyhow::Result<Self> {
    let directory = root
      .join(escape_key(account.as_bytes()))
      .join(escape_key(mailbox.as_bytes()));
    fs::create_dir_all(&directory).with_context(|| format!("couldn't create {directory:?}"))?;
    Ok(Self { directory })
  }

  pub fn get(&self, id: &str) -> Option<fs::File> {
    fs::File::open(self.directory.join(id)).ok()
  }

  pub fn path(&self, id: &str) -> path::PathBuf {
    self.directory.join(id)
  }

  pub fn exists(&self, id: &str) -> bool {
    self.directory.join(id).is_file()
  }

  pub fn put(&self, id: &str) -> anyhow::Result<Writer> {
    let staging = self
      .directory
      .join(format!(".{}.{}", id, uuid::Uuid::new_v4().hyphenated()));
    Ok(Writer {
      file: fs::File::create(&staging)?,
      staging,
      committed: self.directory.join(id),
    })
  }

  pub fn del(&self, id: &str) -> anyhow::Result<()> {
    match fs::remove_file(self.directory.join(id)) {
      Ok(()) => Ok(()),
      Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
      Err(error) => Err(error)?,
    }
  }

  pub fn list(&self, callback: &mut dyn FnMut(&str)) -> anyhow::Result<()> {
    for entry in fs::read_dir(&self.directory)? {
      let entry = entry?;
      let name = entry.file_name();
      let Some(name) = name.to_str() else {
        continue;
      };
      // Staging files start with a dot and are not entries.
      if !name.starts_with('.') {
        callback(name);
      }
    }
    Ok(())
  }

  // Sweep entries from another UID epoch or whose UID is gone, plus abandoned staging files.
  pub fn clean(&self, keep: &dyn Fn(u32, u32) -> bool) -> anyhow::Result<()> {
    for entry in fs::read_dir(&self.directory)? {
      let entry = entry?;
      let name = entry.file_name();
      let Some(name) = name.to_str() else {
        continue;
      };
      let stale = match parse_key(name) {
        Some((uidvalidity, uid)) => !keep(uidvalidity, uid),
        None => name.starts_with('.'),
      };
      if stale {
        log::debug!("sweeping stale body cache entry {name}");
        let _ = fs::remove_file(entry.path());
      }
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;
  use std::io::Read as _;

  #[test]
  fn staged_commit() -> anyhow::Result<()> {
    let directory = tempfile::tempdir()?;
    let cache = BodyCache::open(directory.path(), "user@host", "INBOX")?;

    let id = key(7, 42);
    let mut writer = cache.put(&id)?;
    writer.write_all(b"body bytes")?;
    // Not visible until committed.
    assert!(cache.get(&id).is_none());
    writer.commit()?;

    let mut content = String::new();
    cache.get(&id).unwrap().read_to_string(&mut content)?;
    assert_eq!("body bytes", content);

    cache.del(&id)?;
    assert!(cache.get(&id).is_none());
    cache.del(&id)?; // idempotent
    Ok(())
  }

  #[test]
  fn abandoned_writes_are_invisible() -> anyhow::Result<()> {
    let directory = tempfile::tempdir()?;
    let cache = BodyCache::open(directory.path(), "user@host", "INBOX")?;
    let mut writer = cache.put(&key(7, 1))?;
    writer.write_all(b"partial")?;
    writer.abandon();

    let mut seen = Vec::new();
    cache.list(&mut |id| seen.push(id.to_string()))?;
    assert!(seen.is_empty());
    Ok(())
  }

  #[test]
  fn clean_sweeps_other_epochs() -> anyhow::Result<()> {
    let directory = tempfile::tempdir()?;
    let cache = BodyCache::open(directory.path(), "user@host", "INBOX")?;
    for id in [key(7, 1), key(7, 2), key(6, 1)] {
      let mut writer = cache.put(&id)?;
      writer.write_all(b"x")?;
      writer.commit()?;
    }
    // Leave a stray staging file around too.
    let _ = cache.put(&key(7, 3))?;

    // Keep uidvalidity 7 and only uid 1.
    cache.clean(&|uidvalidity, uid| uidvalidity == 7 && uid == 1)?;

    let mut seen = Vec::new();
    cache.list(&mut |id| seen.push(id.to_string()))?;
    assert_eq!(vec![key(7, 1)], seen);
    assert!(!cache.path(&key(6, 1)).exists());
    // The staging stray went with the sweep.
    let parent = cache.path(&key(7, 1));
    assert_eq!(1, fs::read_dir(parent.parent().unwrap())?.count());
    Ok(())
  }

  #[test]
  fn mailboxes_are_namespaced() -> anyhow::Result<()> {
    let directory = tempfile::tempdir()?;
    let inbox = BodyCache::open(directory.path(), "user@host", "INBOX")?;
    let other = BodyCache::open(directory.path(), "user@host", "folder/sub")?;
    let id = key(1, 1);
    let mut writer = inbox.put(&id)?;
    writer.write_all(b"inbox")?;
    writer.commit()?;
    assert!(other.get(&id).is_none());
    Ok(())
  }
}
