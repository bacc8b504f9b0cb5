// Per-selected-mailbox protocol state: the dense MSN index over the email arena, the UID hash,
// and flag reconciliation against server FETCH updates.
//
// https://www.rfc-editor.org/rfc/rfc3501#section-2.3.1.2
// Message sequence numbers are 1-based and densely renumbered whenever a message is expunged.

use crate::{bcache, email, hcache};
use std::collections;

// Backend slot hung off every Email while its mailbox is open.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Edata {
  pub uid: u32,
  pub msn: u32,
  // Flag state as last seen from the server, used to compute STORE diffs.
  pub server_flags: email::Flags,
  pub keywords: Vec<String>,
  pub system_keywords: Vec<String>,
  // Whether the full header went through the reader, or only the cache skeleton.
  pub parsed: bool,
  pub modseq: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Reopen {
  pub allow: bool,
  pub expunge_pending: bool,
  pub newmail_pending: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CheckStatus {
  pub new_mail: bool,
  pub flags_changed: bool,
  pub reopened: bool,
}

#[derive(Debug, Default)]
pub struct MboxData {
  // Decoded name and the munged wire form.
  pub name: String,
  pub munged: Vec<u8>,
  pub uidvalidity: u32,
  pub uidnext: u32,
  pub modseq: u64,
  // MSN-1 -> arena index; entries may be absent mid-download.
  msn: Vec<Option<usize>>,
  pub uid_hash: collections::HashMap<u32, usize>,
  pub reopen: Reopen,
  pub check: CheckStatus,
  pub delimiter: Option<char>,
  // PERMANENTFLAGS advertised \*, i.e. user keywords can be stored.
  pub user_keywords: bool,
  pub readonly: bool,
  pub exists: u32,
  pub maxuid: u32,
  pub hcache: Option<hcache::HeaderCache>,
  pub bcache: Option<bcache::BodyCache>,
}

impl MboxData {
  pub fn new(name: &str, munged: Vec<u8>) -> Self {
    Self {
      name: name.to_string(),
      munged,
      ..Self::default()
    }
  }

  pub fn reserve(&mut self, size: usize) {
    if self.msn.len() < size {
      self.msn.resize(size, None);
    }
  }

  pub fn msn_get(&self, index: usize) -> Option<usize> {
    self.msn.get(index).copied().flatten()
  }

  pub fn msn_set(&mut self, index: usize, id: usize) {
    self.reserve(index + 1);
    self.msn[index] = Some(id);
  }

  // Drop all entries at and above `index` (download restart).
  pub fn msn_free_from(&mut self, index: usize) {
    self.msn.truncate(index);
  }

  pub fn msn_len(&self) -> usize {
    self.msn.len()
  }

  pub fn highest_msn(&self) -> u32 {
    self.msn.len() as u32
  }

  pub fn clear_indices(&mut self) {
    self.msn.clear();
    self.uid_hash.clear();
  }

  // https://www.rfc-editor.org/rfc/rfc3501#section-7.4.1
  // The expunged message's sequence number disappears and every following message shifts down by
  // one. Returns the arena index of the expunged email.
  pub fn apply_expunge(&mut self, emails: &mut [email::Email], msn: u32) -> Option<usize> {
    let index = msn.checked_sub(1)? as usize;
    if index >= self.msn.len() {
      return None;
    }
    let expunged = self.msn.remove(index);
    if let Some(id) = expunged {
      emails[id].active = false;
      if let Some(edata) = emails[id].edata.as_ref() {
        self.uid_hash.remove(&edata.uid);
      }
    }
    for shifted in index..self.msn.len() {
      if let Some(id) = self.msn[shifted] {
        if let Some(edata) = emails[id].edata.as_mut() {
          edata.msn = shifted as u32 + 1;
        }
      }
    }
    self.exists = self.exists.saturating_sub(1);
    expunged
  }

  // https://www.rfc-editor.org/rfc/rfc7162#section-3.2.10
  // VANISHED enumerates UIDs; matching messages are removed and the MSN list compacted.
  pub fn apply_vanished(&mut self, emails: &mut [email::Email], uids: &[super::Range]) {
    // Match against the hash rather than walking the ranges: a server may send 1:* and the
    // ranges are inclusive of u32::MAX.
    let matching: Vec<u32> = self
      .uid_hash
      .keys()
      .copied()
      .filter(|uid| uids.iter().any(|range| range.contains(*uid)))
      .collect();
    let mut removed = 0;
    for uid in matching {
      if let Some(id) = self.uid_hash.remove(&uid) {
        emails[id].active = false;
        if let Some(slot) = self.msn.iter_mut().find(|slot| **slot == Some(id)) {
          *slot = None;
        }
        removed += 1;
      }
    }
    if removed > 0 {
      self.msn.retain(Option::is_some);
      for index in 0..self.msn.len() {
        if let Some(id) = self.msn[index] {
          if let Some(edata) = emails[id].edata.as_mut() {
            edata.msn = index as u32 + 1;
          }
        }
      }
      self.exists = self.exists.saturating_sub(removed);
    }
  }

  // Every installed email must be reachable through both indices. QRESYNC replay is only trusted
  // when this holds.
  pub fn verify(&self, emails: &[email::Email]) -> bool {
    for email in emails.iter().filter(|email| email.active) {
      let Some(edata) = email.edata.as_ref() else {
        return false;
      };
      if self.msn_get(edata.msn as usize - 1) != Some(email.index) {
        return false;
      }
      if self.uid_hash.get(&edata.uid) != Some(&email.index) {
        return false;
      }
    }
    true
  }
}

#[derive(Debug, Default, PartialEq)]
pub struct ParsedFlags {
  pub flags: email::Flags,
  pub keywords: Vec<String>,
  pub system_keywords: Vec<String>,
}

// https://www.rfc-editor.org/rfc/rfc3501#section-2.3.2
// System flags begin with "\"; everything else is a keyword. `old` is local-only: set when the
// message is neither \Seen nor \Recent and the caller wants seen-but-unread tracking.
pub fn parse_flags<F: AsRef<[u8]>>(list: &[F], mark_old: bool) -> ParsedFlags {
  let mut parsed = ParsedFlags::default();
  for flag in list {
    match flag.as_ref() {
      b"\\Seen" => parsed.flags.read = true,
      b"\\Deleted" => parsed.flags.deleted = true,
      b"\\Flagged" => parsed.flags.flagged = true,
      b"\\Answered" => parsed.flags.replied = true,
      b"\\Recent" => parsed.flags.recent = true,
      b"\\Draft" => parsed.flags.draft = true,
      flag if flag.starts_with(b"\\") => parsed
        .system_keywords
        .push(String::from_utf8_lossy(flag).into_owned()),
      flag => parsed
        .keywords
        .push(String::from_utf8_lossy(flag).into_owned()),
    }
  }
  parsed.flags.old = mark_old && !parsed.flags.read && !parsed.flags.recent;
  parsed
}

// A FLAGS update from the server. When a local modification is pending the local bits win and
// only the server-side fields are accepted; otherwise the server is authoritative.
pub fn reconcile_flags(email: &mut email::Email, parsed: ParsedFlags) -> anyhow::Result<()> {
  let edata = email.edata_mut()?;
  edata.server_flags = parsed.flags;
  edata.keywords = parsed.keywords;
  edata.system_keywords = parsed.system_keywords;
  if email.changed {
    email.flags.draft = parsed.flags.draft;
    return Ok(());
  }
  let old = email.flags.old;
  email.flags = parsed.flags;
  // `old` was decided when the message was first seen; a flags refresh doesn't reopen that.
  email.flags.old = old || parsed.flags.old;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::imap::Range;
  use pretty_assertions::assert_eq;

  fn mailbox_with(uids: &[u32]) -> (MboxData, Vec<email::Email>) {
    let mut mdata = MboxData::new("INBOX", b"INBOX".to_vec());
    let mut emails = Vec::new();
    for (index, uid) in uids.iter().enumerate() {
      let mut email = email::Email::new(index);
      email.edata = Some(Edata {
        uid: *uid,
        msn: index as u32 + 1,
        ..Edata::default()
      });
      mdata.msn_set(index, index);
      mdata.uid_hash.insert(*uid, index);
      emails.push(email);
    }
    mdata.exists = uids.len() as u32;
    (mdata, emails)
  }

  #[test]
  fn expunge_shifts_down() -> anyhow::Result<()> {
    let (mut mdata, mut emails) = mailbox_with(&[10, 11, 12, 13, 14]);
    let expunged = mdata.apply_expunge(&mut emails, 3);
    assert_eq!(Some(2), expunged);
    assert!(!emails[2].active);

    // MSN 1..4 now map to UIDs 10,11,13,14 and nothing claims MSN 5.
    let uids: Vec<u32> = (0..mdata.msn_len())
      .map(|index| {
        let id = mdata.msn_get(index).unwrap();
        emails[id].edata().unwrap().uid
      })
      .collect();
    assert_eq!(vec![10, 11, 13, 14], uids);
    assert!(emails
      .iter()
      .filter(|email| email.active)
      .all(|email| email.edata.as_ref().unwrap().msn <= 4));
    assert!(!mdata.uid_hash.contains_key(&12));
    assert!(mdata.verify(&emails));
    Ok(())
  }

  #[test]
  fn vanished_compacts() {
    let (mut mdata, mut emails) = mailbox_with(&[10, 11, 12, 13, 14]);
    mdata.apply_vanished(&mut emails, &[Range(11, 12), Range(14, 14)]);
    let uids: Vec<u32> = (0..mdata.msn_len())
      .map(|index| {
        let id = mdata.msn_get(index).unwrap();
        emails[id].edata().unwrap().uid
      })
      .collect();
    assert_eq!(vec![10, 13], uids);
    assert_eq!(2, mdata.exists);
    assert!(mdata.verify(&emails));
  }

  #[test]
  fn repeated_expunges_keep_invariant() {
    let (mut mdata, mut emails) = mailbox_with(&[1, 2, 3, 4, 5, 6, 7, 8]);
    for msn in [1, 3, 3, 5] {
      mdata.apply_expunge(&mut emails, msn);
      assert!(mdata.verify(&emails));
    }
    assert_eq!(4, mdata.msn_len());
  }

  #[test]
  fn flag_parsing() {
    let parsed = parse_flags(
      &[&b"\\Seen"[..], &b"\\Flagged"[..], &b"$Label"[..], &b"\\NonJunk"[..]],
      true,
    );
    assert!(parsed.flags.read);
    assert!(parsed.flags.flagged);
    assert!(!parsed.flags.old);
    assert_eq!(vec!["$Label".to_string()], parsed.keywords);
    assert_eq!(vec!["\\NonJunk".to_string()], parsed.system_keywords);

    // Neither \Seen nor \Recent with mark_old on.
    let parsed = parse_flags(&[&b"\\Answered"[..]], true);
    assert!(parsed.flags.old);
    let parsed = parse_flags(&[&b"\\Recent"[..]], true);
    assert!(!parsed.flags.old);
  }

  #[test]
  fn reconcile_local_changes_win() -> anyhow::Result<()> {
    let mut email = email::Email::new(0);
    email.edata = Some(Edata::default());
    email.flags.flagged = true;
    email.changed = true;

    // Server FLAGS without \Flagged must not clear the pending local bit.
    reconcile_flags(&mut email, parse_flags(&[&b"\\Seen"[..]], false))?;
    assert!(email.flags.flagged);
    assert!(email.changed);
    assert!(!email.flags.read); // local state kept wholesale
    assert!(email.edata()?.server_flags.read); // but the server view is remembered

    // Without a pending change the server wins.
    email.changed = false;
    reconcile_flags(&mut email, parse_flags(&[&b"\\Seen"[..]], false))?;
    assert!(email.flags.read);
    assert!(!email.flags.flagged);
    Ok(())
  }
}
