// The public mailbox abstraction: open/check/sync/close and the per-message operations. This
// layer owns the email arena, keeps the derived indices and counters, and decides when the sync
// driver runs; it never draws or prompts, collaborators do that through Observer.

use crate::imap::{
  auth,
  command::{Account, Code, Command, Completion, ListEntry, Selected},
  state, sync, utf8_to_utf7,
};
use crate::{bcache, connection, email, hcache, url, Observer};
use anyhow::Context as _;
use std::{collections, fs, io, path};

// Outcome of check/sync, ordered by how much the caller has to re-read.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MxStatus {
  Ok,
  Flags,
  NewMail,
  Reopened,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Aggregates {
  pub count: usize,
  pub unread: usize,
  pub flagged: usize,
  pub deleted: usize,
  pub size: u64,
}

// Tag names that shadow flag bits when edited through tags_commit.
#[derive(Clone, Debug)]
pub struct TagMap {
  pub unread: String,
  pub replied: String,
  pub flagged: String,
}

impl Default for TagMap {
  fn default() -> Self {
    Self {
      unread: "unread".to_string(),
      replied: "replied".to_string(),
      flagged: "flagged".to_string(),
    }
  }
}

#[derive(Debug, Default)]
pub struct Mailbox {
  pub emails: Vec<email::Email>,
  pub kind: Option<url::Scheme>,
  pub verbose: bool,
  pub readonly: bool,
  pub aggregates: Aggregates,
  pub id_hash: collections::HashMap<String, usize>,
  pub subject_hash: collections::HashMap<String, Vec<usize>>,
  pub label_hash: collections::HashMap<String, Vec<usize>>,
}

impl Mailbox {
  pub fn recount(&mut self) {
    let mut aggregates = Aggregates::default();
    for email in self.emails.iter().filter(|email| email.active) {
      aggregates.count += 1;
      if !email.flags.read {
        aggregates.unread += 1;
      }
      if email.flags.flagged {
        aggregates.flagged += 1;
      }
      if email.flags.deleted {
        aggregates.deleted += 1;
      }
      aggregates.size += email.body.length;
    }
    self.aggregates = aggregates;
  }

  pub fn rebuild_indices(&mut self) {
    self.id_hash.clear();
    self.subject_hash.clear();
    self.label_hash.clear();
    for email in self.emails.iter().filter(|email| email.active) {
      if let Some(message_id) = email.env.message_id.as_ref() {
        self.id_hash.insert(message_id.clone(), email.index);
      }
      if let Some(subject) = email.env.subject.as_ref() {
        self
          .subject_hash
          .entry(subject.clone())
          .or_default()
          .push(email.index);
      }
      if let Some(label) = email.env.x_label.as_ref() {
        self
          .label_hash
          .entry(label.clone())
          .or_default()
          .push(email.index);
      }
    }
  }
}

#[derive(Debug)]
pub struct OpenConfig {
  pub headers_cache: Option<path::PathBuf>,
  pub bodies_cache: Option<path::PathBuf>,
  pub fetch: sync::FetchConfig,
  // Namespaces the body cache, typically user@host.
  pub account_id: String,
  pub tag_map: TagMap,
  // check() skips its NOOP while the connection is fresher than this; zero polls every time.
  // Clamped against the keepalive ceiling either way.
  pub poll_interval: std::time::Duration,
}

impl Default for OpenConfig {
  fn default() -> Self {
    Self {
      headers_cache: None,
      bodies_cache: None,
      fetch: sync::FetchConfig::default(),
      account_id: "anonymous".to_string(),
      tag_map: TagMap::default(),
      poll_interval: std::time::Duration::ZERO,
    }
  }
}

// An open message body, backed by the body cache file.
#[derive(Debug)]
pub struct Message {
  pub path: path::PathBuf,
  pub file: fs::File,
}

pub fn msg_commit(message: &mut Message) -> io::Result<()> {
  message.file.sync_all()
}

pub fn msg_close(message: Message) {
  drop(message);
}

pub struct ImapMailbox<RW> {
  pub account: Account<RW>,
  pub mdata: state::MboxData,
  pub mailbox: Mailbox,
  config: OpenConfig,
}

// `imap://` and `imaps://` are this engine's; `notmuch://` is routed to the notmuch integration.
pub fn path_probe(url: &str) -> Option<url::Scheme> {
  url::probe(url)
}

pub fn list_mailboxes<RW>(
  account: &mut Account<RW>,
  pattern: &str,
) -> anyhow::Result<Vec<ListEntry>>
where
  RW: connection::ReadWrite,
{
  let completion = account
    .exec(
      None,
      Command::new(format!("LIST \"\" \"{pattern}\"").into_bytes()),
    )?
    .ensure_ok("LIST")?;
  Ok(completion.lists)
}

// Non-selected mailbox poll.
pub fn status<RW>(
  account: &mut Account<RW>,
  mailbox: &str,
) -> anyhow::Result<Vec<crate::imap::StatusItem>>
where
  RW: connection::ReadWrite,
{
  let munged = if account.utf8_enabled {
    mailbox.as_bytes().to_vec()
  } else {
    utf8_to_utf7(mailbox)
  };
  let segments = crate::imap::command::splice_literal(
    b"STATUS ".to_vec(),
    &munged,
    b" (MESSAGES RECENT UIDNEXT UIDVALIDITY UNSEEN HIGHESTMODSEQ)".to_vec(),
    account.literal_plus(),
  );
  let mut completion = account
    .exec(None, Command::segments(segments))?
    .ensure_ok("STATUS")?;
  Ok(
    completion
      .statuses
      .pop()
      .map(|(_, items)| items)
      .unwrap_or_default(),
  )
}

// Connection bring-up shared by every caller: greeting, authentication, extension enabling.
pub fn login<RW>(
  account: &mut Account<RW>,
  credentials: &auth::Credentials,
) -> anyhow::Result<()>
where
  RW: connection::ReadWrite,
{
  account.greeting()?;
  auth::authenticate(account, credentials)?;
  account.enable()?;
  Ok(())
}

pub fn open<RW>(
  mut account: Account<RW>,
  name: &str,
  config: OpenConfig,
  observer: &mut dyn Observer,
) -> anyhow::Result<ImapMailbox<RW>>
where
  RW: connection::ReadWrite,
{
  // https://www.rfc-editor.org/rfc/rfc3501#section-6.3.8
  // An empty name argument returns the hierarchy delimiter without listing anything.
  let completion = account
    .exec(None, Command::new(b"LIST \"\" \"\"".to_vec()))?
    .ensure_ok("LIST")?;
  let delimiter = completion.lists.first().and_then(|entry| entry.delimiter);

  let munged = if account.utf8_enabled {
    name.as_bytes().to_vec()
  } else {
    utf8_to_utf7(name)
  };
  let mut mdata = state::MboxData::new(name, munged);
  mdata.delimiter = delimiter;

  // Cache failures degrade to uncached operation, they don't fail the open.
  if let Some(root) = config.headers_cache.as_ref() {
    match hcache::HeaderCache::open(root, name, None) {
      Ok(cache) => mdata.hcache = Some(cache),
      Err(error) => log::warn!("couldn't open the header cache: {error}"),
    }
  }
  if let Some(root) = config.bodies_cache.as_ref() {
    match bcache::BodyCache::open(root, &config.account_id, name) {
      Ok(cache) => mdata.bcache = Some(cache),
      Err(error) => log::warn!("couldn't open the body cache: {error}"),
    }
  }

  let mut emails = Vec::new();
  let completion = sync::select(&mut account, &mut mdata, &mut emails)?;
  anyhow::ensure!(
    completion.ok(),
    "couldn't select {name}: {}",
    completion.text
  );

  let exists = mdata.exists;
  sync::fetch_headers(
    &mut account,
    &mut mdata,
    &mut emails,
    1,
    exists,
    true,
    &config.fetch,
    observer,
  )?;

  // Entries from another UID epoch, or whose UID vanished while we were away, go now.
  if let Some(bcache) = mdata.bcache.as_ref() {
    let uidvalidity = mdata.uidvalidity;
    let uid_hash = &mdata.uid_hash;
    if let Err(error) =
      bcache.clean(&|entry_uidvalidity, uid| {
        entry_uidvalidity == uidvalidity && uid_hash.contains_key(&uid)
      })
    {
      log::warn!("couldn't sweep the body cache: {error}");
    }
  }

  if !mdata.verify(&emails) {
    return Err(
      anyhow::Error::new(crate::Error::Coherence)
        .context(format!("{name} indices are inconsistent after download")),
    );
  }

  mdata.reopen = state::Reopen {
    allow: true,
    ..state::Reopen::default()
  };
  mdata.check = state::CheckStatus::default();

  let mut mailbox = Mailbox {
    emails,
    kind: Some(url::Scheme::Imap),
    readonly: mdata.readonly,
    ..Mailbox::default()
  };
  mailbox.recount();
  mailbox.rebuild_indices();
  Ok(ImapMailbox {
    account,
    mdata,
    mailbox,
    config,
  })
}

impl<RW> ImapMailbox<RW>
where
  RW: connection::ReadWrite,
{
  // Drop logically expunged messages and renumber the arena; the MSN values are already dense.
  fn compact(&mut self) {
    let mut emails = std::mem::take(&mut self.mailbox.emails);
    emails.retain(|email| email.active);
    self.mdata.clear_indices();
    for (index, email) in emails.iter_mut().enumerate() {
      email.index = index;
      if let Some(edata) = email.edata.as_ref() {
        self.mdata.msn_set(edata.msn as usize - 1, index);
        self.mdata.uid_hash.insert(edata.uid, index);
      }
    }
    self.mailbox.emails = emails;
    self.mailbox.recount();
    self.mailbox.rebuild_indices();
  }

  // NOOP (unless the connection is fresh), then act on whatever the untagged traffic flagged.
  pub fn check(&mut self, observer: &mut dyn Observer) -> anyhow::Result<MxStatus> {
    let interval = self
      .config
      .poll_interval
      .min(crate::imap::command::KEEPALIVE);
    let fresh = self
      .account
      .last_exchange()
      .map_or(false, |at| at.elapsed() < interval);
    if !fresh {
      self
        .account
        .exec(
          Some(&mut Selected {
            mdata: &mut self.mdata,
            emails: &mut self.mailbox.emails,
          }),
          Command::new(b"NOOP".to_vec()),
        )?
        .ensure_ok("NOOP")?;
    }

    let mut status = MxStatus::Ok;
    if self.mdata.reopen.allow && self.mdata.reopen.expunge_pending {
      self.compact();
      self.mdata.reopen.expunge_pending = false;
      status = MxStatus::Reopened;
    }
    let known = self.mdata.msn_len() as u32;
    if self.mdata.reopen.newmail_pending || self.mdata.exists > known {
      let exists = self.mdata.exists;
      sync::fetch_headers(
        &mut self.account,
        &mut self.mdata,
        &mut self.mailbox.emails,
        known + 1,
        exists,
        false,
        &self.config.fetch,
        observer,
      )?;
      self.mdata.reopen.newmail_pending = false;
      self.mailbox.recount();
      self.mailbox.rebuild_indices();
      if status == MxStatus::Ok {
        status = MxStatus::NewMail;
      }
    }
    if self.mdata.check.flags_changed && status == MxStatus::Ok {
      status = MxStatus::Flags;
      self.mailbox.recount();
    }
    self.mdata.check = state::CheckStatus::default();
    Ok(status)
  }

  // Push pending local flag changes as STOREs, then expunge if asked to.
  pub fn sync(&mut self, expunge: bool, _observer: &mut dyn Observer) -> anyhow::Result<MxStatus> {
    anyhow::ensure!(!self.mdata.readonly, "{} is read-only", self.mdata.name);

    let tag_map = self.config.tag_map.clone();
    let mut stored = Vec::new();
    for id in 0..self.mailbox.emails.len() {
      let email = &self.mailbox.emails[id];
      if !email.active || !email.changed {
        continue;
      }
      let edata = email.edata()?;
      let (add, remove) = flag_diff(email, edata, &tag_map, self.mdata.user_keywords);
      let uid = edata.uid;
      if !add.is_empty() {
        self
          .account
          .queue(format!("UID STORE {uid} +FLAGS.SILENT ({})", add.join(" ")).into_bytes());
      }
      if !remove.is_empty() {
        self
          .account
          .queue(format!("UID STORE {uid} -FLAGS.SILENT ({})", remove.join(" ")).into_bytes());
      }
      stored.push(id);
    }

    if !stored.is_empty() {
      // The queue drains in front of the next immediate command.
      self
        .account
        .exec(
          Some(&mut Selected {
            mdata: &mut self.mdata,
            emails: &mut self.mailbox.emails,
          }),
          Command::new(b"NOOP".to_vec()),
        )?
        .ensure_ok("NOOP")?;
      for id in stored {
        let email = &mut self.mailbox.emails[id];
        email.changed = false;
        let flags = email.flags;
        let tags = email.tags.clone();
        let edata = email.edata_mut()?;
        edata.server_flags = flags;
        edata.keywords = keyword_atoms(&tags, &tag_map);
        let uid = edata.uid;
        if let Some(hcache) = self.mdata.hcache.as_mut() {
          if let Err(error) =
            hcache.store(uid.to_string().as_bytes(), &self.mailbox.emails[id], self.mdata.uidvalidity)
          {
            log::debug!("couldn't recache uid {uid}: {error}");
          }
        }
      }
    }

    let mut status = MxStatus::Ok;
    if expunge
      && self
        .mailbox
        .emails
        .iter()
        .any(|email| email.active && email.flags.deleted)
    {
      self
        .account
        .exec(
          Some(&mut Selected {
            mdata: &mut self.mdata,
            emails: &mut self.mailbox.emails,
          }),
          Command::new(b"EXPUNGE".to_vec()),
        )?
        .ensure_ok("EXPUNGE")?;
      self.compact();
      self.mdata.reopen.expunge_pending = false;
      status = MxStatus::Reopened;
    }
    Ok(status)
  }

  // Download the body into the body cache and hand back a read handle; the envelope is upgraded
  // to the fully parsed header on the way.
  pub fn msg_open(&mut self, id: usize, peek: bool) -> anyhow::Result<Message> {
    anyhow::ensure!(
      id < self.mailbox.emails.len() && self.mailbox.emails[id].active,
      "no such message"
    );
    let path = sync::fetch_message(
      &mut self.account,
      &mut self.mdata,
      &mut self.mailbox.emails,
      id,
      peek,
    )?;
    let file = fs::File::open(&path)
      .with_context(|| format!("couldn't reopen cached body {path:?}"))?;
    Ok(Message { path, file })
  }

  // `+tag` adds, `-tag` removes, `!tag` toggles, bare adds. Mapped tag names flip the
  // corresponding flag bit instead of living in the tag list.
  pub fn tags_commit(&mut self, id: usize, edits: &str) -> anyhow::Result<()> {
    anyhow::ensure!(id < self.mailbox.emails.len(), "no such message");
    let tag_map = self.config.tag_map.clone();
    let email = &mut self.mailbox.emails[id];
    for edit in edits.split_ascii_whitespace() {
      let (operation, tag) = match edit.split_at(1) {
        ("+", tag) => ('+', tag),
        ("-", tag) => ('-', tag),
        ("!", tag) => ('!', tag),
        _ => ('+', edit),
      };
      if tag.is_empty() {
        continue;
      }
      let present = email.tags.iter().any(|existing| existing == tag);
      let add = match operation {
        '+' => true,
        '-' => false,
        _ => !present,
      };
      if add && !present {
        email.tags.push(tag.to_string());
      } else if !add && present {
        email.tags.retain(|existing| existing != tag);
      }
      if tag == tag_map.unread {
        email.flags.read = !add;
      } else if tag == tag_map.replied {
        email.flags.replied = add;
      } else if tag == tag_map.flagged {
        email.flags.flagged = add;
      }
    }
    email.changed = true;
    self.mailbox.recount();
    Ok(())
  }

  // UID COPY/MOVE of a set of messages; MOVE marks the sources deleted locally when the server
  // can't do it in one step.
  pub fn copy(
    &mut self,
    ids: &[usize],
    destination: &str,
    move_: bool,
  ) -> anyhow::Result<Completion> {
    let mut uids = Vec::new();
    for id in ids {
      uids.push(self.mailbox.emails[*id].edata()?.uid);
    }
    uids.sort_unstable();
    let mut set: Vec<crate::imap::Range> = Vec::new();
    for uid in uids {
      match set.last_mut() {
        Some(range) if range.1 + 1 == uid => range.1 = uid,
        Some(range) if range.1 == uid => (),
        _ => set.push(crate::imap::Range(uid, uid)),
      }
    }
    let munged = if self.account.utf8_enabled {
      destination.as_bytes().to_vec()
    } else {
      utf8_to_utf7(destination)
    };
    let completion = sync::copy(
      &mut self.account,
      &mut self.mdata,
      &mut self.mailbox.emails,
      &set,
      &munged,
      move_,
    )?;
    self.mailbox.recount();
    Ok(completion)
  }

  // Server-side APPEND of a message file, with the create-and-retry dialogue delegated to the
  // observer.
  pub fn append(
    &mut self,
    mailbox: &str,
    message: &[u8],
    flags: &str,
    received: Option<i64>,
    observer: &mut dyn Observer,
  ) -> anyhow::Result<()> {
    let munged = if self.account.utf8_enabled {
      mailbox.as_bytes().to_vec()
    } else {
      utf8_to_utf7(mailbox)
    };
    let completion = sync::append(&mut self.account, &munged, message, flags, received)?;
    if completion.ok() {
      return Ok(());
    }
    if completion.code == Some(Code::TryCreate) && observer.confirm_create(mailbox) {
      self
        .account
        .exec(
          None,
          Command::segments(crate::imap::command::splice_literal(
            b"CREATE ".to_vec(),
            &munged,
            Vec::new(),
            self.account.literal_plus(),
          )),
        )?
        .ensure_ok("CREATE")?;
      return sync::append(&mut self.account, &munged, message, flags, received)?
        .ensure_ok("APPEND")
        .map(|_| ());
    }
    anyhow::bail!("APPEND failed: {}", completion.text)
  }

  // Release the selection and the caches; the account survives for further mailboxes or LOGOUT.
  pub fn close(mut self) -> anyhow::Result<Account<RW>> {
    let completion = self.account.exec(
      Some(&mut Selected {
        mdata: &mut self.mdata,
        emails: &mut self.mailbox.emails,
      }),
      Command::new(b"CLOSE".to_vec()),
    );
    if let Err(error) = completion {
      log::debug!("CLOSE failed: {error}");
    }
    self.mdata.hcache = None;
    self.mdata.bcache = None;
    Ok(self.account)
  }
}

fn flag_atoms(flags: &email::Flags) -> Vec<&'static str> {
  let mut atoms = Vec::new();
  if flags.read {
    atoms.push("\\Seen");
  }
  if flags.flagged {
    atoms.push("\\Flagged");
  }
  if flags.replied {
    atoms.push("\\Answered");
  }
  if flags.deleted {
    atoms.push("\\Deleted");
  }
  if flags.draft {
    atoms.push("\\Draft");
  }
  atoms
}

fn keyword_atoms(tags: &[String], tag_map: &TagMap) -> Vec<String> {
  tags
    .iter()
    .filter(|tag| {
      **tag != tag_map.unread && **tag != tag_map.replied && **tag != tag_map.flagged
    })
    .cloned()
    .collect()
}

// What to +FLAGS and -FLAGS to move the server to the local state.
fn flag_diff(
  email: &email::Email,
  edata: &state::Edata,
  tag_map: &TagMap,
  user_keywords: bool,
) -> (Vec<String>, Vec<String>) {
  let current: Vec<String> = flag_atoms(&email.flags)
    .into_iter()
    .map(str::to_string)
    .collect();
  let server: Vec<String> = flag_atoms(&edata.server_flags)
    .into_iter()
    .map(str::to_string)
    .collect();
  let mut add: Vec<String> = current
    .iter()
    .filter(|atom| !server.contains(atom))
    .cloned()
    .collect();
  let mut remove: Vec<String> = server
    .iter()
    .filter(|atom| !current.contains(atom))
    .cloned()
    .collect();
  if user_keywords {
    let keywords = keyword_atoms(&email.tags, tag_map);
    for keyword in &keywords {
      if !edata.keywords.contains(keyword) {
        add.push(keyword.clone());
      }
    }
    for keyword in &edata.keywords {
      if !keywords.contains(keyword) {
        remove.push(keyword.clone());
      }
    }
  }
  (add, remove)
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  fn email_with_flags(read: bool, flagged: bool) -> email::Email {
    let mut email = email::Email::new(0);
    email.flags.read = read;
    email.flags.flagged = flagged;
    email.edata = Some(state::Edata::default());
    email
  }

  #[test]
  fn flag_diffs() {
    let mut email = email_with_flags(true, true);
    email.tags = vec!["work".to_string(), "unread".to_string()];
    let mut edata = state::Edata::default();
    edata.server_flags.deleted = true;
    edata.keywords = vec!["stale".to_string()];

    let (add, remove) = flag_diff(&email, &edata, &TagMap::default(), true);
    assert_eq!(
      vec![
        "\\Seen".to_string(),
        "\\Flagged".to_string(),
        "work".to_string()
      ],
      add
    );
    assert_eq!(
      vec!["\\Deleted".to_string(), "stale".to_string()],
      remove
    );

    // Without PERMANENTFLAGS \* the keywords stay local.
    let (add, _) = flag_diff(&email, &edata, &TagMap::default(), false);
    assert!(!add.contains(&"work".to_string()));
  }

  #[test]
  fn aggregates() {
    let mut mailbox = Mailbox::default();
    let mut first = email_with_flags(false, true);
    first.body.length = 100;
    first.env.message_id = Some("<1@x>".to_string());
    let mut second = email_with_flags(true, false);
    second.index = 1;
    second.body.length = 50;
    second.flags.deleted = true;
    let mut gone = email_with_flags(false, false);
    gone.index = 2;
    gone.active = false;
    mailbox.emails = vec![first, second, gone];
    mailbox.recount();
    mailbox.rebuild_indices();
    assert_eq!(
      Aggregates {
        count: 2,
        unread: 1,
        flagged: 1,
        deleted: 1,
        size: 150,
      },
      mailbox.aggregates
    );
    assert_eq!(Some(&0), mailbox.id_hash.get("<1@x>"));
  }
}
