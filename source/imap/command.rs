// Wire protocol loop: tag allocation, command submission, the step cycle that classifies one
// response line at a time, and the untagged dispatcher.
//
// https://www.rfc-editor.org/rfc/rfc3501#section-2.2.1
// The client command begins an operation. Each client command is prefixed with an identifier
// (typically a short alphanumeric string, e.g., A0001, A0002) called a "tag".

use super::{parser::response, state, Capabilities, Range, RespCode, State, StatusItem, Untagged};
use crate::{connection, email, Error, Interrupt};
use anyhow::Context as _;
use std::{io, time};

// https://www.rfc-editor.org/rfc/rfc2177#section-3
// The client MUST re-issue its IDLE (or otherwise touch the server) at least every 29 minutes;
// poll intervals are clamped against this.
pub const KEEPALIVE: time::Duration = time::Duration::from_secs(29 * 60);

// One FETCH response row, owned. A body that went to the caller's sink leaves `literal` empty
// and sets `streamed`.
#[derive(Debug, Default)]
pub struct FetchRow {
  pub msn: u32,
  pub uid: Option<u32>,
  pub flags: Option<Vec<Vec<u8>>>,
  pub internaldate: Option<String>,
  pub size: Option<u64>,
  pub modseq: Option<u64>,
  pub literal: Option<Vec<u8>>,
  pub streamed: bool,
}

// Owned subset of resp-text-codes that callers act on after completion.
#[derive(Debug, PartialEq)]
pub enum Code {
  TryCreate,
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
  ReadOnly,
}

#[derive(Debug)]
pub struct ListEntry {
  pub raw: Vec<u8>,
  // Demunged; None when the wire name wasn't valid modified UTF-7.
  pub name: Option<String>,
  pub delimiter: Option<char>,
  pub noselect: bool,
  pub subscribed: bool,
}

#[derive(Debug, Default)]
pub struct Completion {
  pub state: Option<State>,
  pub text: String,
  pub code: Option<Code>,
  pub lists: Vec<ListEntry>,
  pub statuses: Vec<(String, Vec<StatusItem>)>,
  pub bye: bool,
}

impl Completion {
  pub fn ok(&self) -> bool {
    self.state == Some(State::Ok)
  }

  // NO/BAD surfaced with the last human-readable phrase.
  pub fn ensure_ok(self, what: &str) -> anyhow::Result<Self> {
    anyhow::ensure!(self.ok(), "{what} failed: {}", self.text);
    Ok(self)
  }
}

// The selected-mailbox view a command executes against.
pub struct Selected<'a> {
  pub mdata: &'a mut state::MboxData,
  pub emails: &'a mut Vec<email::Email>,
}

pub struct Command<'a> {
  // Each segment is written in full; between segments the engine waits for a continuation
  // request. LITERAL+ commands are a single segment with `{n+}` inline.
  pub segments: Vec<Vec<u8>>,
  // Don't log the payload (credentials, message bodies).
  pub sensitive: bool,
  pub on_fetch: Option<&'a mut dyn FnMut(FetchRow) -> anyhow::Result<()>>,
  pub sink: Option<&'a mut dyn io::Write>,
  // Answers a server challenge once all segments went out (SASL).
  pub on_continue: Option<&'a mut dyn FnMut(&[u8]) -> anyhow::Result<Vec<u8>>>,
}

impl<'a> Command<'a> {
  pub fn new(text: Vec<u8>) -> Self {
    Self {
      segments: vec![text],
      sensitive: false,
      on_fetch: None,
      on_continue: None,
      sink: None,
    }
  }

  pub fn segments(segments: Vec<Vec<u8>>) -> Self {
    Self {
      segments,
      ..Self::new(Vec::new())
    }
  }

  pub fn sensitive(mut self) -> Self {
    self.sensitive = true;
    self
  }

  pub fn on_fetch(mut self, handler: &'a mut dyn FnMut(FetchRow) -> anyhow::Result<()>) -> Self {
    self.on_fetch = Some(handler);
    self
  }

  pub fn sink(mut self, sink: &'a mut dyn io::Write) -> Self {
    self.sink = Some(sink);
    self
  }

  pub fn on_continue(
    mut self,
    handler: &'a mut dyn FnMut(&[u8]) -> anyhow::Result<Vec<u8>>,
  ) -> Self {
    self.on_continue = Some(handler);
    self
  }
}

// Splice `bytes` into a command as an IMAP literal: inline with LITERAL+, as a separate segment
// behind a continuation otherwise. Segments never carry the final CRLF; the engine terminates
// the last one.
pub fn splice_literal(
  mut before: Vec<u8>,
  bytes: &[u8],
  after: Vec<u8>,
  literal_plus: bool,
) -> Vec<Vec<u8>> {
  if literal_plus {
    // https://www.rfc-editor.org/rfc/rfc7888
    before.extend_from_slice(format!("{{{}+}}\r\n", bytes.len()).as_bytes());
    before.extend_from_slice(bytes);
    before.extend_from_slice(&after);
    vec![before]
  } else {
    before.extend_from_slice(format!("{{{}}}\r\n", bytes.len()).as_bytes());
    let mut rest = bytes.to_vec();
    rest.extend_from_slice(&after);
    vec![before, rest]
  }
}

// Chain two literal splices (APPEND sends the mailbox and the payload).
pub fn join_segments(mut first: Vec<Vec<u8>>, second: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
  let mut second = second.into_iter();
  if let (Some(last), Some(head)) = (first.last_mut(), second.next()) {
    last.extend_from_slice(&head);
  }
  first.extend(second);
  first
}

pub struct Account<RW> {
  pub connection: connection::Connection<RW>,
  pub capabilities: Capabilities,
  pub qresync_enabled: bool,
  pub utf8_enabled: bool,
  // seen-but-unread tracking for freshly downloaded messages
  pub mark_old: bool,
  pub interrupt: Interrupt,
  seqno: u32,
  queue: Vec<Vec<u8>>,
  last_exchange: Option<time::Instant>,
}

impl<RW> Account<RW>
where
  RW: connection::ReadWrite,
{
  pub fn new(connection: connection::Connection<RW>, interrupt: Interrupt) -> Self {
    Self {
      connection,
      capabilities: Capabilities::default(),
      qresync_enabled: false,
      utf8_enabled: false,
      mark_old: false,
      interrupt,
      seqno: 0,
      queue: Vec::new(),
      last_exchange: None,
    }
  }

  pub fn literal_plus(&self) -> bool {
    self.capabilities.has("LITERAL+")
  }

  // When the connection last completed a command; callers pace their polls with this.
  pub fn last_exchange(&self) -> Option<time::Instant> {
    self.last_exchange
  }

  fn next_tag(&mut self) -> String {
    self.seqno = (self.seqno + 1) % 10_000;
    format!("a{:04}", self.seqno)
  }

  // https://www.rfc-editor.org/rfc/rfc3501#section-7.1.1
  // The greeting may carry the capabilities; ask explicitly when it doesn't.
  pub fn greeting(&mut self) -> anyhow::Result<()> {
    let line = self.connection.read_line()?;
    let (position, token) =
      response::start(&line).map_err(|_| protocol(&line, "malformed greeting"))?;
    anyhow::ensure!(token == b"*", "unexpected greeting tag");
    match response::untagged(&line[position..]) {
      Ok(Untagged::Cond(cond)) if cond.state == State::Ok => {
        if let Some(RespCode::Capability(capabilities)) = cond.code {
          self.capabilities.update(&capabilities);
        }
      }
      Ok(Untagged::Bye(text)) => {
        anyhow::bail!("server refused the connection: {}", String::from_utf8_lossy(text))
      }
      _ => anyhow::bail!("unexpected greeting: {}", connection::escape(&line)),
    }
    if self.capabilities.is_empty() {
      self
        .exec(None, Command::new(b"CAPABILITY".to_vec()))?
        .ensure_ok("CAPABILITY")?;
    }
    anyhow::ensure!(
      self.capabilities.has("IMAP4rev1"),
      "IMAP4rev1 is missing from CAPABILITY list"
    );
    Ok(())
  }

  // https://www.rfc-editor.org/rfc/rfc7162#section-3.2.3
  // A client making use of QRESYNC MUST issue "ENABLE QRESYNC" once it is authenticated.
  pub fn enable(&mut self) -> anyhow::Result<()> {
    if self.capabilities.has("ENABLE") && self.capabilities.has("QRESYNC") {
      self
        .exec(None, Command::new(b"ENABLE QRESYNC".to_vec()))?
        .ensure_ok("ENABLE")?;
    }
    if self.capabilities.has("ENABLE") && self.capabilities.has("UTF8=ACCEPT") {
      self
        .exec(None, Command::new(b"ENABLE UTF8=ACCEPT".to_vec()))?
        .ensure_ok("ENABLE")?;
    }
    Ok(())
  }

  // Enqueue without waiting; the next immediate command drains the queue first.
  pub fn queue(&mut self, text: Vec<u8>) {
    self.queue.push(text);
  }

  pub fn drain(&mut self, mut selected: Option<&mut Selected>) -> anyhow::Result<()> {
    while !self.queue.is_empty() {
      let text = self.queue.remove(0);
      let completion = self.step_command(selected.as_deref_mut(), Command::new(text))?;
      if !completion.ok() {
        log::warn!("queued command failed: {}", completion.text);
      }
    }
    Ok(())
  }

  pub fn exec(
    &mut self,
    mut selected: Option<&mut Selected>,
    command: Command,
  ) -> anyhow::Result<Completion> {
    self.drain(selected.as_deref_mut())?;
    self.step_command(selected, command)
  }

  fn step_command(
    &mut self,
    mut selected: Option<&mut Selected>,
    mut command: Command,
  ) -> anyhow::Result<Completion> {
    let tag = self.next_tag();
    let mut segments = std::mem::take(&mut command.segments).into_iter();
    let first = segments.next().context("empty command")?;
    let mut parts: Vec<&[u8]> = vec![tag.as_bytes(), b" ", &first];
    if segments.len() == 0 {
      parts.push(b"\r\n");
    }
    let log = if command.sensitive { 1 } else { parts.len() };
    self.connection.write(&parts, log)?;

    let mut completion = Completion::default();
    loop {
      let line = self.connection.read_line()?;
      let (position, token) =
        response::start(&line).map_err(|_| protocol(&line, "malformed response"))?;
      match token {
        b"+" => {
          if let Some(segment) = segments.next() {
            let mut parts: Vec<&[u8]> = vec![&segment];
            if segments.len() == 0 {
              parts.push(b"\r\n");
            }
            self
              .connection
              .write(&parts, if command.sensitive { 0 } else { parts.len() })?;
          } else if let Some(handler) = command.on_continue.as_mut() {
            let mut answer = handler(&line[position..])?;
            answer.extend_from_slice(b"\r\n");
            let parts: &[&[u8]] = &[&answer];
            self.connection.write(parts, 0)?;
          } else {
            return Err(protocol(&line, "unsolicited continuation request"));
          }
        }
        b"*" => {
          self.untagged(
            &line[position..],
            selected.as_deref_mut(),
            &mut completion,
            &mut command.on_fetch,
            &mut command.sink,
          )?;
        }
        token if token == tag.as_bytes() => {
          let cond = response::cond(&line[position..])
            .map_err(|_| protocol(&line, "malformed completion"))?;
          completion.state = Some(cond.state);
          completion.text = String::from_utf8_lossy(cond.text).into_owned();
          if cond.state != State::Ok {
            log::debug!("command {tag} failed: {}", connection::escape(&line));
          }
          self.apply_code(cond.code, selected.as_deref_mut(), &mut completion);
          self.last_exchange = Some(time::Instant::now());
          return Ok(completion);
        }
        token => {
          anyhow::bail!("unexpected tag {:?}", String::from_utf8_lossy(token))
        }
      }
    }
  }

  // Reassemble a response unit whose line ends in a literal marker: pull the octets and the
  // following line so the grammar sees one contiguous unit.
  fn assemble(&mut self, line: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut unit = line.to_vec();
    while let Ok((_, length)) = response::trailing_literal(&unit) {
      unit.extend_from_slice(b"\r\n");
      self.connection.read_literal(length as usize, &mut unit)?;
      let next = self.connection.read_line()?;
      unit.extend_from_slice(&next);
    }
    Ok(unit)
  }

  fn untagged(
    &mut self,
    rest: &[u8],
    mut selected: Option<&mut Selected>,
    completion: &mut Completion,
    on_fetch: &mut Option<&mut dyn FnMut(FetchRow) -> anyhow::Result<()>>,
    sink: &mut Option<&mut dyn io::Write>,
  ) -> anyhow::Result<()> {
    // FETCH attribute streams may carry a huge body literal: tokenise instead of assembling.
    if let Ok((attrs_start, msn)) = response::fetch_start(rest) {
      let row = self.fetch_row(rest, attrs_start, msn, sink)?;
      return match on_fetch.as_mut() {
        Some(handler) => handler(row),
        // Unsolicited FETCH: a server-driven flag change.
        None => self.fetch_flags_update(selected, row),
      };
    }

    let unit = self.assemble(rest)?;
    let parsed = match response::untagged(&unit) {
      Ok(parsed) => parsed,
      Err(_) => {
        // A client MUST be prepared to accept any server response at all times.
        log::debug!("ignoring untagged response: {}", connection::summarize(&unit));
        return Ok(());
      }
    };
    match parsed {
      Untagged::Exists(count) => {
        if let Some(selected) = selected {
          if count > selected.mdata.exists {
            selected.mdata.reopen.newmail_pending = true;
            selected.mdata.check.new_mail = true;
          }
          selected.mdata.exists = count;
        }
      }
      Untagged::Recent(count) => log::trace!("{count} recent"),
      Untagged::Expunge(msn) => {
        // https://www.rfc-editor.org/rfc/rfc7162#section-3.2.11
        // A server MUST NOT send EXPUNGE while a FETCH is in progress; the streaming FETCH path
        // above never lands here, so seeing one means the response interleaving is broken.
        anyhow::ensure!(
          on_fetch.is_none(),
          "EXPUNGE inside an in-flight FETCH"
        );
        if let Some(selected) = selected {
          selected.mdata.apply_expunge(selected.emails, msn);
          selected.mdata.reopen.expunge_pending = true;
        }
      }
      Untagged::Vanished { earlier, uids } => {
        anyhow::ensure!(
          earlier || on_fetch.is_none(),
          "VANISHED inside an in-flight FETCH"
        );
        if let Some(selected) = selected {
          selected.mdata.apply_vanished(selected.emails, &uids);
          if !earlier {
            selected.mdata.reopen.expunge_pending = true;
          }
        }
      }
      Untagged::Flags(flags) => log::trace!("mailbox flags: {flags:?}"),
      Untagged::Capability(capabilities) => self.capabilities.update(&capabilities),
      Untagged::Enabled(capabilities) => {
        for capability in capabilities {
          match capability {
            b"QRESYNC" => self.qresync_enabled = true,
            b"UTF8=ACCEPT" => self.utf8_enabled = true,
            _ => (),
          }
        }
      }
      Untagged::List {
        flags,
        delimiter,
        mailbox,
      } => completion.lists.push(list_entry(flags, delimiter, mailbox, false)),
      Untagged::Lsub {
        flags,
        delimiter,
        mailbox,
      } => completion.lists.push(list_entry(flags, delimiter, mailbox, true)),
      Untagged::Status { mailbox, items } => {
        let raw = mailbox.into_bytes();
        let name = super::utf7_to_utf8(&raw)
          .unwrap_or_else(|| String::from_utf8_lossy(&raw).into_owned());
        completion.statuses.push((name, items));
      }
      Untagged::Bye(text) => {
        log::info!("BYE: {}", String::from_utf8_lossy(text));
        completion.bye = true;
      }
      Untagged::Cond(cond) => {
        if cond.state != State::Ok {
          log::warn!(
            "{} {}",
            cond.state,
            String::from_utf8_lossy(cond.text)
          );
        }
        self.apply_code(cond.code, selected, completion);
      }
    }
    Ok(())
  }

  fn apply_code(
    &mut self,
    code: Option<RespCode>,
    selected: Option<&mut Selected>,
    completion: &mut Completion,
  ) {
    let Some(code) = code else {
      return;
    };
    match code {
      RespCode::Alert => log::warn!("server alert"),
      RespCode::Capability(capabilities) => self.capabilities.update(&capabilities),
      RespCode::UidValidity(value) => {
        if let Some(selected) = selected {
          selected.mdata.uidvalidity = value;
        }
      }
      RespCode::UidNext(value) => {
        if let Some(selected) = selected {
          selected.mdata.uidnext = value;
        }
      }
      RespCode::HighestModSeq(value) => {
        if let Some(selected) = selected {
          selected.mdata.modseq = value;
        }
      }
      // https://www.rfc-editor.org/rfc/rfc7162#section-3.1.2.2
      // NOMODSEQ: the mailbox doesn't persist mod-sequences.
      RespCode::NoModSeq => {
        if let Some(selected) = selected {
          selected.mdata.modseq = 0;
        }
      }
      RespCode::TryCreate => completion.code = Some(Code::TryCreate),
      RespCode::Closed => log::trace!("previously selected mailbox closed"),
      RespCode::ReadOnly => {
        if let Some(selected) = selected {
          selected.mdata.readonly = true;
        }
        completion.code = Some(Code::ReadOnly);
      }
      RespCode::ReadWrite => {
        if let Some(selected) = selected {
          selected.mdata.readonly = false;
        }
      }
      RespCode::PermanentFlags(flags) => {
        if let Some(selected) = selected {
          // The special flag \* indicates that new keywords can be created.
          selected.mdata.user_keywords = flags.contains(&&b"\\*"[..]);
        }
      }
      RespCode::AppendUid { uidvalidity, uid } => {
        completion.code = Some(Code::AppendUid { uidvalidity, uid })
      }
      RespCode::CopyUid {
        uidvalidity,
        from,
        to,
      } => {
        completion.code = Some(Code::CopyUid {
          uidvalidity,
          from,
          to,
        })
      }
      RespCode::Modified(set) => completion.code = Some(Code::Modified(set)),
      RespCode::Other(code) => log::trace!("ignoring response code {}", String::from_utf8_lossy(code)),
    }
  }

  // Tokenise one FETCH attribute stream. `line` is the first physical line; literals are drained
  // as they are announced, and the stream resumes on the following line.
  fn fetch_row(
    &mut self,
    line: &[u8],
    attrs_start: usize,
    msn: u32,
    sink: &mut Option<&mut dyn io::Write>,
  ) -> anyhow::Result<FetchRow> {
    let mut row = FetchRow {
      msn,
      ..FetchRow::default()
    };
    let mut current = line.to_vec();
    let mut position = attrs_start;
    loop {
      while current.get(position) == Some(&b' ') {
        position += 1;
      }
      if response::fetch_end(&current[position..]).is_ok() {
        break;
      }
      anyhow::ensure!(
        position < current.len(),
        "truncated FETCH attribute stream"
      );
      let (consumed, attr) = response::fetch_attr(&current[position..])
        .map_err(|_| protocol(&current[position..], "malformed FETCH attribute"))?;
      position += consumed;
      match attr {
        super::FetchAttr::Uid(uid) => row.uid = Some(uid),
        super::FetchAttr::Flags(flags) => {
          row.flags = Some(flags.into_iter().map(<[u8]>::to_vec).collect())
        }
        super::FetchAttr::InternalDate(date) => {
          row.internaldate = Some(String::from_utf8_lossy(&date).into_owned())
        }
        super::FetchAttr::Rfc822Size(size) => row.size = Some(size),
        super::FetchAttr::ModSeq(modseq) => row.modseq = Some(modseq),
        super::FetchAttr::BodyInline(bytes) => {
          row.literal = Some(bytes.map(|bytes| bytes.into_owned()).unwrap_or_default())
        }
        super::FetchAttr::BodyLiteral { length } => {
          match sink.as_mut() {
            Some(sink) => {
              self.connection.read_literal(length as usize, &mut **sink)?;
              row.streamed = true;
            }
            None => {
              let mut bytes = Vec::with_capacity(length as usize);
              self.connection.read_literal(length as usize, &mut bytes)?;
              row.literal = Some(bytes);
            }
          }
          current = self.connection.read_line()?;
          position = 0;
        }
        super::FetchAttr::Ignored => (),
      }
    }
    Ok(row)
  }

  // 4.7 reconciliation for a FETCH nobody asked for.
  fn fetch_flags_update(
    &mut self,
    selected: Option<&mut Selected>,
    row: FetchRow,
  ) -> anyhow::Result<()> {
    let Some(selected) = selected else {
      return Ok(());
    };
    let id = match row.uid.and_then(|uid| selected.mdata.uid_hash.get(&uid).copied()) {
      Some(id) => Some(id),
      None => selected.mdata.msn_get(row.msn as usize - 1),
    };
    let Some(id) = id else {
      log::debug!("flag update for unknown message (msn {})", row.msn);
      return Ok(());
    };
    let email = &mut selected.emails[id];
    if let Some(flags) = row.flags {
      state::reconcile_flags(email, state::parse_flags(&flags, self.mark_old))?;
      selected.mdata.check.flags_changed = true;
    }
    if let Some(modseq) = row.modseq {
      email.edata_mut()?.modseq = modseq;
    }
    Ok(())
  }
}

fn list_entry(
  flags: Vec<&[u8]>,
  delimiter: Option<u8>,
  mailbox: super::MailboxName,
  subscribed: bool,
) -> ListEntry {
  let raw = mailbox.into_bytes();
  ListEntry {
    name: super::utf7_to_utf8(&raw),
    raw,
    delimiter: delimiter.map(|d| d as char),
    // https://www.rfc-editor.org/rfc/rfc3501#section-7.2.2
    // \Noselect: it is not possible to use this name as a selectable mailbox.
    noselect: flags.contains(&&b"\\Noselect"[..]),
    subscribed,
  }
}

fn protocol(line: &[u8], what: &str) -> anyhow::Error {
  anyhow::Error::new(Error::Protocol).context(format!(
    "{what}: {}",
    connection::summarize(line)
  ))
}
