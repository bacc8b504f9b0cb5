// Header download strategies and message transfer. Given a selected mailbox the driver fills the
// email arena, consulting the header cache to avoid refetching known UIDs and CONDSTORE/QRESYNC
// to skip flag scans the server can prove unnecessary.
//
// https://www.rfc-editor.org/rfc/rfc4549 - Synchronization Operations for Disconnected Clients
// https://www.rfc-editor.org/rfc/rfc7162#section-3.1.2.1
// A disconnected client can use the value of HIGHESTMODSEQ to check if it has to refetch
// metadata from the server. If the UIDVALIDITY value has changed for the selected mailbox, the
// client MUST delete the cached value of HIGHESTMODSEQ.

use super::command::{splice_literal, Account, Code, Command, Completion, FetchRow, Selected};
use super::{format_sequence_set, state, Range};
use crate::{bcache, connection, date, email, hcache, Error, Observer};
use anyhow::Context as _;
use std::{fs, io::Write as _, path, str};

// BODY.PEEK[HEADER.FIELDS (...)] list for the initial download; everything else is fetched when
// the message is opened.
const HEADER_FIELDS: &str = "DATE FROM SENDER SUBJECT TO CC MESSAGE-ID REFERENCES CONTENT-TYPE \
                             CONTENT-DESCRIPTION IN-REPLY-TO REPLY-TO LINES LIST-POST \
                             LIST-SUBSCRIBE LIST-UNSUBSCRIBE X-LABEL X-ORIGINAL-TO";

// Keep FETCH sets well under the 8192-octet command line guidance.
const MAX_SET_LENGTH: usize = 500;

#[derive(Clone, Copy, Debug)]
pub struct FetchConfig {
  // Maximum new MSNs per FETCH; 0 means unbounded.
  pub chunk_size: u32,
}

impl Default for FetchConfig {
  fn default() -> Self {
    Self { chunk_size: 0 }
  }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Strategy {
  Qresync,
  Condstore,
  Evalhc,
  Full,
}

fn meta_u32(hcache: &hcache::HeaderCache, key: &[u8]) -> Option<u32> {
  str::from_utf8(&hcache.fetch_raw(key)?).ok()?.parse().ok()
}

fn meta_u64(hcache: &hcache::HeaderCache, key: &[u8]) -> Option<u64> {
  str::from_utf8(&hcache.fetch_raw(key)?).ok()?.parse().ok()
}

// "1:3,5" -> [1, 2, 3, 5]. The inverse of format_sequence_set, for /UIDSEQSET.
pub fn expand_sequence_set(input: &str) -> Vec<u32> {
  let mut uids = Vec::new();
  for part in input.split(',').filter(|part| !part.is_empty()) {
    match part.split_once(':') {
      Some((start, end)) => {
        if let (Ok(start), Ok(end)) = (start.parse::<u32>(), end.parse::<u32>()) {
          for uid in start.min(end)..=start.max(end) {
            uids.push(uid);
          }
        }
      }
      None => {
        if let Ok(uid) = part.parse() {
          uids.push(uid);
        }
      }
    }
  }
  uids
}

// UIDs in MSN order, coalesced. Stored under /UIDSEQSET so a later session can rebuild the MSN
// mapping without asking the server.
pub fn build_uid_seqset(mdata: &state::MboxData, emails: &[email::Email]) -> String {
  let mut ranges: Vec<Range> = Vec::new();
  for index in 0..mdata.msn_len() {
    let Some(id) = mdata.msn_get(index) else {
      continue;
    };
    let Some(edata) = emails[id].edata.as_ref() else {
      continue;
    };
    match ranges.last_mut() {
      Some(range) if range.1 + 1 == edata.uid => range.1 = edata.uid,
      _ => ranges.push(Range(edata.uid, edata.uid)),
    }
  }
  format_sequence_set(&ranges)
}

// Compact sequence set over the not-yet-populated MSNs of [begin, end], bounded by the chunk
// size and the textual length cap. Returns the set and the MSN to continue from.
fn next_missing_chunk(
  mdata: &state::MboxData,
  begin: u32,
  end: u32,
  chunk_size: u32,
) -> Option<(String, u32)> {
  let mut set = String::new();
  let mut count: u32 = 0;
  let mut run: Option<(u32, u32)> = None;
  let mut msn = begin;

  fn flush(set: &mut String, run: &mut Option<(u32, u32)>) {
    if let Some((start, stop)) = run.take() {
      if !set.is_empty() {
        set.push(',');
      }
      if start == stop {
        *set += &start.to_string();
      } else {
        *set += &format!("{start}:{stop}");
      }
    }
  }

  while msn <= end {
    let missing = msn >= 1 && mdata.msn_get(msn as usize - 1).is_none();
    if missing {
      match run.as_mut() {
        Some((_, stop)) => *stop = msn,
        None => {
          // Opening another run past the textual budget waits for the next chunk.
          if set.len() >= MAX_SET_LENGTH {
            break;
          }
          run = Some((msn, msn));
        }
      }
      count += 1;
      if chunk_size > 0 && count >= chunk_size {
        msn += 1;
        break;
      }
    } else {
      flush(&mut set, &mut run);
    }
    msn += 1;
  }
  flush(&mut set, &mut run);
  if set.is_empty() {
    None
  } else {
    Some((set, msn))
  }
}

// Plain SELECT; resynchronisation runs over UID FETCH afterwards so cached state is in place
// before any VANISHED can refer to it.
pub fn select<RW>(
  account: &mut Account<RW>,
  mdata: &mut state::MboxData,
  emails: &mut Vec<email::Email>,
) -> anyhow::Result<Completion>
where
  RW: connection::ReadWrite,
{
  let literal_plus = account.literal_plus();
  let munged = mdata.munged.clone();
  let segments = splice_literal(b"SELECT ".to_vec(), &munged, Vec::new(), literal_plus);
  account.exec(
    Some(&mut Selected { mdata, emails }),
    Command::segments(segments),
  )
}

fn install(
  mdata: &mut state::MboxData,
  emails: &mut Vec<email::Email>,
  mut email: email::Email,
  msn: u32,
  uid: u32,
) -> anyhow::Result<()> {
  anyhow::ensure!(
    mdata.msn_get(msn as usize - 1).is_none(),
    "MSN {msn} bound twice"
  );
  anyhow::ensure!(
    !mdata.uid_hash.contains_key(&uid),
    "UID {uid} bound twice"
  );
  let id = emails.len();
  email.index = id;
  {
    let edata = email.edata_mut()?;
    edata.msn = msn;
    edata.uid = uid;
  }
  mdata.msn_set(msn as usize - 1, id);
  mdata.uid_hash.insert(uid, id);
  if uid > mdata.maxuid {
    mdata.maxuid = uid;
  }
  emails.push(email);
  Ok(())
}

fn collect_rows<RW>(
  account: &mut Account<RW>,
  mdata: &mut state::MboxData,
  emails: &mut Vec<email::Email>,
  text: String,
) -> anyhow::Result<Vec<FetchRow>>
where
  RW: connection::ReadWrite,
{
  let mut rows = Vec::new();
  let mut handler = |row: FetchRow| -> anyhow::Result<()> {
    rows.push(row);
    Ok(())
  };
  account
    .exec(
      Some(&mut Selected { mdata, emails }),
      Command::new(text.into_bytes()).on_fetch(&mut handler),
    )?
    .ensure_ok("FETCH")?;
  Ok(rows)
}

// `UID FETCH 1:{uidnext-1} (UID [FLAGS])`: map every known UID onto its MSN, resurrecting
// envelopes from the header cache; misses stay as holes for the ranged fetch.
fn eval_cache<RW>(
  account: &mut Account<RW>,
  mdata: &mut state::MboxData,
  emails: &mut Vec<email::Email>,
  uidnext_hc: u32,
  with_flags: bool,
) -> anyhow::Result<()>
where
  RW: connection::ReadWrite,
{
  if uidnext_hc <= 1 {
    return Ok(());
  }
  let fields = if with_flags { "(UID FLAGS)" } else { "(UID)" };
  let rows = collect_rows(
    account,
    mdata,
    emails,
    format!("UID FETCH 1:{} {}", uidnext_hc - 1, fields),
  )?;
  let mark_old = account.mark_old;
  for row in rows {
    let Some(uid) = row.uid else {
      continue;
    };
    if row.msn as usize > mdata.msn_len().max(mdata.exists as usize)
      || mdata.msn_get(row.msn as usize - 1).is_some()
      || mdata.uid_hash.contains_key(&uid)
    {
      log::debug!("ignoring stray cache evaluation row (msn {} uid {uid})", row.msn);
      continue;
    }
    let record = mdata
      .hcache
      .as_ref()
      .and_then(|hcache| hcache.fetch(uid.to_string().as_bytes()));
    let Some(record) = record else {
      continue; // hole
    };
    if record.uidvalidity != mdata.uidvalidity {
      continue;
    }
    let mut email = record.into_email(0);
    if let Some(flags) = row.flags.as_ref() {
      state::reconcile_flags(&mut email, state::parse_flags(flags, mark_old))?;
    }
    if let Some(modseq) = row.modseq {
      email.edata_mut()?.modseq = modseq;
    }
    install(mdata, emails, email, row.msn, uid)?;
  }
  Ok(())
}

// The QRESYNC fast path: rebuild the whole MSN mapping from /UIDSEQSET without any UID FETCH.
fn install_seqset(
  mdata: &mut state::MboxData,
  emails: &mut Vec<email::Email>,
  seqset: &str,
) -> anyhow::Result<()> {
  for (index, uid) in expand_sequence_set(seqset).into_iter().enumerate() {
    let msn = index as u32 + 1;
    if msn > mdata.exists {
      break;
    }
    let record = mdata
      .hcache
      .as_ref()
      .and_then(|hcache| hcache.fetch(uid.to_string().as_bytes()));
    let Some(record) = record else {
      continue;
    };
    if record.uidvalidity != mdata.uidvalidity || mdata.uid_hash.contains_key(&uid) {
      continue;
    }
    install(mdata, emails, record.into_email(0), msn, uid)?;
  }
  Ok(())
}

// `UID FETCH 1:{uidnext-1} (FLAGS) (CHANGEDSINCE {modseq} [VANISHED])`: flag changes and (under
// QRESYNC) expunges since the cached HIGHESTMODSEQ. Returns false when a row's MSN disagrees
// with the cached mapping, i.e. the replayed index cannot be trusted.
fn fetch_updates<RW>(
  account: &mut Account<RW>,
  mdata: &mut state::MboxData,
  emails: &mut Vec<email::Email>,
  uidnext_hc: u32,
  modseq_hc: u64,
  vanished: bool,
) -> anyhow::Result<bool>
where
  RW: connection::ReadWrite,
{
  if uidnext_hc <= 1 {
    return Ok(true);
  }
  let rows = collect_rows(
    account,
    mdata,
    emails,
    format!(
      "UID FETCH 1:{} (FLAGS) (CHANGEDSINCE {modseq_hc}{})",
      uidnext_hc - 1,
      if vanished { " VANISHED" } else { "" }
    ),
  )?;
  let mark_old = account.mark_old;
  let mut consistent = true;
  for row in rows {
    let Some(id) = row
      .uid
      .and_then(|uid| mdata.uid_hash.get(&uid).copied())
    else {
      continue;
    };
    let email = &mut emails[id];
    if let Some(edata) = email.edata.as_ref() {
      if edata.msn != row.msn {
        log::debug!(
          "server places uid {} at msn {}, cache said {}",
          edata.uid,
          row.msn,
          edata.msn
        );
        consistent = false;
      }
    }
    if let Some(flags) = row.flags.as_ref() {
      state::reconcile_flags(email, state::parse_flags(flags, mark_old))?;
    }
    if let Some(modseq) = row.modseq {
      email.edata_mut()?.modseq = modseq;
    }
  }
  Ok(consistent)
}

fn pause_point<RW>(
  account: &mut Account<RW>,
  observer: &mut dyn Observer,
) -> anyhow::Result<()>
where
  RW: connection::ReadWrite,
{
  if account.interrupt.pending() {
    if observer.confirm_abort() {
      return Err(anyhow::Error::new(Error::Interrupted));
    }
    account.interrupt.clear();
  }
  Ok(())
}

// Populate [msn_begin, msn_end] of the selected mailbox. `initial` enables the header-cache fast
// paths; subsequent new-mail passes go straight to the ranged fetch.
pub fn fetch_headers<RW>(
  account: &mut Account<RW>,
  mdata: &mut state::MboxData,
  emails: &mut Vec<email::Email>,
  msn_begin: u32,
  msn_end: u32,
  initial: bool,
  config: &FetchConfig,
  observer: &mut dyn Observer,
) -> anyhow::Result<()>
where
  RW: connection::ReadWrite,
{
  mdata.reserve(msn_end as usize);

  let (uidvalidity_hc, uidnext_hc, modseq_hc, seqset_hc) = match mdata.hcache.as_ref() {
    Some(hcache) => (
      meta_u32(hcache, hcache::UIDVALIDITY),
      meta_u32(hcache, hcache::UIDNEXT),
      meta_u64(hcache, hcache::MODSEQ),
      hcache
        .fetch_raw(hcache::UIDSEQSET)
        .and_then(|bytes| String::from_utf8(bytes).ok()),
    ),
    None => (None, None, None, None),
  };

  let evalhc = initial
    && mdata.uidvalidity != 0
    && uidvalidity_hc == Some(mdata.uidvalidity)
    && uidnext_hc.is_some();
  let mut strategy = if !evalhc {
    Strategy::Full
  } else if account.qresync_enabled
    && mdata.modseq > 0
    && modseq_hc.is_some()
    && seqset_hc.is_some()
  {
    Strategy::Qresync
  } else if account.capabilities.has("CONDSTORE") && mdata.modseq > 0 && modseq_hc.is_some() {
    Strategy::Condstore
  } else {
    Strategy::Evalhc
  };
  log::debug!(
    "downloading headers for {} (msn {msn_begin}:{msn_end}, {strategy:?})",
    mdata.name
  );

  if strategy == Strategy::Qresync {
    install_seqset(mdata, emails, seqset_hc.as_deref().unwrap_or_default())?;
    let consistent = fetch_updates(
      account,
      mdata,
      emails,
      uidnext_hc.unwrap_or(1),
      modseq_hc.unwrap_or(0),
      true,
    )?;
    if !consistent || !mdata.verify(emails) {
      // The cached mapping lied; drop it wholesale and walk the ordinary cache path.
      log::warn!("cached UID mapping for {} is inconsistent, refetching", mdata.name);
      emails.clear();
      mdata.clear_indices();
      mdata.maxuid = 0;
      mdata.reserve(msn_end as usize);
      if let Some(hcache) = mdata.hcache.as_mut() {
        hcache.delete(hcache::MODSEQ)?;
        hcache.delete(hcache::UIDSEQSET)?;
      }
      strategy = Strategy::Evalhc;
    }
  }

  match strategy {
    Strategy::Evalhc => eval_cache(account, mdata, emails, uidnext_hc.unwrap_or(1), true)?,
    Strategy::Condstore => {
      eval_cache(account, mdata, emails, uidnext_hc.unwrap_or(1), false)?;
      fetch_updates(
        account,
        mdata,
        emails,
        uidnext_hc.unwrap_or(1),
        modseq_hc.unwrap_or(0),
        false,
      )?;
    }
    Strategy::Qresync | Strategy::Full => (),
  }

  // Ranged download of whatever is still missing.
  let total = msn_end.saturating_sub(msn_begin) + 1;
  let mut from = msn_begin;
  while let Some((set, next)) = next_missing_chunk(mdata, from, msn_end, config.chunk_size) {
    pause_point(account, observer)?;
    observer.progress(
      "fetching message headers",
      from.saturating_sub(msn_begin) as usize,
      total as usize,
    );
    let rows = collect_rows(
      account,
      mdata,
      emails,
      format!("FETCH {set} (UID FLAGS INTERNALDATE RFC822.SIZE BODY.PEEK[HEADER.FIELDS ({HEADER_FIELDS})])"),
    )?;
    let mark_old = account.mark_old;
    for row in rows {
      let Some(uid) = row.uid else {
        log::debug!("FETCH row without UID (msn {})", row.msn);
        continue;
      };
      // Duplicates and out-of-range rows are dropped, not fatal.
      if row.msn < msn_begin
        || row.msn > msn_end
        || mdata.msn_get(row.msn as usize - 1).is_some()
        || mdata.uid_hash.contains_key(&uid)
      {
        log::debug!("ignoring duplicate FETCH row (msn {} uid {uid})", row.msn);
        continue;
      }
      let mut email = email::Email::new(0);
      email.edata = Some(state::Edata::default());
      if let Some(literal) = row.literal.as_ref() {
        email.env = email::Envelope::from_headers(literal)?;
      }
      if let Some(date) = row.internaldate.as_ref() {
        if let Some((epoch, _)) = date::parse_internaldate(date) {
          email.received = epoch;
        }
      }
      if let Some(size) = row.size {
        email.body.length = size;
      }
      let parsed = state::parse_flags(row.flags.as_deref().unwrap_or(&[]), mark_old);
      email.edata_mut()?.server_flags = parsed.flags;
      email.flags = parsed.flags;
      email.edata_mut()?.keywords = parsed.keywords;
      email.edata_mut()?.system_keywords = parsed.system_keywords;
      if let Some(modseq) = row.modseq {
        email.edata_mut()?.modseq = modseq;
      }
      install(mdata, emails, email, row.msn, uid)?;
      if let (Some(hcache), Some(id)) = (
        mdata.hcache.as_mut(),
        mdata.uid_hash.get(&uid).copied(),
      ) {
        // Cache errors are recovered locally, never surfaced.
        if let Err(error) =
          hcache.store(uid.to_string().as_bytes(), &emails[id], mdata.uidvalidity)
        {
          log::debug!("couldn't cache headers for uid {uid}: {error}");
        }
      }
    }
    from = next;
  }
  observer.progress("fetching message headers", total as usize, total as usize);

  finalize_meta(account, mdata, emails)?;
  Ok(())
}

// Write back the mailbox meta keys after a successful pass.
fn finalize_meta<RW>(
  account: &Account<RW>,
  mdata: &mut state::MboxData,
  emails: &[email::Email],
) -> anyhow::Result<()>
where
  RW: connection::ReadWrite,
{
  let uidnext = mdata.uidnext.max(mdata.maxuid + 1);
  let modseq = mdata.modseq;
  let condstore = account.capabilities.has("CONDSTORE") || account.qresync_enabled;
  let seqset = if account.qresync_enabled {
    Some(build_uid_seqset(mdata, emails))
  } else {
    None
  };
  let uidvalidity = mdata.uidvalidity;
  let Some(hcache) = mdata.hcache.as_mut() else {
    return Ok(());
  };
  hcache.store_raw(hcache::UIDVALIDITY, uidvalidity.to_string().as_bytes())?;
  hcache.store_raw(hcache::UIDNEXT, uidnext.to_string().as_bytes())?;
  if condstore && modseq > 0 {
    hcache.store_raw(hcache::MODSEQ, modseq.to_string().as_bytes())?;
  } else {
    hcache.delete(hcache::MODSEQ)?;
  }
  match seqset {
    Some(seqset) => hcache.store_raw(hcache::UIDSEQSET, seqset.as_bytes())?,
    None => hcache.delete(hcache::UIDSEQSET)?,
  }
  Ok(())
}

// Download one message body through the body cache, then re-read the full header (the initial
// pass only had a subset of fields).
pub fn fetch_message<RW>(
  account: &mut Account<RW>,
  mdata: &mut state::MboxData,
  emails: &mut Vec<email::Email>,
  id: usize,
  peek: bool,
) -> anyhow::Result<path::PathBuf>
where
  RW: connection::ReadWrite,
{
  let uid = emails[id].edata()?.uid;
  let key = bcache::key(mdata.uidvalidity, uid);
  let cached = mdata
    .bcache
    .as_ref()
    .context("body cache not open")?
    .exists(&key);

  if !cached {
    let mut writer = mdata.bcache.as_ref().context("body cache not open")?.put(&key)?;
    let mut rows: Vec<FetchRow> = Vec::new();
    {
      let mut handler = |row: FetchRow| -> anyhow::Result<()> {
        rows.push(row);
        Ok(())
      };
      // https://www.rfc-editor.org/rfc/rfc3501#section-6.4.5
      // BODY.PEEK[<section>] does not implicitly set \Seen.
      let text = format!(
        "UID FETCH {uid} (BODY{}[])",
        if peek { ".PEEK" } else { "" }
      );
      let completion = account.exec(
        Some(&mut Selected { mdata, emails }),
        Command::new(text.into_bytes())
          .on_fetch(&mut handler)
          .sink(&mut writer),
      )?;
      if !completion.ok() {
        writer.abandon();
        anyhow::bail!("UID FETCH failed: {}", completion.text);
      }
    }
    let row = rows
      .iter()
      .find(|row| row.uid == Some(uid) && (row.streamed || row.literal.is_some()));
    let Some(row) = row else {
      writer.abandon();
      anyhow::bail!("BODY missing from FETCH for uid {uid}");
    };
    if let Some(literal) = row.literal.as_ref() {
      // The server answered with a quoted string or another row grabbed the sink first.
      writer.write_all(literal)?;
    }
    writer.commit()?;
    // Trailing FLAGS on the same FETCH are reconciled like any other update.
    if let Some(flags) = row.flags.as_ref() {
      state::reconcile_flags(&mut emails[id], state::parse_flags(flags, account.mark_old))?;
    }
  }

  let path = mdata.bcache.as_ref().context("body cache not open")?.path(&key);
  let bytes = fs::read(&path)?;
  let (headers, offset) = mailparse::parse_headers(&bytes)?;
  emails[id].env = email::Envelope::from_headers(&bytes)?;
  emails[id].body.offset = offset as u64;
  emails[id].body.length = (bytes.len() - offset) as u64;
  // Reconcile the Status header's read bit with what we believe.
  use mailparse::MailHeaderMap as _;
  if let Some(status) = headers.get_first_value("Status") {
    if status.contains('R') && !emails[id].changed {
      emails[id].flags.read = true;
    }
  }
  emails[id].edata_mut()?.parsed = true;
  Ok(path)
}

// Bare LFs become CRLFs; pass 1 counts so the literal length is exact before any byte is sent.
pub fn crlf_rewrite(message: &[u8]) -> Vec<u8> {
  let mut extra = 0;
  let mut previous = 0u8;
  for byte in message {
    if *byte == b'\n' && previous != b'\r' {
      extra += 1;
    }
    previous = *byte;
  }
  let mut output = Vec::with_capacity(message.len() + extra);
  let mut previous = 0u8;
  for byte in message {
    if *byte == b'\n' && previous != b'\r' {
      output.push(b'\r');
    }
    output.push(*byte);
    previous = *byte;
  }
  output
}

// https://www.rfc-editor.org/rfc/rfc3501#section-6.3.11
// APPEND; the TRYCREATE dialogue is the caller's business, the completion carries the code.
pub fn append<RW>(
  account: &mut Account<RW>,
  mailbox_munged: &[u8],
  message: &[u8],
  flags: &str,
  received: Option<i64>,
) -> anyhow::Result<Completion>
where
  RW: connection::ReadWrite,
{
  let payload = crlf_rewrite(message);
  let mut middle = format!(" ({flags}) ").into_bytes();
  if let Some(received) = received {
    middle.extend_from_slice(
      format!(
        "\"{}\" ",
        date::format_internaldate(received, &date::Zone::default())
      )
      .as_bytes(),
    );
  }
  let literal_plus = account.literal_plus();
  let segments = super::command::join_segments(
    splice_literal(b"APPEND ".to_vec(), mailbox_munged, middle, literal_plus),
    splice_literal(Vec::new(), &payload, Vec::new(), literal_plus),
  );
  account.exec(None, Command::segments(segments).sensitive())
}

// UID COPY / UID MOVE with one create-and-retry on TRYCREATE. Without server-side MOVE the
// sources are marked deleted locally and the STORE is queued for the next sync.
pub fn copy<RW>(
  account: &mut Account<RW>,
  mdata: &mut state::MboxData,
  emails: &mut Vec<email::Email>,
  set: &[Range],
  destination_munged: &[u8],
  move_: bool,
) -> anyhow::Result<Completion>
where
  RW: connection::ReadWrite,
{
  let server_move = move_ && account.capabilities.has("MOVE");
  let set_string = format_sequence_set(set);
  let literal_plus = account.literal_plus();
  let verb: &[u8] = if server_move {
    b"UID MOVE "
  } else {
    b"UID COPY "
  };
  let make = |literal_plus: bool| {
    let mut before = verb.to_vec();
    before.extend_from_slice(set_string.as_bytes());
    before.push(b' ');
    splice_literal(before, destination_munged, Vec::new(), literal_plus)
  };

  let mut completion = account.exec(
    Some(&mut Selected { mdata, emails }),
    Command::segments(make(literal_plus)),
  )?;
  if completion.code == Some(Code::TryCreate) {
    log::info!("destination is missing, creating it");
    account
      .exec(
        None,
        Command::segments(splice_literal(
          b"CREATE ".to_vec(),
          destination_munged,
          Vec::new(),
          literal_plus,
        )),
      )?
      .ensure_ok("CREATE")?;
    completion = account.exec(
      Some(&mut Selected { mdata, emails }),
      Command::segments(make(literal_plus)),
    )?;
  }

  if move_ && !server_move && completion.ok() {
    account.queue(format!("UID STORE {set_string} +FLAGS.SILENT (\\Deleted)").into_bytes());
    for email in emails.iter_mut() {
      let Some(edata) = email.edata.as_ref() else {
        continue;
      };
      if set.iter().any(|range| range.contains(edata.uid)) {
        email.flags.deleted = true;
        email.changed = true;
      }
    }
  }
  Ok(completion)
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  #[test]
  fn sequence_set_roundtrip() {
    assert_eq!(vec![1, 2, 3, 5], expand_sequence_set("1:3,5"));
    assert_eq!(vec![2, 3, 4], expand_sequence_set("4:2"));
    assert_eq!(Vec::<u32>::new(), expand_sequence_set(""));
  }

  #[test]
  fn missing_chunks() {
    let mut mdata = state::MboxData::new("INBOX", b"INBOX".to_vec());
    mdata.reserve(10);
    // MSNs 2 and 5 already populated.
    mdata.msn_set(1, 0);
    mdata.msn_set(4, 1);

    let (set, next) = next_missing_chunk(&mdata, 1, 10, 0).unwrap();
    assert_eq!("1,3:4,6:10", set);
    assert_eq!(11, next);

    // Chunked: at most three new MSNs per set.
    let (set, next) = next_missing_chunk(&mdata, 1, 10, 3).unwrap();
    assert_eq!("1,3:4", set);
    let (set, next) = next_missing_chunk(&mdata, next, 10, 3).unwrap();
    assert_eq!("6:8", set);
    let (set, next) = next_missing_chunk(&mdata, next, 10, 3).unwrap();
    assert_eq!("9:10", set);
    assert_eq!(None, next_missing_chunk(&mdata, next, 10, 3));
  }

  #[test]
  fn chunk_textual_budget() {
    let mut mdata = state::MboxData::new("INBOX", b"INBOX".to_vec());
    let end = 4000;
    mdata.reserve(end);
    // Alternate populated/missing so every missing MSN costs a separate token.
    for index in (0..end).step_by(2) {
      mdata.msn_set(index, index);
    }
    let (set, next) = next_missing_chunk(&mdata, 1, end as u32, 0).unwrap();
    assert!(set.len() <= MAX_SET_LENGTH + 12, "{}", set.len());
    assert!(next < end as u32);
    // The next chunk continues where this one stopped.
    let (set2, _) = next_missing_chunk(&mdata, next, end as u32, 0).unwrap();
    assert!(!set2.is_empty());
    assert!(set2 != set);
  }

  #[test]
  fn uid_seqset_coalesces() {
    let mut mdata = state::MboxData::new("INBOX", b"INBOX".to_vec());
    let mut emails = Vec::new();
    for (index, uid) in [10u32, 11, 12, 20].iter().enumerate() {
      let mut email = email::Email::new(index);
      email.edata = Some(state::Edata {
        uid: *uid,
        msn: index as u32 + 1,
        ..state::Edata::default()
      });
      mdata.msn_set(index, index);
      mdata.uid_hash.insert(*uid, index);
      emails.push(email);
    }
    assert_eq!("10:12,20", build_uid_seqset(&mdata, &emails));
  }

  #[test]
  fn crlf_rewrite_exact() {
    let input = b"line one\nline two\r\nline three\n";
    let output = crlf_rewrite(input);
    assert_eq!(b"line one\r\nline two\r\nline three\r\n".to_vec(), output);
    // Pass 1's count matches pass 2's stream length.
    let bare = input
      .iter()
      .enumerate()
      .filter(|(i, byte)| **byte == b'\n' && (*i == 0 || input[i - 1] != b'\r'))
      .count();
    assert_eq!(input.len() + bare, output.len());
    // Already-normalised input is untouched.
    assert_eq!(output, crlf_rewrite(&output));
  }
}
