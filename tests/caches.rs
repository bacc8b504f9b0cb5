// Header-cache fast paths, QRESYNC replay, and the body cache, each across two or more
// connections against the scripted server.

mod common;

use common::server;
use pretty_assertions::assert_eq;
use std::io::Read as _;
use tern::mailbox::{self, OpenConfig};
use tern::{bcache, hcache, Silent};
use test_log::test;

fn config(root: &std::path::Path) -> OpenConfig {
  OpenConfig {
    headers_cache: Some(root.join("headers")),
    bodies_cache: Some(root.join("bodies")),
    account_id: "user@test".to_string(),
    ..OpenConfig::default()
  }
}

// First connection: cold open of two messages, caches filled.
fn cold_open_steps() -> Vec<server::Step> {
  let mut steps = common::login_steps();
  steps.push(common::list_step());
  steps.push(common::select_steps(2, 7, 100, 5));
  let rows = [
    common::header_row(
      1,
      10,
      r"\Seen",
      "14-Jan-2024 10:00:00 +0000",
      100,
      &common::headers("first", "m1@example.net"),
    ),
    common::header_row(
      2,
      11,
      "",
      "14-Jan-2024 11:00:00 +0000",
      200,
      &common::headers("second", "m2@example.net"),
    ),
  ];
  steps.push(server::step("FETCH 1:2", &[rows[0].as_str(), rows[1].as_str()], "OK done"));
  steps
}

fn open_mailbox(
  port: u16,
  root: &std::path::Path,
) -> anyhow::Result<mailbox::ImapMailbox<std::net::TcpStream>> {
  let mut account = common::connect(port);
  account.greeting()?;
  mailbox::login(&mut account, &common::credentials())?;
  mailbox::open(account, "INBOX", config(root), &mut Silent)
}

#[test]
fn warm_open_replays_the_cache() -> anyhow::Result<()> {
  let root = tempfile::tempdir()?;

  let fake = server::spawn(common::GREETING, cold_open_steps());
  let open = open_mailbox(fake.port, root.path())?;
  assert_eq!(2, open.mailbox.aggregates.count);
  drop(open);
  fake.finish()?;

  // Second connection: the mapping replays from /UIDSEQSET, the envelopes from the cache, and
  // the only round trip is the CHANGEDSINCE poll.
  let mut steps = common::login_steps();
  steps.push(common::list_step());
  steps.push(common::select_steps(2, 7, 100, 5));
  steps.push(server::step("CHANGEDSINCE 5 VANISHED", &[], "OK done"));
  let fake = server::spawn(common::GREETING, steps);
  let open = open_mailbox(fake.port, root.path())?;

  assert_eq!(2, open.mailbox.aggregates.count);
  let first = &open.mailbox.emails[open.mdata.uid_hash[&10]];
  assert_eq!(Some("first".to_string()), first.env.subject);
  assert!(first.flags.read);
  assert_eq!(1, first.edata()?.msn);
  assert_eq!(
    Some("second".to_string()),
    open.mailbox.emails[open.mdata.uid_hash[&11]].env.subject
  );
  assert!(open.mdata.verify(&open.mailbox.emails));

  drop(open);
  fake.finish()?;
  Ok(())
}

#[test]
fn inconsistent_replay_falls_back() -> anyhow::Result<()> {
  let root = tempfile::tempdir()?;

  let fake = server::spawn(common::GREETING, cold_open_steps());
  drop(open_mailbox(fake.port, root.path())?);
  fake.finish()?;

  // Corrupt the cached mapping: swap the UID order.
  {
    let mut cache = hcache::HeaderCache::open(&root.path().join("headers"), "INBOX", None)?;
    cache.store_raw(hcache::UIDSEQSET, b"11,10")?;
  }

  // The CHANGEDSINCE poll exposes the lie (uid 10 really sits at MSN 1); the driver clears the
  // replayed state and walks the ordinary cache-evaluation path.
  let mut steps = common::login_steps();
  steps.push(common::list_step());
  steps.push(common::select_steps(2, 7, 100, 5));
  steps.push(server::step(
    "CHANGEDSINCE 5 VANISHED",
    &[r"* 1 FETCH (UID 10 FLAGS (\Seen) MODSEQ (6))"],
    "OK done",
  ));
  steps.push(server::step(
    "UID FETCH 1:99 (UID FLAGS)",
    &[
      r"* 1 FETCH (UID 10 FLAGS (\Seen))",
      r"* 2 FETCH (UID 11 FLAGS ())",
    ],
    "OK done",
  ));
  let fake = server::spawn(common::GREETING, steps);
  let open = open_mailbox(fake.port, root.path())?;

  assert_eq!(2, open.mailbox.aggregates.count);
  let first = &open.mailbox.emails[open.mdata.uid_hash[&10]];
  assert_eq!(1, first.edata()?.msn);
  assert!(first.flags.read);
  assert_eq!(Some("first".to_string()), first.env.subject);
  assert_eq!(2, open.mailbox.emails[open.mdata.uid_hash[&11]].edata()?.msn);
  assert!(open.mdata.verify(&open.mailbox.emails));

  drop(open);
  fake.finish()?;
  Ok(())
}

#[test]
fn message_bodies_land_in_the_cache() -> anyhow::Result<()> {
  let root = tempfile::tempdir()?;

  let mut steps = common::login_steps();
  steps.push(common::list_step());
  steps.push(common::select_steps(1, 7, 100, 5));
  let row = common::header_row(
    1,
    42,
    "",
    "15-Jan-2024 09:07:42 +0000",
    100,
    &common::headers("partial", "m@example.net"),
  );
  steps.push(server::step("FETCH 1:1", &[row.as_str()], "OK done"));
  let message = "Subject: full\r\nStatus: RO\r\nDate: Mon, 15 Jan 2024 09:07:42 +0000\r\n\r\nthe body\r\n";
  let body_row = format!(
    "* 1 FETCH (UID 42 BODY[] {{{}}}\r\n{message} FLAGS (\\Seen))",
    message.len()
  );
  steps.push(server::step(
    "UID FETCH 42 (BODY.PEEK[])",
    &[body_row.as_str()],
    "OK done",
  ));
  let fake = server::spawn(common::GREETING, steps);

  let mut open = open_mailbox(fake.port, root.path())?;
  assert_eq!(Some("partial".to_string()), open.mailbox.emails[0].env.subject);
  assert!(!open.mailbox.emails[0].edata()?.parsed);

  let mut opened = open.msg_open(0, true)?;
  let mut content = String::new();
  opened.file.read_to_string(&mut content)?;
  assert_eq!(message, content);
  mailbox::msg_close(opened);

  // The second pass upgraded the envelope and reconciled the read bit.
  let email = &open.mailbox.emails[0];
  assert_eq!(Some("full".to_string()), email.env.subject);
  assert!(email.flags.read);
  assert!(email.edata()?.parsed);
  let header_length = message.find("\r\n\r\n").unwrap() + 4;
  assert_eq!(header_length as u64, email.body.offset);
  assert_eq!((message.len() - header_length) as u64, email.body.length);

  // A second open is served from the cache, no round trip.
  let opened = open.msg_open(0, true)?;
  mailbox::msg_close(opened);

  drop(open);
  fake.finish()?;
  Ok(())
}

#[test]
fn uidvalidity_change_sweeps_the_caches() -> anyhow::Result<()> {
  let root = tempfile::tempdir()?;

  let mut steps = common::login_steps();
  steps.push(common::list_step());
  steps.push(common::select_steps(1, 7, 100, 5));
  let row = common::header_row(
    1,
    42,
    "",
    "15-Jan-2024 09:07:42 +0000",
    100,
    &common::headers("old epoch", "m@example.net"),
  );
  steps.push(server::step("FETCH 1:1", &[row.as_str()], "OK done"));
  let message = "Subject: old epoch\r\n\r\nbody\r\n";
  let body_row = format!(
    "* 1 FETCH (UID 42 BODY[] {{{}}}\r\n{message})",
    message.len()
  );
  steps.push(server::step(
    "UID FETCH 42 (BODY.PEEK[])",
    &[body_row.as_str()],
    "OK done",
  ));
  let fake = server::spawn(common::GREETING, steps);
  let mut open = open_mailbox(fake.port, root.path())?;
  mailbox::msg_close(open.msg_open(0, true)?);
  drop(open);
  fake.finish()?;

  let bodies = bcache::BodyCache::open(&root.path().join("bodies"), "user@test", "INBOX")?;
  assert!(bodies.get(&bcache::key(7, 42)).is_some());

  // The server restarted with a new UIDVALIDITY; everything cached under the old epoch must go.
  let mut steps = common::login_steps();
  steps.push(common::list_step());
  steps.push(common::select_steps(1, 8, 2, 5));
  let row = common::header_row(
    1,
    1,
    "",
    "16-Jan-2024 09:07:42 +0000",
    100,
    &common::headers("new epoch", "n@example.net"),
  );
  steps.push(server::step("FETCH 1:1", &[row.as_str()], "OK done"));
  let fake = server::spawn(common::GREETING, steps);
  let open = open_mailbox(fake.port, root.path())?;

  assert_eq!(8, open.mdata.uidvalidity);
  assert!(!open.mdata.uid_hash.contains_key(&42));
  assert_eq!(
    Some("new epoch".to_string()),
    open.mailbox.emails[0].env.subject
  );
  // No key from the old epoch survives the sweep.
  assert!(bodies.get(&bcache::key(7, 42)).is_none());

  drop(open);
  fake.finish()?;
  Ok(())
}
