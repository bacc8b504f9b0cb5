// https://www.rfc-editor.org/rfc/rfc3501 - IMAP4rev1
// https://www.rfc-editor.org/rfc/rfc2047 - MIME Part Three: Message Header Extensions
// https://www.rfc-editor.org/rfc/rfc7162 - [...] Quick Mailbox Resynchronization (QRESYNC)
//
// The server-side core of a terminal mail client: an IMAP4rev1 engine with CONDSTORE/QRESYNC
// synchronisation, a keyed header cache, a content-addressed body cache, and the RFC 2047 codec
// every header goes through. No drawing, no prompting; collaborators plug in via Observer.

#![allow(clippy::upper_case_acronyms)]

use anyhow::Context as _;
use std::{error, fmt, num, path, process, str, sync, time};
use zeroize::Zeroize as _;

pub mod bcache;
pub mod buffer;
pub mod charset;
pub mod connection;
pub mod date;
pub mod email;
pub mod hcache;
pub mod imap;
pub mod mailbox;
pub mod rfc2047;
pub mod url;

use connection::Open as _;

// Typed markers for the failures callers must tell apart; recovered via downcast on the anyhow
// chain.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Error {
  // The user confirmed an abort; on-disk state is untouched.
  Interrupted,
  // Malformed or unexpected server traffic.
  Protocol,
  // Socket or TLS failure, the connection is gone.
  Transport,
  // Local caches disagree with the server in a way that forces a refetch.
  Coherence,
}

impl fmt::Display for Error {
  fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
    match self {
      Error::Interrupted => write!(formatter, "interrupted"),
      Error::Protocol => write!(formatter, "protocol error"),
      Error::Transport => write!(formatter, "transport error"),
      Error::Coherence => write!(formatter, "cache out of sync"),
    }
  }
}

impl error::Error for Error {}

pub fn error_kind(error: &anyhow::Error) -> Option<Error> {
  error.downcast_ref::<Error>().copied()
}

// Sticky cancellation flag, set from a signal handler or another thread, polled at safe points
// (between commands and between chunk iterations).
#[derive(Clone, Debug, Default)]
pub struct Interrupt(sync::Arc<sync::atomic::AtomicBool>);

impl Interrupt {
  pub fn set(&self) {
    self.0.store(true, sync::atomic::Ordering::Relaxed);
  }

  pub fn pending(&self) -> bool {
    self.0.load(sync::atomic::Ordering::Relaxed)
  }

  pub fn clear(&self) {
    self.0.store(false, sync::atomic::Ordering::Relaxed);
  }
}

// The engine's window to whoever drives it. Long operations report progress; the two questions
// gate an abort and a mailbox creation.
pub trait Observer {
  fn progress(&mut self, what: &str, done: usize, total: usize);
  fn confirm_abort(&mut self) -> bool;
  fn confirm_create(&mut self, mailbox: &str) -> bool;
}

// Headless collaborator: never creates, always honours an abort.
pub struct Silent;

impl Observer for Silent {
  fn progress(&mut self, what: &str, done: usize, total: usize) {
    log::trace!("{what}: {done}/{total}");
  }

  fn confirm_abort(&mut self) -> bool {
    true
  }

  fn confirm_create(&mut self, mailbox: &str) -> bool {
    log::info!("not creating {mailbox}");
    false
  }
}

#[derive(Clone, Debug, PartialEq, clap::ValueEnum)]
pub enum Mode {
  ConnectOnly,
  List,
  Pull,
  Fetch,
}

fn parse_duration(argument: &str) -> Result<time::Duration, num::ParseIntError> {
  Ok(time::Duration::from_secs(argument.parse()?))
}

#[derive(Clone, clap::Args)]
#[group(skip)]
pub struct Arguments {
  #[arg(
    help = "Execution mode: connect-only | list | pull | fetch",
    hide_possible_values(true)
  )]
  pub mode: Mode,

  #[arg(long = "address", help = "Server address, or an imap[s]:// URL")]
  pub address: String,
  #[arg(long = "port", help = "Server port", default_value_t = 0)]
  pub port: u16,
  #[arg(long = "tls", help = "Enable TLS", default_value_t = true)]
  pub tls: bool,
  #[arg(long = "timeout", help = "TCP timeout (in seconds)", value_parser = parse_duration)]
  pub timeout: Option<time::Duration>,

  #[arg(long = "user", help = "IMAP user")]
  pub user: String,
  #[arg(last = true, required = true)]
  pub password_command: Vec<String>,

  #[arg(long = "mailbox", help = "Mailbox to operate on", default_value_t = String::from("INBOX"))]
  pub mailbox: String,
  #[arg(long = "cache", help = "Cache directory (headers and bodies)")]
  pub cache: Option<String>,
  #[arg(
    long = "chunk-size",
    help = "Maximum new messages per header FETCH (0 = unbounded)",
    default_value_t = 0
  )]
  pub chunk_size: u32,
  #[arg(
    long = "mark-old",
    help = "Track seen-but-unread messages",
    default_value_t = false
  )]
  pub mark_old: bool,
}

struct Console;

impl Observer for Console {
  fn progress(&mut self, what: &str, done: usize, total: usize) {
    log::info!("{what}: {done}/{total}");
  }

  fn confirm_abort(&mut self) -> bool {
    true
  }

  fn confirm_create(&mut self, mailbox: &str) -> bool {
    log::info!("creating {mailbox}");
    true
  }
}

fn credentials(user: &str, password_command: &[String]) -> anyhow::Result<imap::auth::Credentials> {
  let mut program = process::Command::new(&password_command[0]);
  let command = program.args(&password_command[1..]);
  log::info!("getting password from {command:?}");
  let output = command.output()?;
  let mut stdout = output.stdout;
  anyhow::ensure!(
    output.status.success(),
    "couldn't get password: {command:?} failed"
  );
  let password = str::from_utf8(
    stdout
      .split(|byte| *byte == b'\n')
      .next()
      .with_context(|| format!("{command:?} didn't output anything"))?,
  )
  .with_context(|| format!("{command:?} didn't output UTF-8"))?;
  let credentials = imap::auth::Credentials {
    user: user.to_string(),
    password: password.to_string(),
  };
  stdout.zeroize();
  Ok(credentials)
}

fn open_config(arguments: &Arguments) -> mailbox::OpenConfig {
  let mut config = mailbox::OpenConfig {
    account_id: format!("{}@{}", arguments.user, arguments.address),
    ..mailbox::OpenConfig::default()
  };
  config.fetch.chunk_size = arguments.chunk_size;
  if let Some(cache) = arguments.cache.as_ref() {
    let root = path::Path::new(cache);
    config.headers_cache = Some(root.join("headers"));
    config.bodies_cache = Some(root.join("bodies"));
  }
  config
}

fn logout<RW>(mut account: imap::command::Account<RW>) -> anyhow::Result<()>
where
  RW: connection::ReadWrite,
{
  // The server answers with BYE and may drop the connection right away.
  if let Err(error) = account.exec(None, imap::command::Command::new(b"LOGOUT".to_vec())) {
    log::debug!("LOGOUT: {error}");
  }
  Ok(())
}

fn inner_run<RW>(arguments: &Arguments, rw: RW) -> anyhow::Result<()>
where
  RW: connection::ReadWrite,
{
  let mut account =
    imap::command::Account::new(connection::Connection::new(rw), Interrupt::default());
  account.mark_old = arguments.mark_old;
  account.greeting()?;
  if arguments.mode == Mode::ConnectOnly {
    return logout(account);
  }

  let credentials = credentials(&arguments.user, &arguments.password_command)?;
  mailbox::login(&mut account, &credentials)?;

  match arguments.mode {
    Mode::ConnectOnly => unreachable!(),
    Mode::List => {
      for entry in mailbox::list_mailboxes(&mut account, "*")? {
        log::info!(
          "{} (delimiter {:?}{})",
          entry
            .name
            .unwrap_or_else(|| String::from_utf8_lossy(&entry.raw).into_owned()),
          entry.delimiter,
          if entry.noselect { ", not selectable" } else { "" },
        );
      }
      logout(account)
    }
    Mode::Pull => {
      let mut console = Console;
      let open = mailbox::open(
        account,
        &arguments.mailbox,
        open_config(arguments),
        &mut console,
      )?;
      let aggregates = open.mailbox.aggregates;
      log::info!(
        "{}: {} message(s), {} unread, {} flagged, {} deleted, {} byte(s)",
        arguments.mailbox,
        aggregates.count,
        aggregates.unread,
        aggregates.flagged,
        aggregates.deleted,
        aggregates.size,
      );
      logout(open.close()?)
    }
    Mode::Fetch => {
      let mut console = Console;
      let mut open = mailbox::open(
        account,
        &arguments.mailbox,
        open_config(arguments),
        &mut console,
      )?;
      let last = open
        .mailbox
        .emails
        .iter()
        .rev()
        .find(|email| email.active)
        .map(|email| email.index);
      match last {
        Some(id) => {
          let message = open.msg_open(id, true)?;
          log::info!("fetched message into {:?}", message.path);
          mailbox::msg_close(message);
        }
        None => log::info!("{} is empty", arguments.mailbox),
      }
      logout(open.close()?)
    }
  }
}

pub fn run(arguments: &Arguments) -> anyhow::Result<()> {
  // An imap[s]:// URL in --address carries host, port, user and mailbox in one go.
  let mut arguments = arguments.clone();
  if url::probe(&arguments.address).is_some() {
    let parsed = url::parse(&arguments.address)?;
    anyhow::ensure!(
      parsed.scheme != url::Scheme::Notmuch,
      "notmuch URLs are routed to the notmuch integration, not this client"
    );
    arguments.tls = parsed.scheme == url::Scheme::Imaps;
    arguments.address = parsed.host;
    if arguments.port == 0 {
      arguments.port = parsed.port;
    }
    if let Some(user) = parsed.user {
      arguments.user = user;
    }
    arguments.mailbox = parsed.mailbox;
  } else if arguments.port == 0 {
    arguments.port = if arguments.tls {
      url::Scheme::Imaps.default_port()
    } else {
      url::Scheme::Imap.default_port()
    };
  }
  let arguments = &arguments;

  let tcp = connection::Tcp {
    address: &arguments.address,
    port: arguments.port,
    timeout: arguments.timeout,
  };
  if !arguments.tls {
    log::warn!("TLS not enabled, credentials will be sent in clear over the wire");
    return inner_run(arguments, tcp.open()?);
  }
  let tls = connection::Tls(tcp);
  inner_run(arguments, tls.open()?)
}
