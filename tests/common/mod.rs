pub mod server;

use tern::imap::auth::Credentials;
use tern::imap::command::Account;
use tern::{connection, Interrupt};

pub const GREETING: &str = "* OK [CAPABILITY IMAP4rev1 LITERAL+ ENABLE CONDSTORE QRESYNC \
                            UIDPLUS MOVE AUTH=PLAIN] ready";
pub const CAPABILITIES: &str = "* CAPABILITY IMAP4rev1 LITERAL+ ENABLE CONDSTORE QRESYNC \
                                UIDPLUS MOVE AUTH=PLAIN";

pub fn connect(port: u16) -> Account<std::net::TcpStream> {
  let stream = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
  Account::new(connection::Connection::new(stream), Interrupt::default())
}

pub fn credentials() -> Credentials {
  Credentials {
    user: "user".to_string(),
    password: "password".to_string(),
  }
}

// Greeting carries the capabilities, so login is AUTHENTICATE + refresh + ENABLE.
pub fn login_steps() -> Vec<server::Step> {
  vec![
    server::sasl_step("AUTHENTICATE PLAIN", "OK authenticated"),
    server::step("CAPABILITY", &[CAPABILITIES], "OK done"),
    server::step("ENABLE QRESYNC", &["* ENABLED QRESYNC"], "OK enabled"),
  ]
}

pub fn list_step() -> server::Step {
  server::step("LIST \"\" \"\"", &[r#"* LIST (\Noselect) "/" """#], "OK done")
}

pub fn select_steps(
  exists: u32,
  uidvalidity: u32,
  uidnext: u32,
  highestmodseq: u64,
) -> server::Step {
  let responses = vec![
    r"* FLAGS (\Answered \Flagged \Deleted \Seen \Draft)".to_string(),
    format!("* {exists} EXISTS"),
    "* 0 RECENT".to_string(),
    format!("* OK [UIDVALIDITY {uidvalidity}] UIDs valid"),
    format!("* OK [UIDNEXT {uidnext}] Predicted next UID"),
    format!("* OK [HIGHESTMODSEQ {highestmodseq}] Highest"),
    r"* OK [PERMANENTFLAGS (\Answered \Flagged \Deleted \Seen \Draft \*)] Flags permitted".to_string(),
  ];
  server::Step {
    expect: "SELECT".to_string(),
    sasl: false,
    responses,
    status: "OK [READ-WRITE] selected".to_string(),
  }
}

// One header-FETCH row with an exact literal length.
pub fn header_row(msn: u32, uid: u32, flags: &str, date: &str, size: u64, headers: &str) -> String {
  format!(
    "* {msn} FETCH (UID {uid} FLAGS ({flags}) INTERNALDATE \"{date}\" RFC822.SIZE {size} \
     BODY[HEADER.FIELDS (DATE FROM SENDER SUBJECT TO CC MESSAGE-ID REFERENCES CONTENT-TYPE \
     CONTENT-DESCRIPTION IN-REPLY-TO REPLY-TO LINES LIST-POST LIST-SUBSCRIBE LIST-UNSUBSCRIBE \
     X-LABEL X-ORIGINAL-TO)] {{{}}}\r\n{headers})",
    headers.len()
  )
}

pub fn headers(subject: &str, message_id: &str) -> String {
  format!("Subject: {subject}\r\nMessage-Id: <{message_id}>\r\n\r\n")
}
