// In-process scripted IMAP server. Each step reads one complete client command (following
// literal announcements, answering synchronising ones with a continuation request), records it,
// then plays back the scripted untagged responses and the tagged completion.

use std::{
  io::{BufRead as _, Read as _, Write as _},
  net, str,
  sync::{Arc, Mutex},
  thread,
};

pub struct Step {
  pub expect: String,
  // Server speaks first after AUTHENTICATE: continuation, then one more client line.
  pub sasl: bool,
  pub responses: Vec<String>,
  pub status: String,
}

pub fn step(expect: &str, responses: &[&str], status: &str) -> Step {
  Step {
    expect: expect.to_string(),
    sasl: false,
    responses: responses.iter().map(|response| response.to_string()).collect(),
    status: status.to_string(),
  }
}

pub fn sasl_step(expect: &str, status: &str) -> Step {
  Step {
    sasl: true,
    ..step(expect, &[], status)
  }
}

pub struct Server {
  pub port: u16,
  pub received: Arc<Mutex<Vec<Vec<u8>>>>,
  handle: thread::JoinHandle<anyhow::Result<()>>,
}

impl Server {
  // Joins the server thread, propagating any script mismatch.
  pub fn finish(self) -> anyhow::Result<Vec<Vec<u8>>> {
    self.handle.join().expect("server thread panicked")?;
    Ok(Arc::try_unwrap(self.received).unwrap().into_inner().unwrap())
  }
}

// "{n}" or "{n+}" at the very end of a line.
fn trailing_literal(line: &[u8]) -> Option<(usize, bool)> {
  let line = line.strip_suffix(b"}")?;
  let open = line.iter().rposition(|byte| *byte == b'{')?;
  let inner = &line[open + 1..];
  let (digits, plus) = match inner.strip_suffix(b"+") {
    Some(digits) => (digits, true),
    None => (inner, false),
  };
  let length: usize = str::from_utf8(digits).ok()?.parse().ok()?;
  Some((length, plus))
}

fn read_command(
  reader: &mut impl std::io::BufRead,
  stream: &mut net::TcpStream,
) -> anyhow::Result<Vec<u8>> {
  let mut command = Vec::new();
  loop {
    let mut line = Vec::new();
    reader.read_until(b'\n', &mut line)?;
    anyhow::ensure!(!line.is_empty(), "client closed the connection");
    while line.last() == Some(&b'\n') || line.last() == Some(&b'\r') {
      line.pop();
    }
    command.extend_from_slice(&line);
    match trailing_literal(&line) {
      Some((length, plus)) => {
        if !plus {
          stream.write_all(b"+ go ahead\r\n")?;
        }
        let mut literal = vec![0; length];
        reader.read_exact(&mut literal)?;
        command.extend_from_slice(&literal);
      }
      None => return Ok(command),
    }
  }
}

pub fn spawn(greeting: &str, steps: Vec<Step>) -> Server {
  let listener = net::TcpListener::bind("127.0.0.1:0").unwrap();
  let port = listener.local_addr().unwrap().port();
  let received = Arc::new(Mutex::new(Vec::new()));
  let received_ = received.clone();
  let greeting = greeting.to_string();
  let handle = thread::spawn(move || -> anyhow::Result<()> {
    let (mut stream, _) = listener.accept()?;
    let mut reader = std::io::BufReader::new(stream.try_clone()?);
    stream.write_all(format!("{greeting}\r\n").as_bytes())?;
    for step in steps {
      let command = read_command(&mut reader, &mut stream)?;
      received_.lock().unwrap().push(command.clone());
      let printable = String::from_utf8_lossy(&command).into_owned();
      anyhow::ensure!(
        printable.contains(&step.expect),
        "expected a command containing {:?}, got {printable:?}",
        step.expect
      );
      let tag = printable
        .split_ascii_whitespace()
        .next()
        .unwrap_or("*")
        .to_string();
      if step.sasl {
        stream.write_all(b"+ \r\n")?;
        let mut line = Vec::new();
        reader.read_until(b'\n', &mut line)?;
        received_.lock().unwrap().push(line);
      }
      for response in &step.responses {
        stream.write_all(format!("{response}\r\n").as_bytes())?;
      }
      stream.write_all(format!("{tag} {}\r\n", step.status).as_bytes())?;
    }
    Ok(())
  });
  Server {
    port,
    received,
    handle,
  }
}
