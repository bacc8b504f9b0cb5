// Blocking line/literal transport. IMAP frames responses as CRLF-terminated lines with embedded
// `{n}` literals; the connection surfaces exactly those two read shapes and nothing else.

use crate::Error;
use anyhow::Context as _;
use std::{
  cmp, io,
  net::{self, ToSocketAddrs as _},
  time,
};

pub fn escape(bytes: &[u8]) -> String {
  let mut string = String::new();
  for byte in bytes {
    string += &std::ascii::escape_default(*byte).to_string();
  }
  string
}

pub fn summarize(bytes: &[u8]) -> String {
  let stop = memchr::memmem::find(bytes, b"\r\n").unwrap_or(bytes.len());
  let stop = cmp::min(stop + 2, bytes.len());
  let mut string = escape(&bytes[..stop]);
  if stop < bytes.len() {
    string += "...omitted...";
  }
  string
}

pub trait ReadWrite {
  fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize>;
  fn write_all(&mut self, buffer: &[u8]) -> io::Result<()>;
}

impl ReadWrite for net::TcpStream {
  fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
    io::Read::read(self, buffer)
  }

  fn write_all(&mut self, buffer: &[u8]) -> io::Result<()> {
    io::Write::write_all(self, buffer)
  }
}

pub trait Open {
  type RW: ReadWrite;

  fn open(&self) -> anyhow::Result<Self::RW>;
}

pub struct Tcp<'a> {
  pub address: &'a str,
  pub port: u16,
  pub timeout: Option<time::Duration>,
}

impl<'a> Open for Tcp<'a> {
  type RW = net::TcpStream;

  fn open(&self) -> anyhow::Result<Self::RW> {
    let &Self {
      address,
      port,
      timeout,
    } = self;
    let address = (address, port)
      .to_socket_addrs()?
      .next()
      .with_context(|| format!("couldn't resolve {address}:{port}"))?;
    log::debug!("connecting to {:?} with timeout {:?}", address, timeout);
    Ok(match timeout {
      Some(duration) => {
        let stream = net::TcpStream::connect_timeout(&address, duration)?;
        stream.set_read_timeout(Some(duration))?;
        stream
      }
      None => net::TcpStream::connect(address)?,
    })
  }
}

pub struct Tls<'a>(pub Tcp<'a>);

#[ouroboros::self_referencing]
pub struct TlsStream {
  tcp_stream: net::TcpStream,
  tls_connection: rustls::ClientConnection,
  #[borrows(mut tcp_stream, mut tls_connection)]
  #[covariant]
  tls_stream: rustls::Stream<'this, rustls::ClientConnection, net::TcpStream>,
}

impl ReadWrite for TlsStream {
  fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
    self.with_mut(|fields| io::Read::read(fields.tls_stream, buffer))
  }

  fn write_all(&mut self, buffer: &[u8]) -> io::Result<()> {
    self.with_mut(|fields| io::Write::write_all(fields.tls_stream, buffer))
  }
}

impl<'a> Open for Tls<'a> {
  type RW = TlsStream;

  fn open(&self) -> anyhow::Result<Self::RW> {
    let mut root_store = rustls::RootCertStore::empty();
    for certificate in rustls_native_certs::load_native_certs()? {
      root_store.add(&rustls::Certificate(certificate.0))?
    }
    Ok(
      TlsStreamBuilder {
        tcp_stream: self.0.open()?,
        tls_connection: rustls::ClientConnection::new(
          std::sync::Arc::new(
            rustls::ClientConfig::builder()
              .with_safe_defaults()
              .with_root_certificates(root_store)
              .with_no_client_auth(),
          ),
          self
            .0
            .address
            .try_into()
            .with_context(|| format!("couldn't convert {} to server name", self.0.address))?,
        )?,
        tls_stream_builder: |tcp_stream, tls_connection| {
          rustls::Stream::new(tls_connection, tcp_stream)
        },
      }
      .build(),
    )
  }
}

#[derive(Debug)]
pub struct Connection<RW> {
  rw: RW,
  buffer: Vec<u8>,
  start: usize,
}

impl<RW> Connection<RW>
where
  RW: ReadWrite,
{
  pub fn new(rw: RW) -> Self {
    Self {
      rw,
      buffer: Vec::new(),
      start: 0,
    }
  }

  fn fill(&mut self) -> anyhow::Result<()> {
    // Reclaim consumed bytes before growing; large literals are drained straight to their sink
    // and never accumulate here.
    if self.start > 0 {
      self.buffer.copy_within(self.start.., 0);
      self.buffer.truncate(self.buffer.len() - self.start);
      self.start = 0;
    }
    let mut chunk = [0; 32 * 1024];
    match self.rw.read(&mut chunk).context(Error::Transport)? {
      0 => Err(anyhow::Error::new(Error::Transport).context("end of stream")),
      length => {
        self.buffer.extend_from_slice(&chunk[..length]);
        Ok(())
      }
    }
  }

  // One logical line, CRLF stripped.
  pub fn read_line(&mut self) -> anyhow::Result<Vec<u8>> {
    loop {
      if let Some(position) = memchr::memmem::find(&self.buffer[self.start..], b"\r\n") {
        let line = self.buffer[self.start..self.start + position].to_vec();
        self.start += position + 2;
        log::debug!("< {}", escape(&line));
        return Ok(line);
      }
      self.fill()?;
    }
  }

  // Exactly `length` octets of a `{length}` literal into `sink`, then line parsing resumes.
  pub fn read_literal(&mut self, mut length: usize, sink: &mut dyn io::Write) -> anyhow::Result<()> {
    log::debug!("< ...literal of {length} bytes...");
    let buffered = cmp::min(length, self.buffer.len() - self.start);
    sink.write_all(&self.buffer[self.start..self.start + buffered])?;
    self.start += buffered;
    length -= buffered;
    let mut chunk = [0; 32 * 1024];
    while length > 0 {
      let want = cmp::min(length, chunk.len());
      match self
        .rw
        .read(&mut chunk[..want])
        .context(Error::Transport)?
      {
        0 => return Err(anyhow::Error::new(Error::Transport).context("end of stream inside a literal")),
        read => {
          sink.write_all(&chunk[..read])?;
          length -= read;
        }
      }
    }
    Ok(())
  }

  // https://www.rfc-editor.org/rfc/rfc7162#section-4
  // [...] a client should limit the length of the command lines it generates to approximately
  // 8192 octets (including all quoted strings but not including literals).
  pub fn write(&mut self, buffers: &[&[u8]], log: usize) -> anyhow::Result<()> {
    if log::log_enabled!(log::Level::Debug) && log > 0 {
      log::debug!(
        "> {}{}",
        escape(&buffers[..log].concat()),
        if log < buffers.len() {
          "...omitted..."
        } else {
          ""
        }
      );
    } else {
      log::debug!("> ...omitted...");
    }
    for buffer in buffers.iter() {
      self.rw.write_all(buffer).context(Error::Transport)?;
    }
    Ok(())
  }
}
