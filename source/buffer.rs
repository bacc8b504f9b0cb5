// Reusable byte buffers. Protocol handling allocates the same scratch space over and over
// (command assembly, response lines, header blocks) so released buffers go back to a per-thread
// free-list instead of the allocator.

use std::{cell, fmt, path};

// Released buffers above twice this are shrunk back so one huge literal doesn't pin memory.
const BASELINE: usize = 1024;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Buffer {
  data: Vec<u8>,
}

impl Buffer {
  pub fn new() -> Self {
    Self { data: Vec::new() }
  }

  pub fn with_capacity(capacity: usize) -> Self {
    Self {
      data: Vec::with_capacity(capacity),
    }
  }

  // Logical length back to 0, capacity kept.
  pub fn reset(&mut self) {
    self.data.clear();
  }

  pub fn add_ch(&mut self, byte: u8) {
    self.data.push(byte);
  }

  pub fn add_bytes(&mut self, bytes: &[u8]) {
    self.data.extend_from_slice(bytes);
  }

  pub fn add_str(&mut self, string: &str) {
    self.data.extend_from_slice(string.as_bytes());
  }

  pub fn copy_from(&mut self, other: &Self) {
    self.data.clear();
    self.data.extend_from_slice(&other.data);
  }

  pub fn substr(&self, start: usize, end: usize) -> &[u8] {
    &self.data[start..end]
  }

  // ASCII only; charset-aware lowering lives in charset::lowercase.
  pub fn lowercase(&mut self) {
    self.data.make_ascii_lowercase();
  }

  // Append a path component, inserting exactly one separator.
  pub fn concat_path(&mut self, component: &str) {
    if !self.data.is_empty() && self.data.last() != Some(&(path::MAIN_SEPARATOR as u8)) {
      self.data.push(path::MAIN_SEPARATOR as u8);
    }
    let component = component
      .strip_prefix(path::MAIN_SEPARATOR)
      .unwrap_or(component);
    self.data.extend_from_slice(component.as_bytes());
  }

  pub fn find(&self, needle: &[u8]) -> Option<usize> {
    memchr::memmem::find(&self.data, needle)
  }

  pub fn rfind(&self, needle: &[u8]) -> Option<usize> {
    memchr::memmem::rfind(&self.data, needle)
  }

  pub fn starts_with(&self, prefix: &[u8]) -> bool {
    self.data.starts_with(prefix)
  }

  pub fn is_equal(&self, other: &[u8]) -> bool {
    self.data == other
  }

  pub fn len(&self) -> usize {
    self.data.len()
  }

  pub fn is_empty(&self) -> bool {
    self.data.is_empty()
  }

  pub fn as_slice(&self) -> &[u8] {
    &self.data
  }

  pub fn as_mut_vec(&mut self) -> &mut Vec<u8> {
    &mut self.data
  }

  pub fn into_vec(self) -> Vec<u8> {
    self.data
  }
}

impl fmt::Write for Buffer {
  fn write_str(&mut self, string: &str) -> fmt::Result {
    self.add_str(string);
    Ok(())
  }
}

impl From<Vec<u8>> for Buffer {
  fn from(data: Vec<u8>) -> Self {
    Self { data }
  }
}

thread_local! {
  // LIFO so the most recently released (cache-hot) buffer is handed out first. Per-thread on
  // purpose: the pool has no locking and concurrent users must segregate pools.
  static POOL: cell::RefCell<Vec<Buffer>> = cell::RefCell::new(Vec::new());
}

// Buffers from the pool are always empty with at least the baseline capacity.
pub fn get() -> Buffer {
  POOL.with(|pool| match pool.borrow_mut().pop() {
    Some(mut buffer) => {
      buffer.reset();
      buffer
    }
    None => Buffer::with_capacity(BASELINE),
  })
}

pub fn release(mut buffer: Buffer) {
  if buffer.data.capacity() > 2 * BASELINE {
    buffer.data = Vec::with_capacity(BASELINE);
  }
  buffer.reset();
  POOL.with(|pool| pool.borrow_mut().push(buffer));
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;
  use std::fmt::Write as _;

  #[test]
  fn append() {
    let mut buffer = Buffer::new();
    buffer.add_str("hello");
    buffer.add_ch(b' ');
    buffer.add_bytes(b"world");
    write!(buffer, " {}", 42).unwrap();
    assert_eq!(b"hello world 42", buffer.as_slice());
    assert_eq!(Some(6), buffer.find(b"world"));
    assert_eq!(None, buffer.find(b"mars"));
    assert!(buffer.starts_with(b"hello"));
    buffer.reset();
    assert!(buffer.is_empty());
  }

  #[test]
  fn rfind() {
    let mut buffer = Buffer::new();
    buffer.add_str("a.b.c");
    assert_eq!(Some(3), buffer.rfind(b"."));
    assert_eq!(Some(1), buffer.find(b"."));
  }

  #[test]
  fn concat_path() {
    let mut buffer = Buffer::new();
    buffer.add_str("/cache");
    buffer.concat_path("INBOX");
    buffer.concat_path("/headers");
    assert_eq!(b"/cache/INBOX/headers", buffer.as_slice());
  }

  #[test]
  fn lowercase() {
    let mut buffer = Buffer::new();
    buffer.add_str("MiXeD");
    buffer.lowercase();
    assert_eq!(b"mixed", buffer.as_slice());
  }

  #[test]
  fn pool() {
    let mut buffer = get();
    assert!(buffer.is_empty());
    buffer.add_bytes(&[0; 4 * BASELINE]);
    release(buffer);
    // Oversized buffers are shrunk on release, and handed back out empty.
    let buffer = get();
    assert!(buffer.is_empty());
    assert!(buffer.data.capacity() <= 2 * BASELINE);
    release(buffer);
  }
}
