// Scripted-wire harness: the engine runs against an in-memory wire whose
// input the test feeds and whose output the test asserts, with an in-memory
// cache. No sockets, no timers firing on their own.

use grist::engine::{Client, Interest, Level, Open, Progress, Status, Wire, WirePhase};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

#[derive(Debug, Default)]
pub struct WireState {
  pub input: VecDeque<u8>,
  pub output: Vec<u8>,
  pub eof: bool,
  pub opened: usize,
}

pub struct ScriptWire(Rc<RefCell<WireState>>);

impl Wire for ScriptWire {
  fn fd(&self) -> Option<std::os::unix::io::RawFd> {
    None
  }

  fn phase(&self) -> WirePhase {
    WirePhase::Established
  }

  fn connect(&mut self) -> grist::Result<Progress> {
    Ok(Progress::Ready(()))
  }

  fn recv(&mut self, buffer: &mut [u8]) -> grist::Result<Progress<usize>> {
    let mut state = self.0.borrow_mut();
    if state.input.is_empty() {
      if state.eof {
        return Ok(Progress::Ready(0));
      }
      return Ok(Progress::Want(Interest::READABLE));
    }
    let mut n = 0;
    while n < buffer.len() {
      match state.input.pop_front() {
        Some(byte) => {
          buffer[n] = byte;
          n += 1;
        }
        None => break,
      }
    }
    Ok(Progress::Ready(n))
  }

  fn send(&mut self, buffer: &[u8]) -> grist::Result<Progress<usize>> {
    self.0.borrow_mut().output.extend_from_slice(buffer);
    Ok(Progress::Ready(buffer.len()))
  }

  fn flush(&mut self) -> grist::Result<Progress> {
    Ok(Progress::Ready(()))
  }
}

pub struct ScriptOpen(Rc<RefCell<WireState>>);

impl Open for ScriptOpen {
  type Wire = ScriptWire;

  fn open(&self) -> grist::Result<ScriptWire> {
    let mut state = self.0.borrow_mut();
    state.opened += 1;
    state.input.clear();
    state.output.clear();
    state.eof = false;
    Ok(ScriptWire(self.0.clone()))
  }
}

pub struct RecordingStatus(Rc<RefCell<Vec<(String, Level)>>>);

impl Status for RecordingStatus {
  fn update_status(&mut self, message: &str, level: Level) {
    log::info!("status: {message}");
    self.0.borrow_mut().push((message.to_string(), level));
  }
}

pub struct Harness {
  pub state: Rc<RefCell<WireState>>,
  pub statuses: Rc<RefCell<Vec<(String, Level)>>>,
  pub client: Client<ScriptOpen, RecordingStatus>,
}

impl Harness {
  pub fn new() -> Self {
    Self::with_password("password")
  }

  pub fn with_password(password: &str) -> Self {
    let state = Rc::new(RefCell::new(WireState::default()));
    let statuses = Rc::new(RefCell::new(Vec::new()));
    let cache = grist::cache::Cache::open_in_memory().unwrap();
    let client = Client::new(
      ScriptOpen(state.clone()),
      RecordingStatus(statuses.clone()),
      cache,
      "user".to_string(),
      password.to_string(),
    );
    Self {
      state,
      statuses,
      client,
    }
  }

  /// Hand the client server bytes and let it process them.
  pub fn feed(&mut self, bytes: &[u8]) {
    self.state.borrow_mut().input.extend(bytes.iter().copied());
    self.client.on_ready(true, false);
  }

  pub fn feed_eof(&mut self) {
    self.state.borrow_mut().eof = true;
    self.client.on_ready(true, false);
  }

  /// Everything the client wrote since the last call.
  pub fn written(&mut self) -> Vec<u8> {
    std::mem::take(&mut self.state.borrow_mut().output)
  }

  pub fn expect_written(&mut self, expected: &[u8]) {
    let written = self.written();
    assert_eq!(
      String::from_utf8_lossy(expected),
      String::from_utf8_lossy(&written),
    );
  }

  pub fn reported(&self, needle: &str) -> bool {
    self
      .statuses
      .borrow()
      .iter()
      .any(|(message, _)| message.contains(needle))
  }

  /// Greeting, CAPABILITY and LOGIN with the given capability list.
  pub fn authenticate(&mut self, capabilities: &str) {
    self.client.start();
    self.feed(b"* OK hi\r\n");
    self.expect_written(b"A001 CAPABILITY\r\n");
    self.feed(format!("* CAPABILITY {capabilities}\r\nA001 OK\r\n").as_bytes());
    self.expect_written(b"A002 LOGIN user password\r\n");
    self.feed(b"A002 OK\r\n");
    assert_eq!(Some("authenticated"), self.client.state_name());
  }
}
