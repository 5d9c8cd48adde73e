// The IMAP state machine and everything that feeds it: one connection at a
// time walks Greeting -> NotAuthenticated -> Authenticated <-> Selected,
// pulling intents off the work queue and keeping the cache consistent with
// what the server says. The engine owns no event loop; the caller polls the
// descriptor and deadline reported by `wants` and feeds back readiness and
// ticks.

use crate::cache::Cache;
use crate::error::{Error, Result};
use crate::event::Deadlines;
pub use crate::event::Interest;
use crate::imap::formatter::Command;
use crate::imap::scanner::Scanner;
use crate::imap::preview;
use crate::imap::types::{Capability, Response, Untagged, UntaggedKind};
use crate::operation::{Kind, OpId, Operations};
use crate::stack::Stack;
use crate::work::{Queue, Waiter};
use std::collections::HashMap;
use std::os::unix::io::{AsRawFd as _, RawFd};
use std::{io, net, sync, time};

mod selected;
mod session;

pub use selected::SelectedSnapshot;

const CONNECT_TIMEOUT: time::Duration = time::Duration::from_secs(30);
const HANDSHAKE_TIMEOUT: time::Duration = time::Duration::from_secs(30);
const RECONNECT_DELAY: time::Duration = time::Duration::from_secs(5);
// Servers are allowed to drop an idle connection after 30 minutes; leave
// IDLE a bit before that and re-enter.
const IDLE_TIMEOUT: time::Duration = time::Duration::from_secs(29 * 60);
const RECV_BUFFER: usize = 16 * 1024;

/// Cache failures are invariant violations (broken foreign keys, torn
/// flows): crash loudly before any corruption spreads.
pub(crate) fn cache_must<T>(result: Result<T>) -> T {
  match result {
    Ok(value) => value,
    Err(error) => panic!("cache failure: {error}"),
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Level {
  Info,
  Error,
}

/// User-visible progress reporting; the display layer owns the rendering.
pub trait Status {
  fn update_status(&mut self, message: &str, level: Level);
}

/// Outcome of one non-blocking wire operation: done, or blocked until the
/// socket is ready for the given interest (which, under TLS, may differ
/// from the direction of the caller's request).
#[derive(Debug)]
pub enum Progress<T = ()> {
  Ready(T),
  Want(Interest),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WirePhase {
  Tcp,
  Tls,
  Established,
}

/// A (possibly TLS-wrapped) byte pipe in non-blocking mode.
pub trait Wire {
  fn fd(&self) -> Option<RawFd>;
  fn phase(&self) -> WirePhase;
  /// Drive connection establishment (TCP, then the TLS handshake).
  fn connect(&mut self) -> Result<Progress>;
  /// Ready(0) is end of stream.
  fn recv(&mut self, buffer: &mut [u8]) -> Result<Progress<usize>>;
  fn send(&mut self, buffer: &[u8]) -> Result<Progress<usize>>;
  /// Push out bytes the wire itself buffered (TLS records).
  fn flush(&mut self) -> Result<Progress>;
}

/// How to reach the server; reconnections call this again.
pub trait Open {
  type Wire: Wire;
  fn open(&self) -> Result<Self::Wire>;
}

/// Deadline tokens; at most one of each per connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Timer {
  Connect,
  Handshake,
  Idle,
  Reconnect,
}

/// Identities of untagged/continuation handlers, stacked per response type.
/// The newest registered handler that claims a response wins.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Handler {
  Connection,
  Greeting,
  NotAuthenticated,
  Authenticated,
  Selected,
  List,
  PopulateUnseen,
  Fetch,
  Idle,
}

/// The untagged response types each handler subscribes to; registration
/// walks this static table at operation start and teardown.
fn handler_kinds(handler: Handler) -> &'static [UntaggedKind] {
  match handler {
    Handler::Connection => &[],
    Handler::Greeting => &[UntaggedKind::Ok, UntaggedKind::PreAuth, UntaggedKind::Bye],
    Handler::NotAuthenticated => &[UntaggedKind::Capability, UntaggedKind::Bye],
    Handler::Authenticated => &[
      UntaggedKind::Bye,
      UntaggedKind::Flags,
      UntaggedKind::Exists,
      UntaggedKind::Recent,
      UntaggedKind::Ok,
    ],
    Handler::Selected => &[
      UntaggedKind::Bye,
      UntaggedKind::Flags,
      UntaggedKind::Exists,
      UntaggedKind::Recent,
      UntaggedKind::Expunge,
      UntaggedKind::Fetch,
      UntaggedKind::Ok,
    ],
    Handler::List => &[UntaggedKind::List, UntaggedKind::Status],
    Handler::PopulateUnseen => &[UntaggedKind::Esearch, UntaggedKind::Search],
    Handler::Fetch => &[UntaggedKind::Expunge, UntaggedKind::Fetch],
    Handler::Idle => &[UntaggedKind::Exists],
  }
}

/// What to do when a tagged response (or the disconnect sentinel) arrives
/// for an in-flight command.
#[derive(Debug)]
pub(crate) enum Cont {
  Capability,
  Login,
  List,
  StatusCmd,
  Examine,
  EsearchAll,
  EsearchUnseen,
  FetchUids,
  FetchDetails,
  FetchWork,
  Close,
  Check,
  Noop,
  IdleCmd,
  Logout,
}

#[derive(Debug)]
pub(crate) struct PendingTag {
  owner: OpId,
  cont: Cont,
}

pub(crate) struct Connection<W> {
  wire: W,
  op: OpId,
  phase: session::Phase,
  scanner: Scanner,
  tag: u32,
  // Insertion order matters for the disconnect fan-out.
  tagged: Vec<(String, PendingTag)>,
  send_queue: std::collections::VecDeque<Command>,
  send_pos: usize,
  recv_want: Interest,
  send_want: Interest,
  capabilities: Vec<Capability>,
  untagged: HashMap<UntaggedKind, Stack<Handler>>,
  continue_handlers: Stack<Handler>,
  list: Option<session::ListOp>,
}

impl<W> Connection<W> {
  fn next_tag(&mut self) -> String {
    self.tag += 1;
    format!("A{:03}", self.tag)
  }

  pub(crate) fn have_capability(&self, capability: &Capability) -> bool {
    self.capabilities.contains(capability)
  }

  fn register(&mut self, handler: Handler) {
    for kind in handler_kinds(handler) {
      self.untagged.entry(*kind).or_default().register(handler);
    }
  }

  fn unregister(&mut self, handler: Handler) {
    for kind in handler_kinds(handler) {
      self.untagged.get_mut(kind).unwrap().unregister(handler);
    }
  }
}

pub struct Client<O: Open, S: Status> {
  open: O,
  status: S,
  pub cache: Cache,
  pub queue: Queue,
  pub(crate) ops: Operations,
  pub(crate) conn: Option<Connection<O::Wire>>,
  deadlines: Deadlines<Timer>,
  user: String,
  password: String,
  quit: bool,
  /// Terminate for good after this connection winds down (user quit,
  /// greeting BYE, failed authentication).
  terminate: bool,
}

impl<O: Open, S: Status> Client<O, S> {
  pub fn new(open: O, status: S, cache: Cache, user: String, password: String) -> Self {
    Self {
      open,
      status,
      cache,
      queue: Queue::new(),
      ops: Operations::new(),
      conn: None,
      deadlines: Deadlines::new(),
      user,
      password,
      quit: false,
      terminate: false,
    }
  }

  // Event-loop interface.

  pub fn is_quit(&self) -> bool {
    self.quit
  }

  /// The socket (if any) and interest to poll, plus the next deadline.
  pub fn wants(&self) -> (Option<(RawFd, Interest)>, Option<time::Instant>) {
    let pollable = self.conn.as_ref().and_then(|conn| {
      let interest = conn.recv_want.union(conn.send_want);
      if interest.is_empty() {
        None
      } else {
        conn.wire.fd().map(|fd| (fd, interest))
      }
    });
    (pollable, self.deadlines.next())
  }

  pub fn on_ready(&mut self, readable: bool, writable: bool) {
    let Some(conn) = self.conn.as_ref() else {
      return;
    };
    if matches!(
      conn.wire.phase(),
      WirePhase::Tcp | WirePhase::Tls
    ) {
      self.drive_connect();
      return;
    }
    if readable {
      self.try_recv();
    }
    if self.conn.is_some() && writable {
      self.try_send();
    }
  }

  pub fn on_tick(&mut self, now: time::Instant) {
    for timer in self.deadlines.fire(now) {
      match timer {
        Timer::Connect => {
          self.report("Timed out while connecting", Level::Error);
          self.teardown();
        }
        Timer::Handshake => {
          self.report("Timed out during TLS handshake", Level::Error);
          self.teardown();
        }
        Timer::Idle => self.idle_interrupt(),
        Timer::Reconnect => {
          if !self.quit {
            self.start_connection();
          }
        }
      }
    }
  }

  // The display layer's intents (the manager contract).

  pub fn quit(&mut self) {
    if self.conn.is_none() {
      self.deadlines.clear(Timer::Reconnect);
      self.terminate = true;
      self.quit = true;
      return;
    }
    self.queue.quit();
    self.kick();
  }

  pub fn refresh(&mut self) {
    self.queue.refresh_mailbox_list();
    self.kick();
  }

  pub fn select_mailbox(&mut self, name: &str) -> Result<()> {
    let raw = self
      .cache
      .mailbox_raw_name(name)?
      .ok_or_else(|| Error::UserIntent(format!("unknown mailbox {name}")))?;
    self.queue.select_mailbox(&raw);
    self.kick();
    Ok(())
  }

  pub fn open_message(&mut self, name: &str, uid: u32, need_bodystructure: bool) -> Result<()> {
    self.select_mailbox(name)?;
    if need_bodystructure && !self.cache.message_has_bodystructure(name, uid)? {
      self.queue.fetch_bodystructure(uid);
    }
    self.kick();
    Ok(())
  }

  pub fn read_body_sections(&mut self, name: &str, uid: u32, sections: Vec<String>) -> Result<()> {
    self.select_mailbox(name)?;
    let mut missing = Vec::new();
    for section in sections {
      if !self.cache.has_body_section(name, uid, &section)? {
        missing.push(section);
      }
    }
    if !missing.is_empty() {
      self.queue.fetch_body_sections(uid, missing);
    }
    self.kick();
    Ok(())
  }

  /// Wake whichever state is waiting on the queue.
  fn kick(&mut self) {
    if let Some(waiter) = self.queue.signal() {
      match waiter {
        Waiter::Authenticated => self.process_work_authenticated(),
        Waiter::Selected => self.process_work_selected(),
        Waiter::Idle => self.idle_interrupt(),
      }
    }
  }

  pub(crate) fn report(&mut self, message: &str, level: Level) {
    match level {
      Level::Info => log::info!("{message}"),
      Level::Error => log::error!("{message}"),
    }
    self.status.update_status(message, level);
  }

  // Connection lifecycle.

  pub fn start(&mut self) {
    self.start_connection();
  }

  fn start_connection(&mut self) {
    assert!(self.conn.is_none());
    let wire = match self.open.open() {
      Ok(wire) => wire,
      Err(error) => {
        self.report(&format!("Error connecting to server: '{error}'"), Level::Error);
        if !self.queue.is_quit() {
          self.schedule_reconnect();
        } else {
          self.quit = true;
        }
        return;
      }
    };
    let op = self.ops.alloc(Kind::Connection, None);
    self.ops.inc(op); // Until the socket disconnects.
    let mut continue_handlers = Stack::new();
    continue_handlers.register(Handler::Connection);
    self.conn = Some(Connection {
      wire,
      op,
      phase: session::Phase::Down,
      scanner: Scanner::new(),
      tag: 0,
      tagged: Vec::new(),
      send_queue: std::collections::VecDeque::new(),
      send_pos: 0,
      recv_want: Interest::default(),
      send_want: Interest::default(),
      capabilities: Vec::new(),
      untagged: HashMap::new(),
      continue_handlers,
      list: None,
    });
    match self.conn.as_ref().unwrap().wire.phase() {
      WirePhase::Established => self.enter_greeting(),
      WirePhase::Tcp => {
        self.report("Connecting...", Level::Info);
        let Self { conn, ops, deadlines, .. } = self;
        let conn = conn.as_mut().unwrap();
        let tcp = ops.alloc(Kind::TcpConnect, Some(conn.op));
        ops.inc(tcp); // Until the connection completes or times out.
        conn.phase = session::Phase::Connecting { op: tcp };
        deadlines.set(Timer::Connect, time::Instant::now() + CONNECT_TIMEOUT);
        self.drive_connect();
      }
      WirePhase::Tls => unreachable!("a fresh wire starts with TCP"),
    }
  }

  /// Push TCP connection establishment and the TLS handshake along; each
  /// stage is its own operation with its own timeout.
  fn drive_connect(&mut self) {
    loop {
      let conn = self.conn.as_mut().unwrap();
      let before = conn.wire.phase();
      match conn.wire.connect() {
        Ok(Progress::Ready(())) => {
          self.deadlines.clear(Timer::Connect);
          self.deadlines.clear(Timer::Handshake);
          let conn = self.conn.as_mut().unwrap();
          conn.recv_want = Interest::default();
          conn.send_want = Interest::default();
          let op = match std::mem::replace(&mut conn.phase, session::Phase::Down) {
            session::Phase::Connecting { op } | session::Phase::Handshaking { op } => op,
            other => panic!("connect completion in {other:?}"),
          };
          self.finish(op);
          if self.conn.is_some() {
            self.enter_greeting();
          }
          return;
        }
        Ok(Progress::Want(interest)) => {
          let conn = self.conn.as_mut().unwrap();
          let now = conn.wire.phase();
          if before == WirePhase::Tcp && now == WirePhase::Tls {
            // The TCP stage finished; the handshake is a sibling operation
            // with a fresh timeout.
            self.report("Doing TLS handshake...", Level::Info);
            self.deadlines.clear(Timer::Connect);
            self
              .deadlines
              .set(Timer::Handshake, time::Instant::now() + HANDSHAKE_TIMEOUT);
            let Self { conn, ops, .. } = self;
            let conn = conn.as_mut().unwrap();
            let tcp = match std::mem::replace(&mut conn.phase, session::Phase::Down) {
              session::Phase::Connecting { op } => op,
              other => panic!("TCP completion in {other:?}"),
            };
            let tls = ops.alloc(Kind::TlsHandshake, Some(conn.op));
            ops.inc(tls); // Until the handshake completes or times out.
            conn.phase = session::Phase::Handshaking { op: tls };
            self.finish(tcp);
            if self.conn.is_none() {
              return;
            }
            continue;
          }
          conn.recv_want = Interest { readable: interest.readable, writable: false };
          conn.send_want = Interest { readable: false, writable: interest.writable };
          return;
        }
        Err(error) => {
          self.report(&format!("Error connecting to server: '{error}'"), Level::Error);
          self.teardown();
          return;
        }
      }
    }
  }

  // Operation plumbing. `dec` cascades: when an operation's pending count
  // reaches zero its completion logic runs, it is freed and its parent is
  // decremented in turn.

  pub(crate) fn dec(&mut self, op: OpId) {
    if self.ops.dec(op) {
      self.complete(op);
    }
  }

  /// Decrement an operation that must complete right now.
  fn finish(&mut self, op: OpId) {
    assert_eq!(1, self.ops.pending(op));
    self.dec(op);
  }

  fn complete(&mut self, op: OpId) {
    let kind = self.ops.kind(op);
    let parent = self.ops.parent(op);
    self.ops.free(op);
    self.op_done(kind);
    if let Some(parent) = parent {
      self.dec(parent);
    }
  }

  fn op_done(&mut self, kind: Kind) {
    match kind {
      // Transitions out of connect stages happen in drive_connect.
      Kind::TcpConnect | Kind::TlsHandshake => (),
      Kind::Greeting => self.greeting_done(),
      Kind::NotAuthenticated => self.not_authenticated_done(),
      Kind::Authenticated => self.authenticated_done(),
      Kind::Selected => self.selected_done(),
      Kind::List => self.list_done(),
      Kind::PopulateUnseen => self.populate_unseen_done(),
      Kind::Fetch => self.fetch_done(),
      Kind::Idle => self.idle_done(),
      Kind::Connection => self.connection_closed(),
    }
  }

  // Send pipeline. Commands queue whole; the cursor stops at each
  // continuation checkpoint until the server's go-ahead pops it.

  /// Enqueue a tagged command: the owner operation gains one pending unit
  /// until the tagged response (or the disconnect sentinel) arrives.
  /// Returns the allocated tag.
  pub(crate) fn send_cmd(
    &mut self,
    owner: OpId,
    cont: Cont,
    format: impl FnOnce(&str) -> Command,
  ) -> String {
    let Self { conn, ops, .. } = self;
    let conn = conn.as_mut().unwrap();
    ops.inc(owner); // Until the tagged response arrives.
    let tag = conn.next_tag();
    let command = format(&tag);
    if command.sensitive {
      log::debug!("> {tag} (credentials hidden)");
    } else {
      log::debug!("> {}", preview(&command.buffer));
    }
    conn.tagged.push((tag.clone(), PendingTag { owner, cont }));
    conn.send_queue.push_back(command);
    self.try_send();
    tag
  }

  fn try_send(&mut self) {
    let result = {
      let conn = self.conn.as_mut().unwrap();
      conn.send_want = Interest::default();
      loop {
        let Some(command) = conn.send_queue.front() else {
          break Ok(());
        };
        if command.checkpoints.first() == Some(&conn.send_pos) {
          // Waiting for a continuation request.
          break Ok(());
        }
        let end = command
          .checkpoints
          .first()
          .copied()
          .unwrap_or(command.buffer.len());
        match conn.wire.send(&command.buffer[conn.send_pos..end]) {
          Ok(Progress::Ready(n)) => {
            conn.send_pos += n;
            if conn.send_pos >= command.buffer.len() {
              conn.send_queue.pop_front();
              conn.send_pos = 0;
            }
          }
          Ok(Progress::Want(interest)) => {
            conn.send_want = interest;
            break Ok(());
          }
          Err(error) => break Err(error),
        }
      }
      .and_then(|()| match conn.wire.flush() {
        Ok(Progress::Ready(())) => Ok(()),
        Ok(Progress::Want(interest)) => {
          conn.send_want = conn.send_want.union(interest);
          Ok(())
        }
        Err(error) => Err(error),
      })
    };
    if let Err(error) = result {
      self.report(&format!("Send failed: '{error}'"), Level::Error);
      self.teardown();
    }
  }

  /// The server acknowledged a literal (or IDLE decided to end): cross the
  /// current checkpoint and resume sending.
  pub(crate) fn continue_cmd(&mut self) -> bool {
    {
      let conn = self.conn.as_mut().unwrap();
      let Some(command) = conn.send_queue.front_mut() else {
        return false;
      };
      if command.checkpoints.is_empty() {
        return false;
      }
      command.checkpoints.remove(0);
    }
    self.try_send();
    true
  }

  // Receive pipeline.

  fn try_recv(&mut self) {
    enum Outcome {
      Eof,
      Data,
      Blocked,
      Failed(Error),
    }
    let mut buffer = [0; RECV_BUFFER];
    loop {
      let outcome = {
        let Some(conn) = self.conn.as_mut() else {
          return;
        };
        conn.recv_want = Interest::default();
        match conn.wire.recv(&mut buffer) {
          Ok(Progress::Ready(0)) => Outcome::Eof,
          Ok(Progress::Ready(n)) => {
            conn.scanner.feed(&buffer[..n]);
            Outcome::Data
          }
          Ok(Progress::Want(interest)) => {
            conn.recv_want = interest;
            Outcome::Blocked
          }
          Err(error) => Outcome::Failed(error),
        }
      };
      match outcome {
        Outcome::Eof => {
          self.report("Disconnected", Level::Error);
          self.teardown();
          return;
        }
        Outcome::Data => self.drain_responses(),
        Outcome::Blocked => return,
        Outcome::Failed(error) => {
          self.report(&format!("Receive failed: '{error}'"), Level::Error);
          self.teardown();
          return;
        }
      }
    }
  }

  fn drain_responses(&mut self) {
    loop {
      let Some(conn) = self.conn.as_mut() else {
        return;
      };
      let (response, consumed) = match conn.scanner.line() {
        Err(Error::ShortRead { .. }) => return,
        Err(_) => unreachable!(),
        Ok(line) => {
          log::debug!("< {}", preview(line));
          (crate::imap::parser::parse(line), line.len())
        }
      };
      conn.scanner.commit(consumed);
      match response {
        Ok(response) => self.process_response(response),
        Err(error) => {
          // A broken server stream is unrecoverable mid-line.
          log::error!("{error}");
          self.report("Malformed server response", Level::Error);
          self.teardown();
          return;
        }
      }
    }
  }

  fn process_response(&mut self, response: Response) {
    match response {
      Response::Continue(_) => self.dispatch_continue(),
      Response::Tagged(tagged) => {
        let pending = {
          let conn = self.conn.as_mut().unwrap();
          match conn.tagged.iter().position(|(tag, _)| *tag == tagged.tag) {
            Some(position) => conn.tagged.remove(position).1,
            None => {
              log::error!("response for unknown tag {:?}", tagged.tag);
              self.report("Protocol error", Level::Error);
              self.teardown();
              return;
            }
          }
        };
        self.run_tagged(pending, Some(&tagged));
      }
      Response::Untagged(untagged) => self.dispatch_untagged(untagged),
    }
  }

  fn dispatch_continue(&mut self) {
    let handlers = self.conn.as_ref().unwrap().continue_handlers.handlers();
    for handler in handlers {
      let handled = match handler {
        Handler::Idle => self.idle_continue(),
        Handler::Connection => self.continue_cmd(),
        other => panic!("{other:?} doesn't handle continuations"),
      };
      if handled {
        return;
      }
    }
    // Nothing expected a continuation: the server lost the plot.
    self.report("Unexpected continuation request", Level::Error);
    self.teardown();
  }

  fn dispatch_untagged(&mut self, untagged: Untagged) {
    let kind = untagged.kind();
    let handlers = self
      .conn
      .as_ref()
      .unwrap()
      .untagged
      .get(&kind)
      .map(Stack::handlers)
      .unwrap_or_default();
    for handler in handlers {
      if self.handle_untagged(handler, &untagged) {
        return;
      }
    }
    panic!("unhandled untagged response {untagged:?}");
  }

  fn handle_untagged(&mut self, handler: Handler, untagged: &Untagged) -> bool {
    match handler {
      Handler::Connection => false,
      Handler::Greeting => self.greeting_untagged(untagged),
      Handler::NotAuthenticated => self.not_authenticated_untagged(untagged),
      Handler::Authenticated => self.authenticated_untagged(untagged),
      Handler::Selected => self.selected_untagged(untagged),
      Handler::List => self.list_untagged(untagged),
      Handler::PopulateUnseen => self.populate_unseen_untagged(untagged),
      Handler::Fetch => self.fetch_untagged(untagged),
      Handler::Idle => self.idle_untagged(untagged),
    }
  }

  fn run_tagged(&mut self, pending: PendingTag, response: Option<&crate::imap::types::Tagged>) {
    match pending.cont {
      Cont::Capability => self.on_capability_done(response),
      Cont::Login => self.on_login_done(response),
      Cont::List => self.on_list_done(response),
      Cont::StatusCmd => self.on_status_done(response),
      Cont::Examine => self.on_examine_done(response),
      Cont::EsearchAll => self.on_esearch_done(response, true),
      Cont::EsearchUnseen => self.on_esearch_done(response, false),
      Cont::FetchUids => self.on_fetch_uids_done(response),
      Cont::FetchDetails => self.on_fetch_details_done(response),
      Cont::FetchWork => self.on_fetch_work_done(response),
      Cont::Close => self.on_close_done(response),
      Cont::Check => self.on_check_done(response),
      Cont::Noop => self.on_noop_done(response),
      Cont::IdleCmd => self.on_idle_cmd_done(response),
      Cont::Logout => self.on_logout_done(response),
    }
    self.dec(pending.owner);
  }

  // Disconnection: every pending tagged handler sees the `disconnected`
  // sentinel (response = None) exactly once, every pending unit unwinds,
  // queued work fails and a reconnect is scheduled unless the user quit.

  pub(crate) fn teardown(&mut self) {
    let Some(mut conn) = self.conn.take() else {
      return;
    };
    self.deadlines.clear(Timer::Connect);
    self.deadlines.clear(Timer::Handshake);
    self.deadlines.clear(Timer::Idle);
    // Uncommitted cache work from an interrupted flow is abandoned.
    if let Err(error) = self.cache.rollback() {
      log::error!("rollback failed: {error}");
    }
    for (_, pending) in conn.tagged.drain(..) {
      self.run_tagged(pending, None);
    }
    // States hold one "until we change state" unit; connect stages hold one
    // "until established" unit. Sub-operations only hold command units,
    // already unwound by the sentinels above.
    match std::mem::replace(&mut conn.phase, session::Phase::Down) {
      session::Phase::Down | session::Phase::NotAuthenticated { .. } => (),
      session::Phase::Connecting { op }
      | session::Phase::Handshaking { op }
      | session::Phase::Greeting { op, .. } => self.dec(op),
      session::Phase::Authenticated(state) => self.dec(state.op),
      session::Phase::Selected(state) => self.dec(state.op),
    }
    self.dec(conn.op); // The "until the socket disconnects" unit.
  }

  fn connection_closed(&mut self) {
    // Leak check: the whole operation tree must have unwound with the
    // connection.
    self.ops.assert_drained();
    if let Err(error) = self.cache.commit() {
      log::error!("commit failed: {error}");
    }
    self.queue.clear_waiter();
    self.queue.fail_all();
    if self.terminate || self.queue.is_quit() {
      self.quit = true;
      return;
    }
    self.schedule_reconnect();
  }

  fn schedule_reconnect(&mut self) {
    self.report("Reconnecting shortly", Level::Info);
    self
      .deadlines
      .set(Timer::Reconnect, time::Instant::now() + RECONNECT_DELAY);
  }

  // Test and display introspection.

  pub fn live_operations(&self) -> usize {
    self.ops.live()
  }

  pub fn state_name(&self) -> Option<&'static str> {
    self.conn.as_ref().map(|conn| conn.phase.name())
  }

  pub fn reconnect_pending(&self) -> bool {
    self.conn.is_none() && !self.quit && !self.deadlines.is_empty()
  }
}

// Real wires: a non-blocking TCP stream, optionally wrapped in rustls.

pub struct TcpWire {
  stream: net::TcpStream,
  connected: bool,
}

impl TcpWire {
  fn connect_tcp(&mut self) -> Result<Progress> {
    if self.connected {
      return Ok(Progress::Ready(()));
    }
    if let Some(error) = self.stream.take_error()? {
      return Err(error.into());
    }
    match self.stream.peer_addr() {
      Ok(_) => {
        self.connected = true;
        Ok(Progress::Ready(()))
      }
      Err(error) if error.kind() == io::ErrorKind::NotConnected => {
        Ok(Progress::Want(Interest::WRITABLE))
      }
      Err(error) => Err(error.into()),
    }
  }
}

impl Wire for TcpWire {
  fn fd(&self) -> Option<RawFd> {
    Some(self.stream.as_raw_fd())
  }

  fn phase(&self) -> WirePhase {
    if self.connected {
      WirePhase::Established
    } else {
      WirePhase::Tcp
    }
  }

  fn connect(&mut self) -> Result<Progress> {
    self.connect_tcp()
  }

  fn recv(&mut self, buffer: &mut [u8]) -> Result<Progress<usize>> {
    match io::Read::read(&mut self.stream, buffer) {
      Ok(n) => Ok(Progress::Ready(n)),
      Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
        Ok(Progress::Want(Interest::READABLE))
      }
      Err(error) => Err(error.into()),
    }
  }

  fn send(&mut self, buffer: &[u8]) -> Result<Progress<usize>> {
    match io::Write::write(&mut self.stream, buffer) {
      Ok(n) => Ok(Progress::Ready(n)),
      Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
        Ok(Progress::Want(Interest::WRITABLE))
      }
      Err(error) => Err(error.into()),
    }
  }

  fn flush(&mut self) -> Result<Progress> {
    Ok(Progress::Ready(()))
  }
}

pub struct TlsWire {
  tcp: TcpWire,
  tls: rustls::ClientConnection,
}

impl TlsWire {
  /// Feed TLS records from the socket into rustls.
  fn pump_read(&mut self) -> Result<Progress<usize>> {
    match self.tls.read_tls(&mut self.tcp.stream) {
      Ok(n) => {
        if n > 0 {
          self
            .tls
            .process_new_packets()
            .map_err(|error| Error::Transport(error.to_string()))?;
        }
        Ok(Progress::Ready(n))
      }
      Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
        Ok(Progress::Want(Interest::READABLE))
      }
      Err(error) => Err(error.into()),
    }
  }
}

impl Wire for TlsWire {
  fn fd(&self) -> Option<RawFd> {
    self.tcp.fd()
  }

  fn phase(&self) -> WirePhase {
    if !self.tcp.connected {
      WirePhase::Tcp
    } else if self.tls.is_handshaking() {
      WirePhase::Tls
    } else {
      WirePhase::Established
    }
  }

  fn connect(&mut self) -> Result<Progress> {
    if let Progress::Want(interest) = self.tcp.connect_tcp()? {
      return Ok(Progress::Want(interest));
    }
    while self.tls.is_handshaking() {
      if self.tls.wants_write() {
        match self.tls.write_tls(&mut self.tcp.stream) {
          Ok(_) => continue,
          Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
            return Ok(Progress::Want(Interest::WRITABLE));
          }
          Err(error) => return Err(error.into()),
        }
      }
      match self.pump_read()? {
        Progress::Ready(0) => {
          return Err(Error::Transport("end of stream during TLS handshake".to_string()));
        }
        Progress::Ready(_) => (),
        Progress::Want(interest) => return Ok(Progress::Want(interest)),
      }
    }
    Ok(Progress::Ready(()))
  }

  fn recv(&mut self, buffer: &mut [u8]) -> Result<Progress<usize>> {
    loop {
      match io::Read::read(&mut self.tls.reader(), buffer) {
        Ok(n) => return Ok(Progress::Ready(n)),
        Err(error) if error.kind() == io::ErrorKind::WouldBlock => match self.pump_read()? {
          Progress::Ready(0) => return Ok(Progress::Ready(0)),
          Progress::Ready(_) => continue,
          Progress::Want(interest) => return Ok(Progress::Want(interest)),
        },
        Err(error) => return Err(error.into()),
      }
    }
  }

  fn send(&mut self, buffer: &[u8]) -> Result<Progress<usize>> {
    let n = io::Write::write(&mut self.tls.writer(), buffer)?;
    Ok(Progress::Ready(n))
  }

  fn flush(&mut self) -> Result<Progress> {
    while self.tls.wants_write() {
      match self.tls.write_tls(&mut self.tcp.stream) {
        Ok(_) => (),
        Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
          return Ok(Progress::Want(Interest::WRITABLE));
        }
        Err(error) => return Err(error.into()),
      }
    }
    Ok(Progress::Ready(()))
  }
}

/// Plain TCP dialer.
pub struct TcpOpen {
  pub host: String,
  pub port: u16,
}

impl TcpOpen {
  fn dial(&self) -> Result<TcpWire> {
    use std::net::ToSocketAddrs as _;
    let address = (self.host.as_str(), self.port)
      .to_socket_addrs()
      .map_err(Error::from)?
      .next()
      .ok_or_else(|| Error::Transport(format!("couldn't resolve {}:{}", self.host, self.port)))?;
    log::debug!("connecting to {address:?}");
    let stream = crate::event::connect(&address)
      .map_err(|error| Error::Transport(format!("{error:#}")))?;
    Ok(TcpWire {
      stream,
      connected: false,
    })
  }
}

impl Open for TcpOpen {
  type Wire = TcpWire;

  fn open(&self) -> Result<TcpWire> {
    self.dial()
  }
}

/// TLS dialer over `TcpOpen`, trusting the platform's certificate store.
pub struct TlsOpen(pub TcpOpen);

impl Open for TlsOpen {
  type Wire = TlsWire;

  fn open(&self) -> Result<TlsWire> {
    let tcp = self.0.dial()?;
    let mut roots = rustls::RootCertStore::empty();
    for certificate in rustls_native_certs::load_native_certs()
      .map_err(|error| Error::Transport(error.to_string()))?
    {
      roots
        .add(&rustls::Certificate(certificate.0))
        .map_err(|error| Error::Transport(error.to_string()))?;
    }
    let config = rustls::ClientConfig::builder()
      .with_safe_defaults()
      .with_root_certificates(roots)
      .with_no_client_auth();
    let name = self
      .0
      .host
      .as_str()
      .try_into()
      .map_err(|_| Error::Transport(format!("couldn't convert {} to server name", self.0.host)))?;
    let tls = rustls::ClientConnection::new(sync::Arc::new(config), name)?;
    Ok(TlsWire { tcp, tls })
  }
}

/// The configured way to reach the server.
pub fn opener(host: &str, port: u16, ssl: bool) -> EitherOpen {
  let tcp = TcpOpen {
    host: host.to_string(),
    port,
  };
  if ssl {
    EitherOpen::Tls(TlsOpen(tcp))
  } else {
    EitherOpen::Tcp(tcp)
  }
}

pub enum EitherOpen {
  Tcp(TcpOpen),
  Tls(TlsOpen),
}

pub enum EitherWire {
  Tcp(TcpWire),
  Tls(TlsWire),
}

impl Open for EitherOpen {
  type Wire = EitherWire;

  fn open(&self) -> Result<EitherWire> {
    match self {
      EitherOpen::Tcp(open) => Ok(EitherWire::Tcp(open.open()?)),
      EitherOpen::Tls(open) => Ok(EitherWire::Tls(open.open()?)),
    }
  }
}

impl Wire for EitherWire {
  fn fd(&self) -> Option<RawFd> {
    match self {
      EitherWire::Tcp(wire) => wire.fd(),
      EitherWire::Tls(wire) => wire.fd(),
    }
  }

  fn phase(&self) -> WirePhase {
    match self {
      EitherWire::Tcp(wire) => wire.phase(),
      EitherWire::Tls(wire) => wire.phase(),
    }
  }

  fn connect(&mut self) -> Result<Progress> {
    match self {
      EitherWire::Tcp(wire) => wire.connect(),
      EitherWire::Tls(wire) => wire.connect(),
    }
  }

  fn recv(&mut self, buffer: &mut [u8]) -> Result<Progress<usize>> {
    match self {
      EitherWire::Tcp(wire) => wire.recv(buffer),
      EitherWire::Tls(wire) => wire.recv(buffer),
    }
  }

  fn send(&mut self, buffer: &[u8]) -> Result<Progress<usize>> {
    match self {
      EitherWire::Tcp(wire) => wire.send(buffer),
      EitherWire::Tls(wire) => wire.send(buffer),
    }
  }

  fn flush(&mut self) -> Result<Progress> {
    match self {
      EitherWire::Tcp(wire) => wire.flush(),
      EitherWire::Tls(wire) => wire.flush(),
    }
  }
}
