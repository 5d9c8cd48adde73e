// Connection phases up to (and around) mailbox selection: greeting,
// capability/login, the authenticated work loop and the LIST refresh that
// can run under either the Authenticated or the Selected state.

use crate::engine::{cache_must, Client, Cont, Handler, Level, Open, Status};
use crate::cache::MailboxPatch;
use crate::imap::types::{Capability, Code, StatusAttribute, Untagged};
use crate::imap::{decode_mailbox_name, formatter};
use crate::operation::{Kind, OpId};
use crate::work::{Waiter, Work};
use std::mem;

#[derive(Debug)]
pub(crate) enum Phase {
  /// Between states (transition in progress, or no session yet).
  Down,
  Connecting { op: OpId },
  Handshaking { op: OpId },
  Greeting { op: OpId, result: Option<GreetingResult> },
  NotAuthenticated { op: OpId, authed: bool },
  Authenticated(AuthState),
  Selected(Box<super::selected::SelState>),
}

impl Phase {
  pub(crate) fn name(&self) -> &'static str {
    match self {
      Phase::Down => "down",
      Phase::Connecting { .. } => "connecting",
      Phase::Handshaking { .. } => "handshaking",
      Phase::Greeting { .. } => "greeting",
      Phase::NotAuthenticated { .. } => "not-authenticated",
      Phase::Authenticated(_) => "authenticated",
      Phase::Selected(_) => "selected",
    }
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum GreetingResult {
  Ok,
  PreAuth,
  Bye,
}

#[derive(Debug)]
pub(crate) struct AuthState {
  pub(crate) op: OpId,
  /// Untagged data collected while an EXAMINE is in flight.
  pub(crate) examining: Option<Examining>,
  /// The EXAMINE succeeded; where the Selected state starts from.
  pub(crate) next: Option<Examining>,
  pub(crate) logged_out: bool,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct Examining {
  pub(crate) raw: Vec<u8>,
  pub(crate) name: String,
  pub(crate) exists: u32,
  pub(crate) recent: Option<u32>,
  pub(crate) uidvalidity: Option<u32>,
}

#[derive(Debug)]
pub(crate) struct ListOp {
  pub(crate) op: OpId,
  pub(crate) list_status: bool,
  /// STATUS data for the currently selected mailbox is ignored:
  /// EXISTS/EXPUNGE take precedence.
  pub(crate) exclude: Option<String>,
}

impl<O: Open, S: Status> Client<O, S> {
  // Greeting: wait for exactly one untagged OK, PREAUTH or BYE.

  pub(crate) fn enter_greeting(&mut self) {
    self.report("Connected", Level::Info);
    {
      let Self { conn, ops, .. } = self;
      let conn = conn.as_mut().unwrap();
      let op = ops.alloc(Kind::Greeting, Some(conn.op));
      ops.inc(op); // Until the greeting arrives.
      conn.phase = Phase::Greeting { op, result: None };
      conn.register(Handler::Greeting);
    }
    self.try_recv();
  }

  pub(crate) fn greeting_untagged(&mut self, untagged: &Untagged) -> bool {
    let (result, rejection) = match untagged {
      Untagged::Ok(_) => (GreetingResult::Ok, None),
      Untagged::PreAuth(_) => (GreetingResult::PreAuth, None),
      Untagged::Bye(text) => (GreetingResult::Bye, Some(text.text.clone())),
      _ => return false,
    };
    let op = {
      let conn = self.conn.as_mut().unwrap();
      let Phase::Greeting { op, result: slot } = &mut conn.phase else {
        return false;
      };
      *slot = Some(result);
      *op
    };
    if let Some(text) = rejection {
      self.report(
        &format!("Rejected by server: '{}'", text.unwrap_or_default()),
        Level::Error,
      );
    }
    self.dec(op);
    true
  }

  pub(crate) fn greeting_done(&mut self) {
    let Some(conn) = self.conn.as_mut() else {
      return;
    };
    conn.unregister(Handler::Greeting);
    let Phase::Greeting { result, .. } = mem::replace(&mut conn.phase, Phase::Down) else {
      unreachable!();
    };
    match result {
      Some(GreetingResult::Ok) => self.enter_not_authenticated(),
      Some(GreetingResult::PreAuth) => self.enter_authenticated(),
      Some(GreetingResult::Bye) | None => {
        self.terminate = true;
        self.teardown();
      }
    }
  }

  // NotAuthenticated: check capabilities, then LOGIN.

  fn enter_not_authenticated(&mut self) {
    let op = {
      let Self { conn, ops, .. } = self;
      let conn = conn.as_mut().unwrap();
      let op = ops.alloc(Kind::NotAuthenticated, Some(conn.op));
      conn.phase = Phase::NotAuthenticated { op, authed: false };
      conn.register(Handler::NotAuthenticated);
      op
    };
    self.send_cmd(op, Cont::Capability, formatter::capability);
  }

  pub(crate) fn not_authenticated_untagged(&mut self, untagged: &Untagged) -> bool {
    match untagged {
      Untagged::Capability(capabilities) => {
        self.conn.as_mut().unwrap().capabilities = capabilities.clone();
        true
      }
      Untagged::Bye(text) => {
        let text = text.text.clone().unwrap_or_default();
        self.report(&format!("Rejected by server: '{text}'"), Level::Error);
        true
      }
      _ => false,
    }
  }

  pub(crate) fn on_capability_done(&mut self, response: Option<&crate::imap::types::Tagged>) {
    use crate::imap::types::Condition;
    let Some(response) = response else {
      return; // Disconnected.
    };
    if response.condition != Condition::Ok {
      self.report("IMAP command failed", Level::Error);
      return;
    }
    let (op, missing) = {
      let conn = self.conn.as_ref().unwrap();
      let Phase::NotAuthenticated { op, .. } = &conn.phase else {
        unreachable!();
      };
      let op = *op;
      let missing = if !conn.have_capability(&Capability::Imap4Rev1) {
        Some("Server is missing IMAP4rev1 capability")
      } else if !conn.have_capability(&Capability::AuthPlain)
        || conn.have_capability(&Capability::LoginDisabled)
      {
        Some("Cannot authenticate")
      } else {
        None
      };
      (op, missing)
    };
    if let Some(message) = missing {
      self.report(message, Level::Error);
      return;
    }
    self.report("Authenticating...", Level::Info);
    let user = self.user.as_bytes().to_vec();
    let password = self.password.as_bytes().to_vec();
    self.send_cmd(op, Cont::Login, |tag| formatter::login(tag, &user, &password));
  }

  pub(crate) fn on_login_done(&mut self, response: Option<&crate::imap::types::Tagged>) {
    use crate::imap::types::Condition;
    let Some(response) = response else {
      return;
    };
    if response.condition == Condition::Ok {
      self.report("Login succeeded", Level::Info);
      let conn = self.conn.as_mut().unwrap();
      // The capability set usually changes across login; servers commonly
      // piggyback the new one on the tagged OK.
      if let Some(Code::Capability(capabilities)) = &response.text.code {
        conn.capabilities = capabilities.clone();
      }
      if let Phase::NotAuthenticated { authed, .. } = &mut conn.phase {
        *authed = true;
      }
    } else {
      self.report("Login failed", Level::Error);
    }
  }

  pub(crate) fn not_authenticated_done(&mut self) {
    let Some(conn) = self.conn.as_mut() else {
      return;
    };
    conn.unregister(Handler::NotAuthenticated);
    let Phase::NotAuthenticated { authed, .. } = mem::replace(&mut conn.phase, Phase::Down) else {
      unreachable!();
    };
    if authed {
      self.enter_authenticated();
    } else {
      self.terminate = true;
      self.teardown();
    }
  }

  // Authenticated: pull work until something selects a mailbox or logs out.

  pub(crate) fn enter_authenticated(&mut self) {
    {
      let Self { conn, ops, .. } = self;
      let conn = conn.as_mut().unwrap();
      let op = ops.alloc(Kind::Authenticated, Some(conn.op));
      ops.inc(op); // Until we change state.
      conn.phase = Phase::Authenticated(AuthState {
        op,
        examining: None,
        next: None,
        logged_out: false,
      });
      conn.register(Handler::Authenticated);
    }
    self.process_work_authenticated();
  }

  pub(crate) fn process_work_authenticated(&mut self) {
    let Some(conn) = self.conn.as_ref() else {
      return;
    };
    let Phase::Authenticated(state) = &conn.phase else {
      return;
    };
    let op = state.op;
    if conn.list.is_some() {
      return; // The list refresh resumes the loop when it finishes.
    }
    match self.queue.get_work().cloned() {
      None => self.queue.wait_for_work(Waiter::Authenticated),
      Some(Work::Logout) => {
        self.report("Logging out", Level::Info);
        self.send_cmd(op, Cont::Logout, formatter::logout);
      }
      Some(Work::RefreshList) => self.start_list(op, None),
      Some(Work::Select(mailbox)) => {
        let name = decode_mailbox_name(&mailbox);
        self.report(&format!("Selecting {name}..."), Level::Info);
        {
          let conn = self.conn.as_mut().unwrap();
          let Phase::Authenticated(state) = &mut conn.phase else {
            unreachable!();
          };
          state.examining = Some(Examining {
            raw: mailbox.clone(),
            name,
            ..Examining::default()
          });
        }
        // EXAMINE, not SELECT: this core never mutates server state.
        self.send_cmd(op, Cont::Examine, |tag| formatter::examine(tag, &mailbox));
      }
      Some(work) => panic!("{work:?} while authenticated"),
    }
  }

  pub(crate) fn authenticated_untagged(&mut self, untagged: &Untagged) -> bool {
    let conn = self.conn.as_mut().unwrap();
    let Phase::Authenticated(state) = &mut conn.phase else {
      return false;
    };
    match untagged {
      Untagged::Bye(_) => {
        state.logged_out = true;
        true
      }
      // Sizes and flags of the mailbox being examined.
      Untagged::Exists(n) => {
        if let Some(examining) = &mut state.examining {
          examining.exists = *n;
        }
        true
      }
      Untagged::Recent(n) => {
        if let Some(examining) = &mut state.examining {
          examining.recent = Some(*n);
        }
        true
      }
      Untagged::Flags(_) => true,
      Untagged::Ok(text) => {
        if let (Some(Code::UidValidity(uidvalidity)), Some(examining)) =
          (&text.code, &mut state.examining)
        {
          examining.uidvalidity = Some(*uidvalidity);
        }
        true
      }
      _ => false,
    }
  }

  pub(crate) fn on_examine_done(&mut self, response: Option<&crate::imap::types::Tagged>) {
    use crate::imap::types::Condition;
    let Some(response) = response else {
      return;
    };
    let (op, examining) = {
      let conn = self.conn.as_mut().unwrap();
      let Phase::Authenticated(state) = &mut conn.phase else {
        unreachable!();
      };
      (state.op, state.examining.take())
    };
    let work = self.queue.get_work().cloned().unwrap();
    match response.condition {
      Condition::Ok => {
        let conn = self.conn.as_mut().unwrap();
        let Phase::Authenticated(state) = &mut conn.phase else {
          unreachable!();
        };
        state.next = examining;
        self.queue.finish_work(&work);
        self.dec(op); // Change state.
      }
      Condition::No => {
        let name = examining.map(|examining| examining.name).unwrap_or_default();
        self.report(&format!("Could not open {name}"), Level::Error);
        self.queue.fail_selected_work(&work);
        self.process_work_authenticated();
      }
      Condition::Bad => {
        self.report("IMAP command failed", Level::Error);
        self.queue.fail_work(&work);
        self.process_work_authenticated();
      }
    }
  }

  pub(crate) fn on_logout_done(&mut self, response: Option<&crate::imap::types::Tagged>) {
    use crate::imap::types::Condition;
    let Some(response) = response else {
      return;
    };
    let op = {
      let conn = self.conn.as_ref().unwrap();
      let Phase::Authenticated(state) = &conn.phase else {
        unreachable!();
      };
      state.op
    };
    if response.condition == Condition::Ok {
      self.queue.finish_work(&Work::Logout);
      let conn = self.conn.as_mut().unwrap();
      if let Phase::Authenticated(state) = &mut conn.phase {
        state.logged_out = true;
      }
      self.dec(op); // Change state (to termination).
    } else {
      self.report("IMAP command failed", Level::Error);
      self.queue.fail_work(&Work::Logout);
      self.process_work_authenticated();
    }
  }

  pub(crate) fn authenticated_done(&mut self) {
    let Some(conn) = self.conn.as_mut() else {
      return;
    };
    conn.unregister(Handler::Authenticated);
    let Phase::Authenticated(state) = mem::replace(&mut conn.phase, Phase::Down) else {
      unreachable!();
    };
    if let Some(next) = state.next {
      self.enter_selected(next);
    } else {
      // Logged out (or the server said BYE): wind the connection down.
      self.teardown();
    }
  }

  // LIST refresh, shared by the Authenticated and Selected work loops.

  pub(crate) fn start_list(&mut self, parent: OpId, exclude: Option<String>) {
    self.report("Refreshing mailbox list...", Level::Info);
    cache_must(self.cache.create_temp_mailbox_list());
    let (op, items) = {
      let Self { conn, ops, .. } = self;
      let conn = conn.as_mut().unwrap();
      let list_status = conn.have_capability(&Capability::ListStatus);
      let op = ops.alloc(Kind::List, Some(parent));
      conn.list = Some(ListOp {
        op,
        list_status,
        exclude,
      });
      conn.register(Handler::List);
      let items: &[StatusAttribute] = if list_status {
        &[StatusAttribute::Messages, StatusAttribute::Unseen]
      } else {
        &[]
      };
      (op, items)
    };
    self.send_cmd(op, Cont::List, |tag| formatter::list(tag, b"", b"*", items));
  }

  pub(crate) fn list_untagged(&mut self, untagged: &Untagged) -> bool {
    match untagged {
      Untagged::List(list) => {
        let name = decode_mailbox_name(&list.mailbox);
        if cache_must(self.cache.has_mailbox(&name)) {
          cache_must(self.cache.update_mailbox(
            &name,
            &MailboxPatch {
              delimiter: list.delimiter,
              attributes: Some(&list.attributes),
              ..MailboxPatch::default()
            },
          ));
        } else {
          cache_must(self.cache.add_mailbox(
            &name,
            &list.mailbox,
            list.delimiter,
            &list.attributes,
          ));
        }
        cache_must(self.cache.add_listing_mailbox(&name));
        let (op, wants_status) = {
          let conn = self.conn.as_ref().unwrap();
          let list_op = conn.list.as_ref().unwrap();
          let wants_status = !list_op.list_status
            && list_op.exclude.as_deref() != Some(name.as_str())
            && cache_must(self.cache.can_select(&name));
          (list_op.op, wants_status)
        };
        if wants_status {
          // Without LIST-STATUS this costs one STATUS round-trip per
          // selectable mailbox.
          let mailbox = list.mailbox.clone();
          self.send_cmd(op, Cont::StatusCmd, |tag| {
            formatter::status(
              tag,
              &mailbox,
              &[StatusAttribute::Messages, StatusAttribute::Unseen],
            )
          });
        }
        true
      }
      Untagged::Status(data) => {
        let name = decode_mailbox_name(&data.mailbox);
        {
          let conn = self.conn.as_ref().unwrap();
          let list_op = conn.list.as_ref().unwrap();
          if list_op.exclude.as_deref() == Some(name.as_str()) {
            return true;
          }
        }
        let mut patch = MailboxPatch::default();
        for (attribute, value) in &data.items {
          match attribute {
            StatusAttribute::Messages => patch.exists = Some(*value as u32),
            StatusAttribute::Unseen => patch.unseen = Some(*value as u32),
            _ => (),
          }
        }
        if cache_must(self.cache.has_mailbox(&name)) {
          cache_must(self.cache.update_mailbox(&name, &patch));
        }
        true
      }
      _ => false,
    }
  }

  pub(crate) fn on_list_done(&mut self, response: Option<&crate::imap::types::Tagged>) {
    use crate::imap::types::Condition;
    let Some(response) = response else {
      return;
    };
    if response.condition == Condition::Ok {
      cache_must(self.cache.delete_unlisted_mailboxes());
      cache_must(self.cache.drop_temp_mailbox_list());
      cache_must(self.cache.commit());
      self.report("Refreshed mailbox list", Level::Info);
    } else {
      cache_must(self.cache.drop_temp_mailbox_list());
      self.report("IMAP command failed", Level::Error);
    }
  }

  pub(crate) fn on_status_done(&mut self, response: Option<&crate::imap::types::Tagged>) {
    use crate::imap::types::Condition;
    let Some(response) = response else {
      return;
    };
    if response.condition != Condition::Ok {
      self.report("IMAP command failed", Level::Error);
    }
  }

  pub(crate) fn list_done(&mut self) {
    let Some(conn) = self.conn.as_mut() else {
      return;
    };
    conn.unregister(Handler::List);
    conn.list = None;
    self.queue.finish_work(&Work::RefreshList);
    let Some(conn) = self.conn.as_ref() else {
      return;
    };
    match &conn.phase {
      Phase::Authenticated(_) => self.process_work_authenticated(),
      Phase::Selected(_) => self.process_work_selected(),
      _ => (),
    }
  }
}
