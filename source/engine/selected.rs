// The Selected state: prime the in-memory UID array and unseen set, then
// service work in priority order: queued intents first, newly arrived
// messages next, the disconnected backfill after that, and IDLE (or a plain
// block on the queue) when there is nothing else to do.

use crate::cache::{MailboxPatch, MessagePatch};
use crate::engine::{cache_must, Client, Cont, Handler, Level, Open, Status, Timer};
use crate::engine::session::{Examining, Phase};
use crate::imap::formatter::{self, FetchAtt, SeqRange};
use crate::imap::types::{Capability, Code, Fetch, Untagged};
use crate::imap::{mailbox_label, sequence_set};
use crate::operation::{Kind, OpId};
use crate::seque::SequenceQueue;
use crate::work::{Waiter, Work};
use std::collections::BTreeSet;
use std::{mem, time};

/// Messages fetched per backfill round; new arrivals always preempt the
/// next round.
const BACKFILL_BATCH: usize = 250;

#[derive(Debug)]
pub(crate) struct SelState {
  pub(crate) op: OpId,
  pub(crate) raw: Vec<u8>,
  pub(crate) name: String,
  /// Sequence number -> UID; slot 0 is unused and 0 means not learned yet.
  pub(crate) uids: Vec<u32>,
  pub(crate) unseen: BTreeSet<u32>,
  pub(crate) exists: u32,
  pub(crate) uidvalidity: Option<u32>,
  /// Sequence numbers EXISTS announced but we haven't fetched yet.
  pub(crate) seque: SequenceQueue,
  /// Backfill cursor: the next round covers uid-array indices below this.
  pub(crate) backfill: usize,
  pub(crate) unseen_op: Option<UnseenOp>,
  pub(crate) fetch: Option<FetchOp>,
  pub(crate) idle: Option<IdleOp>,
  pub(crate) check: Option<CheckOrig>,
  pub(crate) closed: bool,
}

#[derive(Debug)]
pub(crate) struct UnseenOp {
  tag_all: String,
  tag_unseen: String,
  all: Option<Vec<u32>>,
  unseen: Option<Vec<u32>>,
  bad: bool,
}

#[derive(Debug)]
pub(crate) struct FetchOp {
  op: OpId,
  kind: FetchKind,
  stage: FetchStage,
  /// UIDs the server reported that were already bound in the cache. They
  /// stay in the scratch table until the missing-UID clamp has run, then
  /// are dropped so only new bindings get inserted.
  old_uids: BTreeSet<u32>,
  bad: bool,
}

#[derive(Debug)]
enum FetchKind {
  /// Learn UIDs and gm_msgids of messages beyond the known tail.
  New,
  /// Reconcile one older slice of the mailbox with the cache.
  Backfill { uid_lo: u32, uid_hi: u32 },
}

#[derive(Debug, PartialEq)]
enum FetchStage {
  Uids,
  Details,
}

#[derive(Debug)]
pub(crate) struct IdleOp {
  got_continue: bool,
  done: bool,
  bad: bool,
}

/// Context of the BAD response that triggered the CHECK probe.
#[derive(Debug)]
pub(crate) struct CheckOrig {
  work: Option<Work>,
}

/// Read-only view for the display layer (and tests).
#[derive(Debug, PartialEq)]
pub struct SelectedSnapshot {
  pub name: String,
  pub exists: u32,
  pub uids: Vec<u32>,
  pub unseen: Vec<u32>,
}

impl<O: Open, S: Status> Client<O, S> {
  pub fn selected(&self) -> Option<SelectedSnapshot> {
    let conn = self.conn.as_ref()?;
    let Phase::Selected(sel) = &conn.phase else {
      return None;
    };
    Some(SelectedSnapshot {
      name: sel.name.clone(),
      exists: sel.exists,
      uids: sel.uids[1..].to_vec(),
      unseen: sel.unseen.iter().copied().collect(),
    })
  }

  pub(crate) fn enter_selected(&mut self, target: Examining) {
    // A changed UIDVALIDITY invalidates every cached UID for this mailbox;
    // drop the bindings and let the priming and backfill rebuild them.
    let cached = cache_must(self.cache.mailbox_uidvalidity(&target.name));
    if let (Some(fresh), Some(cached)) = (target.uidvalidity, cached) {
      if fresh != cached {
        self.report(
          &format!("{} changed on the server; refetching", target.name),
          Level::Info,
        );
        cache_must(self.cache.delete_mailbox_uids(&target.name));
      }
    }
    cache_must(self.cache.update_mailbox(
      &target.name,
      &MailboxPatch {
        exists: Some(target.exists),
        recent: target.recent,
        uidvalidity: target.uidvalidity,
        ..MailboxPatch::default()
      },
    ));
    self.report(&format!("Selected {}", target.name), Level::Info);
    {
      let Self { conn, ops, .. } = self;
      let conn = conn.as_mut().unwrap();
      let op = ops.alloc(Kind::Selected, Some(conn.op));
      ops.inc(op); // Until we change state.
      conn.phase = Phase::Selected(Box::new(SelState {
        op,
        raw: target.raw,
        name: target.name,
        uids: vec![0],
        unseen: BTreeSet::new(),
        exists: target.exists,
        uidvalidity: target.uidvalidity,
        seque: SequenceQueue::new(),
        backfill: 1,
        unseen_op: None,
        fetch: None,
        idle: None,
        check: None,
        closed: false,
      }));
      conn.register(Handler::Selected);
    }
    self.start_populate_unseen();
  }

  // Entry priming: the full UID array and the unseen set, two searches.

  fn start_populate_unseen(&mut self) {
    let (sel_op, esearch) = {
      let conn = self.conn.as_ref().unwrap();
      let Phase::Selected(sel) = &conn.phase else {
        unreachable!();
      };
      (sel.op, conn.have_capability(&Capability::Esearch))
    };
    let op = {
      let Self { conn, ops, .. } = self;
      let conn = conn.as_mut().unwrap();
      let op = ops.alloc(Kind::PopulateUnseen, Some(sel_op));
      conn.register(Handler::PopulateUnseen);
      op
    };
    let ret: Option<&[&str]> = if esearch { Some(&["ALL"]) } else { None };
    let tag_all = self.send_cmd(op, Cont::EsearchAll, |tag| {
      formatter::search(tag, &[formatter::SearchKey::All], true, ret)
    });
    let tag_unseen = self.send_cmd(op, Cont::EsearchUnseen, |tag| {
      formatter::search(tag, &[formatter::SearchKey::Unseen], true, ret)
    });
    let Some(conn) = self.conn.as_mut() else {
      return; // The send failed and tore the connection down.
    };
    let Phase::Selected(sel) = &mut conn.phase else {
      unreachable!();
    };
    sel.unseen_op = Some(UnseenOp {
      tag_all,
      tag_unseen,
      all: None,
      unseen: None,
      bad: false,
    });
  }

  pub(crate) fn populate_unseen_untagged(&mut self, untagged: &Untagged) -> bool {
    let conn = self.conn.as_mut().unwrap();
    let Phase::Selected(sel) = &mut conn.phase else {
      return false;
    };
    let Some(unseen_op) = &mut sel.unseen_op else {
      return false;
    };
    match untagged {
      Untagged::Esearch(esearch) => {
        let numbers = esearch.all_numbers();
        match &esearch.tag {
          Some(tag) if *tag == unseen_op.tag_all => unseen_op.all = Some(numbers),
          Some(tag) if *tag == unseen_op.tag_unseen => unseen_op.unseen = Some(numbers),
          // No correlator: commands were issued in order, so results
          // arrive in order.
          _ if unseen_op.all.is_none() => unseen_op.all = Some(numbers),
          _ => unseen_op.unseen = Some(numbers),
        }
        true
      }
      Untagged::Search(numbers) => {
        let numbers = numbers.iter().copied().collect();
        if unseen_op.all.is_none() {
          unseen_op.all = Some(numbers);
        } else {
          unseen_op.unseen = Some(numbers);
        }
        true
      }
      _ => false,
    }
  }

  pub(crate) fn on_esearch_done(
    &mut self,
    response: Option<&crate::imap::types::Tagged>,
    _all: bool,
  ) {
    use crate::imap::types::Condition;
    let Some(response) = response else {
      return;
    };
    if response.condition != Condition::Ok {
      let conn = self.conn.as_mut().unwrap();
      if let Phase::Selected(sel) = &mut conn.phase {
        if let Some(unseen_op) = &mut sel.unseen_op {
          unseen_op.bad = true;
        }
      }
    }
  }

  pub(crate) fn populate_unseen_done(&mut self) {
    let Some(conn) = self.conn.as_mut() else {
      return;
    };
    conn.unregister(Handler::PopulateUnseen);
    let Phase::Selected(sel) = &mut conn.phase else {
      return;
    };
    let unseen_op = sel.unseen_op.take().unwrap();
    if unseen_op.bad {
      self.report("Could not search unseen messages", Level::Error);
      self.gmail_hack(None);
      return;
    }
    let all = unseen_op.all.unwrap_or_default();
    let (name, exists, unseen_count) = {
      let conn = self.conn.as_mut().unwrap();
      let Phase::Selected(sel) = &mut conn.phase else {
        unreachable!();
      };
      sel.uids = std::iter::once(0).chain(all.iter().copied()).collect();
      sel.exists = all.len() as u32;
      sel.unseen = unseen_op.unseen.unwrap_or_default().into_iter().collect();
      sel.backfill = sel.uids.len();
      (sel.name.clone(), sel.exists, sel.unseen.len() as u32)
    };
    cache_must(self.cache.update_mailbox(
      &name,
      &MailboxPatch {
        exists: Some(exists),
        unseen: Some(unseen_count),
        ..MailboxPatch::default()
      },
    ));
    cache_must(self.cache.commit());
    self.process_work_selected();
  }

  // The work loop.

  pub(crate) fn process_work_selected(&mut self) {
    let Some(conn) = self.conn.as_ref() else {
      return;
    };
    let Phase::Selected(sel) = &conn.phase else {
      return;
    };
    if sel.unseen_op.is_some()
      || sel.fetch.is_some()
      || sel.idle.is_some()
      || sel.check.is_some()
      || conn.list.is_some()
    {
      return; // Whatever is running resumes the loop when it finishes.
    }
    let op = sel.op;
    let idle = conn.have_capability(&Capability::Idle);
    let (new_pending, backfill) = (!sel.seque.is_empty(), sel.backfill > 1);
    match self.queue.get_work().cloned() {
      Some(Work::RefreshList) => {
        let exclude = {
          let conn = self.conn.as_ref().unwrap();
          let Phase::Selected(sel) = &conn.phase else {
            unreachable!();
          };
          Some(sel.name.clone())
        };
        self.start_list(op, exclude);
      }
      Some(Work::Close) => {
        self.send_cmd(op, Cont::Close, formatter::close);
      }
      Some(Work::FetchBodystructure(uid)) => {
        self.send_cmd(op, Cont::FetchWork, |tag| {
          formatter::fetch(
            tag,
            &[SeqRange::Single(uid)],
            &[FetchAtt::BodyStructure],
            true,
            None,
          )
        });
      }
      Some(Work::FetchBodySections(uid, sections)) => {
        let items = sections
          .iter()
          .map(|section| FetchAtt::BodyPeek(section.clone()))
          .collect::<Vec<_>>();
        self.send_cmd(op, Cont::FetchWork, |tag| {
          formatter::fetch(tag, &[SeqRange::Single(uid)], &items, true, None)
        });
      }
      Some(work) => panic!("{work:?} while selected"),
      None => {
        if new_pending {
          self.start_fetch_new();
        } else if backfill {
          self.start_backfill();
        } else if idle {
          self.start_idle();
        } else {
          self.queue.wait_for_work(Waiter::Selected);
        }
      }
    }
  }

  // New-message fetch: learn the UIDs and gm_msgids past the known tail,
  // then fetch envelopes for unseen messages and flags for known ones.

  fn start_fetch_new(&mut self) {
    let (sel_op, name, start_uid, pending) = {
      let conn = self.conn.as_mut().unwrap();
      let Phase::Selected(sel) = &mut conn.phase else {
        unreachable!();
      };
      let pending = sel.seque.len();
      let _ = sel.seque.get(u32::MAX); // One round drains everything queued.
      let start_uid = sel
        .uids
        .iter()
        .rev()
        .find(|uid| **uid != 0)
        .map(|uid| uid + 1)
        .unwrap_or(1);
      (sel.op, sel.name.clone(), start_uid, pending)
    };
    self.report(&format!("Fetching {name} ({pending})"), Level::Info);
    cache_must(self.cache.create_temp_fetching_table(&name));
    let op = self.start_fetch_op(sel_op, FetchKind::New);
    self.send_cmd(op, Cont::FetchUids, |tag| {
      formatter::fetch(
        tag,
        &[SeqRange::Range(Some(start_uid), None)],
        &[FetchAtt::XGmMsgid],
        true,
        None,
      )
    });
  }

  fn start_backfill(&mut self) {
    let (sel_op, name, uid_lo, uid_hi, count) = {
      let conn = self.conn.as_mut().unwrap();
      let Phase::Selected(sel) = &mut conn.phase else {
        unreachable!();
      };
      let hi_index = sel.backfill - 1;
      let lo_index = sel.backfill.saturating_sub(BACKFILL_BATCH).max(1);
      let (uid_lo, uid_hi) = (sel.uids[lo_index], sel.uids[hi_index]);
      sel.backfill = lo_index;
      (sel.op, sel.name.clone(), uid_lo, uid_hi, hi_index - lo_index + 1)
    };
    log::debug!("backfilling {name}: {count} message(s) in {uid_lo}:{uid_hi}");
    cache_must(self.cache.create_temp_fetching_table(&name));
    let op = self.start_fetch_op(sel_op, FetchKind::Backfill { uid_lo, uid_hi });
    self.send_cmd(op, Cont::FetchUids, |tag| {
      formatter::fetch(
        tag,
        &[SeqRange::Range(Some(uid_lo), Some(uid_hi))],
        &[FetchAtt::XGmMsgid, FetchAtt::Flags, FetchAtt::XGmLabels],
        true,
        None,
      )
    });
  }

  fn start_fetch_op(&mut self, sel_op: OpId, kind: FetchKind) -> OpId {
    let Self { conn, ops, .. } = self;
    let conn = conn.as_mut().unwrap();
    let op = ops.alloc(Kind::Fetch, Some(sel_op));
    conn.register(Handler::Fetch);
    let Phase::Selected(sel) = &mut conn.phase else {
      unreachable!();
    };
    sel.fetch = Some(FetchOp {
      op,
      kind,
      stage: FetchStage::Uids,
      old_uids: BTreeSet::new(),
      bad: false,
    });
    op
  }

  pub(crate) fn fetch_untagged(&mut self, untagged: &Untagged) -> bool {
    match untagged {
      // Sequence numbers silently shifting under a fetch means the server
      // or this client lost the plot; fail hard before corrupting the
      // cache.
      Untagged::Expunge(_) => panic!("EXPUNGE during FETCH"),
      Untagged::Fetch(fetch) => {
        self.fetch_scratch(fetch);
        // Not claimed: the Selected handler merges flags and unseen
        // bookkeeping for already-bound messages.
        false
      }
      _ => false,
    }
  }

  /// Record one FETCH reply in the scratch table and upsert the message.
  fn fetch_scratch(&mut self, fetch: &Fetch) {
    let Some(uid) = fetch.items.uid else {
      return;
    };
    let raw = {
      let conn = self.conn.as_mut().unwrap();
      let Phase::Selected(sel) = &mut conn.phase else {
        return;
      };
      let Some(fetch_op) = &sel.fetch else {
        return;
      };
      if fetch_op.stage == FetchStage::Uids {
        if matches!(fetch_op.kind, FetchKind::New) {
          let msg = fetch.msg as usize;
          if msg < sel.uids.len() {
            sel.uids[msg] = uid;
          }
        }
        cache_must(self.cache.add_fetching_uid(uid, fetch.items.gm_msgid));
      }
      sel.raw.clone()
    };
    let Some(gm_msgid) = fetch
      .items
      .gm_msgid
      .or_else(|| cache_must(self.cache.fetching_gm_msgid(uid)))
    else {
      return;
    };
    let labels = fetch.items.gm_labels.as_ref().map(|labels| {
      let mut labels = labels.clone();
      if let Some(own) = mailbox_label(&raw) {
        labels.insert(own);
      }
      labels
    });
    if cache_must(self.cache.has_message(gm_msgid)) {
      let patch = MessagePatch {
        bodystructure: fetch.items.bodystructure.as_ref(),
        flags: fetch.items.flags.as_ref(),
        labels: labels.as_ref(),
        modseq: fetch.items.modseq,
      };
      if !patch.is_empty() {
        cache_must(self.cache.update_message(gm_msgid, &patch));
      }
    } else if let Some(envelope) = &fetch.items.envelope {
      cache_must(self.cache.add_message_with_envelope(
        gm_msgid,
        envelope,
        fetch.items.bodystructure.as_ref(),
        fetch.items.flags.as_ref().unwrap_or(&BTreeSet::new()),
        labels.as_ref().unwrap_or(&BTreeSet::new()),
        fetch.items.modseq.unwrap_or(0),
      ));
    }
  }

  pub(crate) fn on_fetch_uids_done(&mut self, response: Option<&crate::imap::types::Tagged>) {
    use crate::imap::types::Condition;
    let Some(response) = response else {
      return;
    };
    if response.condition != Condition::Ok {
      let conn = self.conn.as_mut().unwrap();
      if let Phase::Selected(sel) = &mut conn.phase {
        if let Some(fetch) = &mut sel.fetch {
          fetch.bad = true;
        }
      }
      return;
    }
    let (old_uids, _new_uids) = cache_must(self.cache.get_fetching_old_new_uids());
    let (old_msgids, new_msgids) = cache_must(self.cache.get_fetching_old_new_gm_msgids());
    let (op, is_new) = {
      let conn = self.conn.as_mut().unwrap();
      let Phase::Selected(sel) = &mut conn.phase else {
        return;
      };
      let fetch = sel.fetch.as_mut().unwrap();
      fetch.stage = FetchStage::Details;
      fetch.old_uids = old_uids.clone();
      (fetch.op, matches!(fetch.kind, FetchKind::New))
    };
    if is_new && !old_uids.is_empty() {
      // The first round only asked for X-GM-MSGID; already-bound messages
      // still need their flags refreshed.
      let set = formatter::ranges(&sequence_set(old_uids.iter().copied()));
      self.send_cmd(op, Cont::FetchDetails, |tag| {
        formatter::fetch(
          tag,
          &set,
          &[FetchAtt::Flags, FetchAtt::XGmLabels],
          true,
          None,
        )
      });
    }
    if !new_msgids.is_empty() {
      // Unseen messages: the whole envelope.
      let set = formatter::ranges(&sequence_set(new_msgids.keys().copied()));
      self.send_cmd(op, Cont::FetchDetails, |tag| {
        formatter::fetch(
          tag,
          &set,
          &[FetchAtt::Envelope, FetchAtt::Flags, FetchAtt::XGmLabels],
          true,
          None,
        )
      });
    }
    if is_new {
      // Known messages gaining a new binding here: flags only (the
      // already-bound ones were covered above).
      let uids = old_msgids
        .keys()
        .copied()
        .filter(|uid| !old_uids.contains(uid))
        .collect::<Vec<_>>();
      if !uids.is_empty() {
        let set = formatter::ranges(&sequence_set(uids));
        self.send_cmd(op, Cont::FetchDetails, |tag| {
          formatter::fetch(
            tag,
            &set,
            &[FetchAtt::Flags, FetchAtt::XGmLabels],
            true,
            None,
          )
        });
      }
    }
  }

  pub(crate) fn on_fetch_details_done(&mut self, response: Option<&crate::imap::types::Tagged>) {
    use crate::imap::types::Condition;
    let Some(response) = response else {
      return;
    };
    if response.condition != Condition::Ok {
      let conn = self.conn.as_mut().unwrap();
      if let Phase::Selected(sel) = &mut conn.phase {
        if let Some(fetch) = &mut sel.fetch {
          fetch.bad = true;
        }
      }
    }
  }

  pub(crate) fn fetch_done(&mut self) {
    let Some(conn) = self.conn.as_mut() else {
      return;
    };
    conn.unregister(Handler::Fetch);
    let Phase::Selected(sel) = &mut conn.phase else {
      return;
    };
    let fetch = sel.fetch.take().unwrap();
    let (name, unseen_count) = (sel.name.clone(), sel.unseen.len() as u32);
    if fetch.bad {
      cache_must(self.cache.rollback());
      self.report("Could not fetch messages", Level::Error);
      self.gmail_hack(None);
      return;
    }
    if let FetchKind::Backfill { uid_lo, uid_hi } = fetch.kind {
      // Anything cached in the window the server didn't report was
      // deleted while this client was away. The scratch table still holds
      // every reported UID at this point, bound or not.
      cache_must(self.cache.delete_fetching_missing(uid_lo, uid_hi + 1));
    }
    for uid in &fetch.old_uids {
      // Already bound; only new bindings get inserted.
      cache_must(self.cache.delete_fetching_uid(*uid));
    }
    cache_must(self.cache.add_fetching_uids());
    cache_must(self.cache.drop_temp_fetching_table());
    cache_must(self.cache.update_mailbox(
      &name,
      &MailboxPatch {
        unseen: Some(unseen_count),
        ..MailboxPatch::default()
      },
    ));
    cache_must(self.cache.commit());
    // A NOOP after each batch so messages that arrived mid-fetch are
    // announced before the next backfill round.
    let op = {
      let conn = self.conn.as_ref().unwrap();
      let Phase::Selected(sel) = &conn.phase else {
        unreachable!();
      };
      sel.op
    };
    self.send_cmd(op, Cont::Noop, formatter::noop);
  }

  pub(crate) fn on_noop_done(&mut self, response: Option<&crate::imap::types::Tagged>) {
    use crate::imap::types::Condition;
    let Some(response) = response else {
      return;
    };
    if response.condition != Condition::Ok {
      self.report("IMAP command failed", Level::Error);
    }
    self.process_work_selected();
  }

  // Work-item fetches (BODYSTRUCTURE, body sections).

  pub(crate) fn on_fetch_work_done(&mut self, response: Option<&crate::imap::types::Tagged>) {
    use crate::imap::types::Condition;
    let Some(response) = response else {
      return;
    };
    let work = self.queue.get_work().cloned().unwrap();
    match response.condition {
      Condition::Ok => {
        self.queue.finish_work(&work);
        // Body sections become durable with the metadata describing them.
        cache_must(self.cache.commit());
        self.process_work_selected();
      }
      Condition::Bad => {
        self.report("Could not fetch message", Level::Error);
        self.gmail_hack(Some(work));
      }
      Condition::No => {
        self.report("Could not fetch message", Level::Error);
        self.queue.fail_work(&work);
        self.process_work_selected();
      }
    }
  }

  // CLOSE and the Gmail BAD-after-deletion safety net. Gmail silently drops
  // a client from Selected to Authenticated when the selected mailbox is
  // deleted remotely, after which Selected-only commands answer BAD. A
  // CHECK distinguishes that from a genuine BAD: if the CHECK also answers
  // BAD, we were demoted.

  pub(crate) fn on_close_done(&mut self, response: Option<&crate::imap::types::Tagged>) {
    use crate::imap::types::Condition;
    let Some(response) = response else {
      return;
    };
    match response.condition {
      Condition::Ok => {
        let op = {
          let conn = self.conn.as_mut().unwrap();
          let Phase::Selected(sel) = &mut conn.phase else {
            unreachable!();
          };
          sel.closed = true;
          sel.op
        };
        self.queue.finish_work(&Work::Close);
        self.dec(op); // Change state.
      }
      Condition::Bad => self.gmail_hack(Some(Work::Close)),
      Condition::No => {
        self.report("IMAP command failed", Level::Error);
        self.teardown();
      }
    }
  }

  pub(crate) fn gmail_hack(&mut self, work: Option<Work>) {
    let op = {
      let conn = self.conn.as_mut().unwrap();
      let Phase::Selected(sel) = &mut conn.phase else {
        unreachable!();
      };
      assert!(sel.check.is_none());
      sel.check = Some(CheckOrig { work });
      sel.op
    };
    self.send_cmd(op, Cont::Check, formatter::check);
  }

  pub(crate) fn on_check_done(&mut self, response: Option<&crate::imap::types::Tagged>) {
    use crate::imap::types::Condition;
    let Some(response) = response else {
      return;
    };
    let (op, orig) = {
      let conn = self.conn.as_mut().unwrap();
      let Phase::Selected(sel) = &mut conn.phase else {
        unreachable!();
      };
      (sel.op, sel.check.take().unwrap())
    };
    match response.condition {
      Condition::Ok => {
        // The CHECK went through, so the earlier BAD was legitimate.
        self.report("IMAP command failed", Level::Error);
        match orig.work {
          Some(Work::Close) => panic!("CLOSE failed"),
          Some(work) => self.queue.fail_work(&work),
          None => (),
        }
        self.process_work_selected();
      }
      Condition::Bad => {
        // The CHECK failed too: we were demoted to Authenticated.
        {
          let conn = self.conn.as_mut().unwrap();
          let Phase::Selected(sel) = &mut conn.phase else {
            unreachable!();
          };
          sel.closed = true;
        }
        if let Some(work) = orig.work {
          self.queue.fail_selected_work(&work);
        }
        self.dec(op); // Change state.
      }
      Condition::No => {
        self.report("IMAP command failed", Level::Error);
        if let Some(work) = orig.work {
          self.queue.fail_work(&work);
        }
        self.process_work_selected();
      }
    }
  }

  // IDLE: let the server push updates; leave on work arrival or timeout.

  fn start_idle(&mut self) {
    self.report("Idling", Level::Info);
    let op = {
      let Self { conn, ops, .. } = self;
      let conn = conn.as_mut().unwrap();
      let Phase::Selected(sel) = &conn.phase else {
        unreachable!();
      };
      let op = ops.alloc(Kind::Idle, Some(sel.op));
      conn.register(Handler::Idle);
      conn.continue_handlers.register(Handler::Idle);
      op
    };
    self.send_cmd(op, Cont::IdleCmd, formatter::idle);
    let Some(conn) = self.conn.as_mut() else {
      return; // The send failed and tore the connection down.
    };
    let Phase::Selected(sel) = &mut conn.phase else {
      unreachable!();
    };
    sel.idle = Some(IdleOp {
      got_continue: false,
      done: false,
      bad: false,
    });
    self.queue.wait_for_work(Waiter::Idle);
    self
      .deadlines
      .set(Timer::Idle, time::Instant::now() + super::IDLE_TIMEOUT);
  }

  pub(crate) fn idle_continue(&mut self) -> bool {
    let send_done = {
      let conn = self.conn.as_mut().unwrap();
      let Phase::Selected(sel) = &mut conn.phase else {
        return false;
      };
      let Some(idle) = &mut sel.idle else {
        return false;
      };
      idle.got_continue = true;
      idle.done
    };
    if send_done {
      self.continue_cmd();
    }
    true
  }

  /// Work arrived (or the refresh deadline hit): send DONE to leave IDLE.
  pub(crate) fn idle_interrupt(&mut self) {
    if self.queue.waiter_is(Waiter::Idle) {
      self.queue.cancel_wait(Waiter::Idle);
    }
    self.deadlines.clear(Timer::Idle);
    let send_done = {
      let Some(conn) = self.conn.as_mut() else {
        return;
      };
      let Phase::Selected(sel) = &mut conn.phase else {
        return;
      };
      let Some(idle) = &mut sel.idle else {
        return;
      };
      if idle.done {
        return; // Already leaving.
      }
      idle.done = true;
      idle.got_continue
    };
    if send_done {
      self.continue_cmd();
    }
  }

  pub(crate) fn idle_untagged(&mut self, untagged: &Untagged) -> bool {
    if let Untagged::Exists(n) = untagged {
      let grew = {
        let conn = self.conn.as_ref().unwrap();
        let Phase::Selected(sel) = &conn.phase else {
          return false;
        };
        *n > sel.exists
      };
      if grew {
        self.idle_interrupt();
      }
    }
    // The Selected handler keeps the bookkeeping.
    false
  }

  pub(crate) fn on_idle_cmd_done(&mut self, response: Option<&crate::imap::types::Tagged>) {
    use crate::imap::types::Condition;
    let Some(response) = response else {
      return;
    };
    if response.condition != Condition::Ok {
      let conn = self.conn.as_mut().unwrap();
      if let Phase::Selected(sel) = &mut conn.phase {
        if let Some(idle) = &mut sel.idle {
          idle.bad = response.condition == Condition::Bad;
        }
      }
      self.report("Could not idle", Level::Error);
    }
  }

  pub(crate) fn idle_done(&mut self) {
    let Some(conn) = self.conn.as_mut() else {
      return;
    };
    conn.unregister(Handler::Idle);
    conn.continue_handlers.unregister(Handler::Idle);
    self.deadlines.clear(Timer::Idle);
    if self.queue.waiter_is(Waiter::Idle) {
      self.queue.cancel_wait(Waiter::Idle);
    }
    let conn = self.conn.as_mut().unwrap();
    let Phase::Selected(sel) = &mut conn.phase else {
      return;
    };
    let idle = sel.idle.take().unwrap();
    if idle.bad {
      self.gmail_hack(None);
    } else {
      self.process_work_selected();
    }
  }

  // Unsolicited traffic while Selected.

  pub(crate) fn selected_untagged(&mut self, untagged: &Untagged) -> bool {
    match untagged {
      Untagged::Bye(_) => true,
      Untagged::Flags(_) => true,
      Untagged::Recent(n) => {
        let name = {
          let conn = self.conn.as_ref().unwrap();
          let Phase::Selected(sel) = &conn.phase else {
            return false;
          };
          sel.name.clone()
        };
        cache_must(self.cache.update_mailbox(
          &name,
          &MailboxPatch {
            recent: Some(*n),
            ..MailboxPatch::default()
          },
        ));
        true
      }
      Untagged::Exists(n) => self.selected_exists(*n),
      Untagged::Expunge(n) => self.selected_expunge(*n),
      Untagged::Fetch(fetch) => self.selected_fetch(fetch),
      Untagged::Ok(text) => {
        if let Some(Code::UidValidity(fresh)) = &text.code {
          let stale = {
            let conn = self.conn.as_ref().unwrap();
            let Phase::Selected(sel) = &conn.phase else {
              return true;
            };
            sel.uidvalidity.is_some() && sel.uidvalidity != Some(*fresh)
          };
          if stale {
            // UIDs changing out from under an open mailbox is fatal for
            // this connection; reconnection re-primes from scratch.
            self.report("UIDVALIDITY changed mid-session", Level::Error);
            self.teardown();
          }
        }
        true
      }
      _ => false,
    }
  }

  fn selected_exists(&mut self, n: u32) -> bool {
    let update = {
      let conn = self.conn.as_mut().unwrap();
      let Phase::Selected(sel) = &mut conn.phase else {
        return false;
      };
      if n < sel.exists {
        None
      } else {
        if n > sel.exists {
          if sel.unseen_op.is_some() {
            // Still priming; the searches will return the new truth.
            sel.exists = n;
          } else {
            sel.seque.put(sel.exists + 1, n);
            sel.uids.resize(n as usize + 1, 0);
            sel.exists = n;
            assert_eq!(sel.uids.len() - 1, sel.exists as usize);
          }
        }
        Some((sel.name.clone(), sel.exists))
      }
    };
    match update {
      None => {
        // EXISTS may never shrink without EXPUNGE.
        self.report("Server shrank EXISTS", Level::Error);
        self.teardown();
        true
      }
      Some((name, exists)) => {
        cache_must(self.cache.update_mailbox(
          &name,
          &MailboxPatch {
            exists: Some(exists),
            ..MailboxPatch::default()
          },
        ));
        // New arrivals outrank the backfill; wake the loop if it was
        // blocked on the queue.
        if self.queue.waiter_is(Waiter::Selected) {
          self.queue.cancel_wait(Waiter::Selected);
          self.process_work_selected();
        }
        true
      }
    }
  }

  fn selected_expunge(&mut self, n: u32) -> bool {
    let outcome = {
      let conn = self.conn.as_mut().unwrap();
      let Phase::Selected(sel) = &mut conn.phase else {
        return false;
      };
      if n == 0 || n as usize >= sel.uids.len() {
        None
      } else {
        let uid = sel.uids.remove(n as usize);
        sel.exists -= 1;
        sel.seque.delete(n);
        if (n as usize) < sel.backfill {
          sel.backfill = sel.backfill.saturating_sub(1).max(1);
        }
        if uid != 0 {
          sel.unseen.remove(&uid);
        }
        Some((sel.name.clone(), uid, sel.exists, sel.unseen.len() as u32))
      }
    };
    match outcome {
      None => {
        self.report("EXPUNGE out of range", Level::Error);
        self.teardown();
        true
      }
      Some((name, uid, exists, unseen)) => {
        if uid != 0 {
          if cache_must(self.cache.uid_msgid(&name, uid)).is_some() {
            cache_must(self.cache.delete_mailbox_uid(&name, uid));
          }
        }
        cache_must(self.cache.update_mailbox(
          &name,
          &MailboxPatch {
            exists: Some(exists),
            unseen: Some(unseen),
            ..MailboxPatch::default()
          },
        ));
        cache_must(self.cache.commit());
        true
      }
    }
  }

  /// Merge a FETCH into the cache for a message whose UID is known.
  fn selected_fetch(&mut self, fetch: &Fetch) -> bool {
    let context = {
      let conn = self.conn.as_mut().unwrap();
      let Phase::Selected(sel) = &mut conn.phase else {
        return false;
      };
      let msg = fetch.msg as usize;
      if msg == 0 || msg >= sel.uids.len() {
        log::warn!("FETCH for unknown sequence number {msg}");
        return true;
      }
      let uid = sel.uids[msg];
      if uid == 0 {
        // Not learned yet; the fetch operation scratched what it needs.
        return true;
      }
      if let Some(flags) = &fetch.items.flags {
        if flags.contains("\\Seen") {
          sel.unseen.remove(&uid);
        } else {
          sel.unseen.insert(uid);
        }
      }
      let quiescent = sel.fetch.is_none() && sel.unseen_op.is_none();
      (
        sel.raw.clone(),
        sel.name.clone(),
        uid,
        sel.unseen.len() as u32,
        quiescent,
      )
    };
    let (raw, name, uid, unseen_count, quiescent) = context;
    let labels = fetch.items.gm_labels.as_ref().map(|labels| {
      let mut labels = labels.clone();
      if let Some(own) = mailbox_label(&raw) {
        labels.insert(own);
      }
      labels
    });
    let patch = MessagePatch {
      bodystructure: fetch.items.bodystructure.as_ref(),
      flags: fetch.items.flags.as_ref(),
      labels: labels.as_ref(),
      modseq: fetch.items.modseq,
    };
    if !patch.is_empty() {
      cache_must(self.cache.update_message_by_uid(&name, uid, &patch));
    }
    if !fetch.items.sections.is_empty() {
      cache_must(self.cache.add_body_sections_by_uid(&name, uid, &fetch.items.sections));
    }
    if fetch.items.flags.is_some() {
      cache_must(self.cache.update_mailbox(
        &name,
        &MailboxPatch {
          unseen: Some(unseen_count),
          ..MailboxPatch::default()
        },
      ));
    }
    if quiescent {
      // Unsolicited update (say, during IDLE): make it durable now.
      cache_must(self.cache.commit());
    }
    true
  }

  pub(crate) fn selected_done(&mut self) {
    let Some(conn) = self.conn.as_mut() else {
      return;
    };
    conn.unregister(Handler::Selected);
    let Phase::Selected(sel) = mem::replace(&mut conn.phase, Phase::Down) else {
      unreachable!();
    };
    if !sel.closed {
      log::warn!("leaving {} without CLOSE", sel.name);
    }
    cache_must(self.cache.commit());
    self.enter_authenticated();
  }
}
