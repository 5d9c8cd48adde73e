use std::collections::VecDeque;

/// High-level intents the UI (or quit handling) wants carried out against
/// the connection, in the order the state machine consumes them. The last
/// three kinds only make sense in the Selected state; a failed selection
/// drops exactly those.
#[derive(Clone, Debug, PartialEq)]
pub enum Work {
  Logout,
  RefreshList,
  Select(Vec<u8>),
  Close,
  FetchBodystructure(u32),
  FetchBodySections(u32, Vec<String>),
}

impl Work {
  pub fn is_selected_state(&self) -> bool {
    matches!(
      self,
      Work::Close | Work::FetchBodystructure(_) | Work::FetchBodySections(..)
    )
  }
}

/// Who is waiting for work to arrive; at most one waiter at a time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Waiter {
  Authenticated,
  Selected,
  Idle,
}

/// FIFO of work items feeding the state machine. `selected` optimistically
/// tracks the mailbox the queue's tail will leave selected, so repeated
/// selections of the same mailbox coalesce away.
#[derive(Debug, Default)]
pub struct Queue {
  queue: VecDeque<Work>,
  pub selected: Option<Vec<u8>>,
  quit: bool,
  waiter: Option<Waiter>,
}

impl Queue {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn have_work(&self) -> bool {
    !self.queue.is_empty()
  }

  pub fn get_work(&self) -> Option<&Work> {
    self.queue.front()
  }

  pub fn finish_work(&mut self, work: &Work) {
    assert_eq!(Some(work), self.queue.front());
    self.queue.pop_front();
  }

  /// A work item failed for a reason local to it; drop it.
  pub fn fail_work(&mut self, work: &Work) {
    log::warn!("failing {work:?}");
    self.finish_work(work);
  }

  /// The selection this item belonged to is gone (EXAMINE was refused, or
  /// Gmail silently demoted us to Authenticated): discard the failed item
  /// and every selected-state item queued behind it up to the next `Select`,
  /// preserving anything state-independent by stacking it back at the head.
  pub fn fail_selected_work(&mut self, work: &Work) {
    assert_eq!(Some(work), self.queue.front());
    self.queue.pop_front();
    let mut preserved = Vec::new();
    while let Some(next) = self.queue.front() {
      if matches!(next, Work::Select(_)) {
        break;
      }
      let next = self.queue.pop_front().unwrap();
      if !next.is_selected_state() {
        preserved.push(next);
      }
    }
    // The mailbox this queue was driving toward survives only if another
    // selection is still queued behind the failure.
    if !matches!(self.queue.front(), Some(Work::Select(_))) {
      self.selected = None;
    }
    for work in preserved.into_iter().rev() {
      self.queue.push_front(work);
    }
  }

  /// The connection died: everything still queued fails.
  pub fn fail_all(&mut self) {
    if !self.queue.is_empty() {
      log::warn!("failing {} queued work item(s)", self.queue.len());
    }
    self.queue.clear();
    self.selected = None;
  }

  pub fn wait_for_work(&mut self, waiter: Waiter) {
    assert_eq!(None, self.waiter, "{waiter:?} displacing a waiter");
    self.waiter = Some(waiter);
  }

  pub fn cancel_wait(&mut self, waiter: Waiter) {
    assert_eq!(Some(waiter), self.waiter);
    self.waiter = None;
  }

  /// Disconnection forcibly unwinds whatever was waiting.
  pub fn clear_waiter(&mut self) {
    self.waiter = None;
  }

  pub fn waiter_is(&self, waiter: Waiter) -> bool {
    self.waiter == Some(waiter)
  }

  /// Hand back the registered waiter once there is work for it.
  pub fn signal(&mut self) -> Option<Waiter> {
    if self.queue.is_empty() {
      return None;
    }
    self.waiter.take()
  }

  pub fn is_quit(&self) -> bool {
    self.quit
  }

  pub fn quit(&mut self) {
    self.quit = true;
    if self.selected.take().is_some() {
      self.queue.push_back(Work::Close);
    }
    self.queue.push_back(Work::Logout);
  }

  pub fn refresh_mailbox_list(&mut self) {
    // Back-to-back refreshes coalesce.
    if self.queue.back() == Some(&Work::RefreshList) {
      return;
    }
    self.queue.push_back(Work::RefreshList);
  }

  pub fn select_mailbox(&mut self, mailbox: &[u8]) {
    if self.selected.as_deref() == Some(mailbox) {
      return;
    }
    if self.selected.is_some() {
      self.queue.push_back(Work::Close);
    }
    self.queue.push_back(Work::Select(mailbox.to_vec()));
    self.selected = Some(mailbox.to_vec());
  }

  pub fn fetch_bodystructure(&mut self, uid: u32) {
    self.queue.push_back(Work::FetchBodystructure(uid));
  }

  pub fn fetch_body_sections(&mut self, uid: u32, sections: Vec<String>) {
    self.queue.push_back(Work::FetchBodySections(uid, sections));
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  fn contents(queue: &Queue) -> Vec<Work> {
    queue.queue.iter().cloned().collect()
  }

  #[test]
  fn refresh_coalesces() {
    let mut queue = Queue::new();
    queue.refresh_mailbox_list();
    queue.refresh_mailbox_list();
    assert_eq!(vec![Work::RefreshList], contents(&queue));
  }

  #[test]
  fn select_tracks_optimistically() {
    let mut queue = Queue::new();
    queue.select_mailbox(b"INBOX");
    queue.select_mailbox(b"INBOX"); // Dropped.
    queue.select_mailbox(b"Trash"); // Closes INBOX first.
    assert_eq!(
      vec![
        Work::Select(b"INBOX".to_vec()),
        Work::Close,
        Work::Select(b"Trash".to_vec()),
      ],
      contents(&queue)
    );
    assert_eq!(Some(&b"Trash"[..]), queue.selected.as_deref());
  }

  #[test]
  fn quit_closes_first() {
    let mut queue = Queue::new();
    queue.select_mailbox(b"INBOX");
    queue.quit();
    assert_eq!(
      vec![
        Work::Select(b"INBOX".to_vec()),
        Work::Close,
        Work::Logout,
      ],
      contents(&queue)
    );
    assert!(queue.is_quit());
  }

  #[test]
  fn failed_select_drops_downstream_selected_work() {
    // The EXAMINE was refused with the failed Select at the head and a
    // fetch plus a later refresh queued behind it: the fetch targeted the
    // failed mailbox and dies with it, the refresh survives.
    let mut queue = Queue::new();
    queue.select_mailbox(b"Trash");
    queue.fetch_bodystructure(7);
    queue.refresh_mailbox_list();
    let work = queue.get_work().unwrap().clone();
    assert_eq!(Work::Select(b"Trash".to_vec()), work);

    queue.fail_selected_work(&work);
    assert_eq!(vec![Work::RefreshList], contents(&queue));
    // The queue drained of selection work, so nothing is selected anymore.
    assert_eq!(None, queue.selected);
  }

  #[test]
  fn failed_select_stops_at_next_select() {
    let mut queue = Queue::new();
    queue.select_mailbox(b"Trash");
    queue.fetch_bodystructure(7);
    queue.select_mailbox(b"INBOX");
    let work = queue.get_work().unwrap().clone();

    queue.fail_selected_work(&work);
    // The Close queued before Select(INBOX) is selected-state and dies; the
    // later selection stays, and so does the optimistic `selected`.
    assert_eq!(vec![Work::Select(b"INBOX".to_vec())], contents(&queue));
    assert_eq!(Some(&b"INBOX"[..]), queue.selected.as_deref());
  }

  #[test]
  fn single_waiter() {
    let mut queue = Queue::new();
    queue.wait_for_work(Waiter::Selected);
    assert_eq!(None, queue.signal()); // No work yet.
    queue.refresh_mailbox_list();
    assert_eq!(Some(Waiter::Selected), queue.signal());
    assert_eq!(None, queue.signal()); // One-shot.
  }

  #[test]
  #[should_panic]
  fn two_waiters() {
    let mut queue = Queue::new();
    queue.wait_for_work(Waiter::Selected);
    queue.wait_for_work(Waiter::Idle);
  }
}
