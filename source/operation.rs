// Every concurrent activity is an operation: it tracks how many pending
// actions (a child operation, an in-flight tagged command, an event yet to
// arrive) it is still waiting on, and completes exactly once when the count
// returns to zero. A completed child decrements its parent, so a parent
// finishes only after its whole subtree has. Counters are non-atomic (the
// engine is single-threaded) and the accounting is asserted at runtime.

use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpId(usize);

impl fmt::Display for OpId {
  fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
    write!(formatter, "#{}", self.0)
  }
}

/// What an operation is for; the engine dispatches completion on this tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
  Connection,
  TcpConnect,
  TlsHandshake,
  Greeting,
  NotAuthenticated,
  Authenticated,
  Selected,
  List,
  PopulateUnseen,
  Fetch,
  Idle,
}

#[derive(Debug)]
struct Node {
  kind: Kind,
  pending: usize,
  parent: Option<OpId>,
  done: bool,
}

#[derive(Debug, Default)]
pub struct Operations {
  nodes: Vec<Option<Node>>,
  free: Vec<usize>,
}

impl Operations {
  pub fn new() -> Self {
    Self::default()
  }

  /// Allocate an operation. The parent gains one pending unit for the new
  /// child; the caller must add the child's own pending units (at least one)
  /// before returning to the event loop.
  pub fn alloc(&mut self, kind: Kind, parent: Option<OpId>) -> OpId {
    if let Some(parent) = parent {
      self.inc(parent);
    }
    let node = Node {
      kind,
      pending: 0,
      parent,
      done: false,
    };
    let id = match self.free.pop() {
      Some(index) => {
        assert!(self.nodes[index].is_none());
        self.nodes[index] = Some(node);
        OpId(index)
      }
      None => {
        self.nodes.push(Some(node));
        OpId(self.nodes.len() - 1)
      }
    };
    log::debug!("{kind:?} {id} allocated (parent {parent:?})");
    id
  }

  fn node(&self, op: OpId) -> &Node {
    self.nodes[op.0]
      .as_ref()
      .unwrap_or_else(|| panic!("{op} is freed"))
  }

  fn node_mut(&mut self, op: OpId) -> &mut Node {
    self.nodes[op.0]
      .as_mut()
      .unwrap_or_else(|| panic!("{op} is freed"))
  }

  pub fn kind(&self, op: OpId) -> Kind {
    self.node(op).kind
  }

  pub fn parent(&self, op: OpId) -> Option<OpId> {
    self.node(op).parent
  }

  pub fn pending(&self, op: OpId) -> usize {
    self.node(op).pending
  }

  pub fn inc(&mut self, op: OpId) {
    let node = self.node_mut(op);
    assert!(!node.done, "{op} incremented after completion");
    node.pending += 1;
    log::debug!("{:?} {op} +1 = {}", node.kind, node.pending);
  }

  /// Decrement a pending unit. Returns true exactly once, when the count
  /// reaches zero: the owner must then run the operation's completion logic,
  /// free it and decrement its parent.
  #[must_use]
  pub fn dec(&mut self, op: OpId) -> bool {
    let node = self.node_mut(op);
    assert!(!node.done, "{op} decremented after completion");
    assert!(node.pending > 0, "{op} pending would go negative");
    node.pending -= 1;
    log::debug!("{:?} {op} -1 = {}", node.kind, node.pending);
    if node.pending == 0 {
      node.done = true;
      true
    } else {
      false
    }
  }

  pub fn free(&mut self, op: OpId) {
    let node = self.nodes[op.0]
      .take()
      .unwrap_or_else(|| panic!("{op} is already freed"));
    assert!(node.done, "{op} freed while still pending");
    log::debug!("{:?} {op} freed", node.kind);
    self.free.push(op.0);
  }

  pub fn live(&self) -> usize {
    self.nodes.iter().flatten().count()
  }

  /// Leak check: every operation must have completed and been freed by the
  /// time a connection (or the program) winds down.
  pub fn assert_drained(&self) {
    let leaked = self
      .nodes
      .iter()
      .flatten()
      .map(|node| format!("{:?} (pending {})", node.kind, node.pending))
      .collect::<Vec<_>>();
    assert!(leaked.is_empty(), "leaked operations: {leaked:?}");
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn matched_accounting() {
    let mut ops = Operations::new();
    let parent = ops.alloc(Kind::Connection, None);
    ops.inc(parent);
    let child = ops.alloc(Kind::Greeting, Some(parent));
    ops.inc(child);
    ops.inc(child);
    assert_eq!(2, ops.pending(child));

    assert!(!ops.dec(child));
    assert!(ops.dec(child)); // Completes exactly once.
    ops.free(child);

    assert!(!ops.dec(parent)); // The child's unit.
    assert!(ops.dec(parent));
    ops.free(parent);
    ops.assert_drained();
  }

  #[test]
  #[should_panic(expected = "decremented after completion")]
  fn completes_once() {
    let mut ops = Operations::new();
    let op = ops.alloc(Kind::Idle, None);
    ops.inc(op);
    assert!(ops.dec(op));
    // The node completed; another dec is a bug.
    let _ = ops.dec(op);
  }

  #[test]
  #[should_panic(expected = "leaked operations")]
  fn leak_check() {
    let mut ops = Operations::new();
    let op = ops.alloc(Kind::Fetch, None);
    ops.inc(op);
    ops.assert_drained();
  }

  #[test]
  fn slot_reuse() {
    let mut ops = Operations::new();
    let first = ops.alloc(Kind::List, None);
    ops.inc(first);
    assert!(ops.dec(first));
    ops.free(first);
    let second = ops.alloc(Kind::Idle, None);
    assert_eq!(first, second); // Same slot, new identity.
    ops.inc(second);
    assert!(ops.dec(second));
    ops.free(second);
  }
}
