// Client-command serialization. Every formatter appends one whole command
// (tag through CRLF) and records the continuation checkpoints: byte offsets
// the sender must not cross until the server has answered with a
// continuation request. A checkpoint follows every literal header, and IDLE
// places one between "IDLE\r\n" and "DONE\r\n" so the DONE is held back
// until the client decides to leave.

use crate::imap::types::StatusAttribute;

#[derive(Debug, PartialEq)]
pub struct Command {
  pub buffer: Vec<u8>,
  pub checkpoints: Vec<usize>,
  /// Suppresses logging of the payload (passwords).
  pub sensitive: bool,
}

impl Command {
  fn new(tag: &str, name: &str) -> Self {
    let mut command = Command {
      buffer: Vec::new(),
      checkpoints: Vec::new(),
      sensitive: false,
    };
    command.buffer.extend_from_slice(tag.as_bytes());
    command.buffer.push(b' ');
    command.buffer.extend_from_slice(name.as_bytes());
    command
  }

  fn finish(mut self) -> Self {
    self.buffer.extend_from_slice(b"\r\n");
    self
  }

  fn raw(&mut self, bytes: &[u8]) {
    self.buffer.extend_from_slice(bytes);
  }

  fn number(&mut self, n: u64) {
    self.buffer.extend_from_slice(n.to_string().as_bytes());
  }

  /// astring: an atom when it fits the atom grammar, a quoted string when
  /// printable, a literal otherwise.
  fn astring(&mut self, s: &[u8]) {
    if !s.is_empty() && s.iter().all(|b| is_astring_char(*b)) {
      self.raw(s);
    } else {
      self.string(s);
    }
  }

  /// Mailbox names follow the stricter list grammar (wildcards stay bare so
  /// LIST patterns work).
  fn mailbox(&mut self, s: &[u8]) {
    if !s.is_empty() && s.iter().all(|b| is_list_char(*b)) {
      self.raw(s);
    } else {
      self.string(s);
    }
  }

  fn string(&mut self, s: &[u8]) {
    if s.is_empty() {
      self.raw(b"\"\"");
    } else if s.iter().all(|b| is_text_char(*b)) {
      self.raw(b"\"");
      for b in s {
        if *b == b'\\' || *b == b'"' {
          self.buffer.push(b'\\');
        }
        self.buffer.push(*b);
      }
      self.raw(b"\"");
    } else {
      self.raw(b"{");
      self.number(s.len() as u64);
      self.raw(b"}\r\n");
      self.checkpoints.push(self.buffer.len());
      self.raw(s);
    }
  }

  fn sequence_set(&mut self, set: &[SeqRange]) {
    for (i, range) in set.iter().enumerate() {
      if i != 0 {
        self.raw(b",");
      }
      match range {
        SeqRange::Single(n) => self.number(*n as u64),
        SeqRange::Range(start, end) => {
          match start {
            Some(start) => self.number(*start as u64),
            None => self.raw(b"*"),
          }
          self.raw(b":");
          match end {
            Some(end) => self.number(*end as u64),
            None => self.raw(b"*"),
          }
        }
      }
    }
  }

  fn paren_list<T>(&mut self, items: &[T], mut format: impl FnMut(&mut Self, &T)) {
    self.raw(b"(");
    for (i, item) in items.iter().enumerate() {
      if i != 0 {
        self.raw(b" ");
      }
      format(self, item);
    }
    self.raw(b")");
  }

  fn date(&mut self, date: &chrono::NaiveDate) {
    self.raw(date.format("%d-%b-%Y").to_string().as_bytes());
  }
}

// astring chars: no parens, braces, space, CTLs, wildcards, quote,
// backslash or 8-bit (']' is fine).
fn is_astring_char(b: u8) -> bool {
  !matches!(b, b'(' | b')' | b'{' | b' ' | b'%' | b'*' | b'"' | b'\\' | 0..=0x1f | 0x7f..)
}

// The list grammar additionally permits the wildcards.
fn is_list_char(b: u8) -> bool {
  !matches!(b, b'(' | b')' | b'{' | b' ' | b'"' | b'\\' | 0..=0x1f | 0x7f..)
}

fn is_text_char(b: u8) -> bool {
  !matches!(b, b'\0' | b'\r' | b'\n' | 0x7f..)
}

/// One element of a sequence set; an absent bound is the `*` wildcard.
#[derive(Clone, Debug, PartialEq)]
pub enum SeqRange {
  Single(u32),
  Range(Option<u32>, Option<u32>),
}

pub fn ranges(ranges: &[(u32, u32)]) -> Vec<SeqRange> {
  ranges
    .iter()
    .map(|(start, end)| {
      if start == end {
        SeqRange::Single(*start)
      } else {
        SeqRange::Range(Some(*start), Some(*end))
      }
    })
    .collect()
}

/// FETCH data items this client requests.
#[derive(Clone, Debug, PartialEq)]
pub enum FetchAtt {
  Envelope,
  Flags,
  InternalDate,
  Rfc822Size,
  BodyStructure,
  Uid,
  XGmMsgid,
  XGmThrid,
  XGmLabels,
  /// BODY.PEEK[section]: fetch without implicitly setting \Seen.
  BodyPeek(String),
}

impl FetchAtt {
  fn format(&self, command: &mut Command) {
    match self {
      FetchAtt::Envelope => command.raw(b"ENVELOPE"),
      FetchAtt::Flags => command.raw(b"FLAGS"),
      FetchAtt::InternalDate => command.raw(b"INTERNALDATE"),
      FetchAtt::Rfc822Size => command.raw(b"RFC822.SIZE"),
      FetchAtt::BodyStructure => command.raw(b"BODYSTRUCTURE"),
      FetchAtt::Uid => command.raw(b"UID"),
      FetchAtt::XGmMsgid => command.raw(b"X-GM-MSGID"),
      FetchAtt::XGmThrid => command.raw(b"X-GM-THRID"),
      FetchAtt::XGmLabels => command.raw(b"X-GM-LABELS"),
      FetchAtt::BodyPeek(section) => {
        command.raw(b"BODY.PEEK[");
        command.raw(section.as_bytes());
        command.raw(b"]");
      }
    }
  }
}

/// SEARCH keys (RFC 3501 §6.4.4 plus MODSEQ and X-GM-RAW). The enum is
/// closed: a key this client can't format doesn't exist.
#[derive(Clone, Debug, PartialEq)]
pub enum SearchKey {
  All,
  Answered,
  Deleted,
  Draft,
  Flagged,
  New,
  Old,
  Recent,
  Seen,
  Unanswered,
  Undeleted,
  Undraft,
  Unflagged,
  Unseen,
  Bcc(Vec<u8>),
  Body(Vec<u8>),
  Cc(Vec<u8>),
  From(Vec<u8>),
  Subject(Vec<u8>),
  Text(Vec<u8>),
  To(Vec<u8>),
  Before(chrono::NaiveDate),
  On(chrono::NaiveDate),
  Since(chrono::NaiveDate),
  SentBefore(chrono::NaiveDate),
  SentOn(chrono::NaiveDate),
  SentSince(chrono::NaiveDate),
  Header(Vec<u8>, Vec<u8>),
  Keyword(String),
  Unkeyword(String),
  Larger(u32),
  Smaller(u32),
  ModSeq(u64),
  Not(Box<SearchKey>),
  Or(Box<SearchKey>, Box<SearchKey>),
  Uid(Vec<SeqRange>),
  Seq(Vec<SeqRange>),
  XGmRaw(Vec<u8>),
}

fn format_search_key(command: &mut Command, key: &SearchKey) {
  let simple = |command: &mut Command, name: &str| {
    command.raw(b" ");
    command.raw(name.as_bytes());
  };
  let stringy = |command: &mut Command, name: &str, s: &[u8]| {
    simple(command, name);
    command.raw(b" ");
    command.astring(s);
  };
  let dated = |command: &mut Command, name: &str, date: &chrono::NaiveDate| {
    simple(command, name);
    command.raw(b" ");
    command.date(date);
  };
  match key {
    SearchKey::All => simple(command, "ALL"),
    SearchKey::Answered => simple(command, "ANSWERED"),
    SearchKey::Deleted => simple(command, "DELETED"),
    SearchKey::Draft => simple(command, "DRAFT"),
    SearchKey::Flagged => simple(command, "FLAGGED"),
    SearchKey::New => simple(command, "NEW"),
    SearchKey::Old => simple(command, "OLD"),
    SearchKey::Recent => simple(command, "RECENT"),
    SearchKey::Seen => simple(command, "SEEN"),
    SearchKey::Unanswered => simple(command, "UNANSWERED"),
    SearchKey::Undeleted => simple(command, "UNDELETED"),
    SearchKey::Undraft => simple(command, "UNDRAFT"),
    SearchKey::Unflagged => simple(command, "UNFLAGGED"),
    SearchKey::Unseen => simple(command, "UNSEEN"),
    SearchKey::Bcc(s) => stringy(command, "BCC", s),
    SearchKey::Body(s) => stringy(command, "BODY", s),
    SearchKey::Cc(s) => stringy(command, "CC", s),
    SearchKey::From(s) => stringy(command, "FROM", s),
    SearchKey::Subject(s) => stringy(command, "SUBJECT", s),
    SearchKey::Text(s) => stringy(command, "TEXT", s),
    SearchKey::To(s) => stringy(command, "TO", s),
    SearchKey::Before(d) => dated(command, "BEFORE", d),
    SearchKey::On(d) => dated(command, "ON", d),
    SearchKey::Since(d) => dated(command, "SINCE", d),
    SearchKey::SentBefore(d) => dated(command, "SENTBEFORE", d),
    SearchKey::SentOn(d) => dated(command, "SENTON", d),
    SearchKey::SentSince(d) => dated(command, "SENTSINCE", d),
    SearchKey::Header(field, s) => {
      simple(command, "HEADER");
      command.raw(b" ");
      command.astring(field);
      command.raw(b" ");
      command.astring(s);
    }
    SearchKey::Keyword(k) => {
      simple(command, "KEYWORD");
      command.raw(b" ");
      command.raw(k.as_bytes());
    }
    SearchKey::Unkeyword(k) => {
      simple(command, "UNKEYWORD");
      command.raw(b" ");
      command.raw(k.as_bytes());
    }
    SearchKey::Larger(n) => {
      simple(command, "LARGER");
      command.raw(b" ");
      command.number(*n as u64);
    }
    SearchKey::Smaller(n) => {
      simple(command, "SMALLER");
      command.raw(b" ");
      command.number(*n as u64);
    }
    SearchKey::ModSeq(n) => {
      simple(command, "MODSEQ");
      command.raw(b" ");
      command.number(*n);
    }
    SearchKey::Not(key) => {
      simple(command, "NOT");
      format_search_key(command, key);
    }
    SearchKey::Or(first, second) => {
      simple(command, "OR");
      format_search_key(command, first);
      format_search_key(command, second);
    }
    SearchKey::Uid(set) => {
      simple(command, "UID");
      command.raw(b" ");
      command.sequence_set(set);
    }
    SearchKey::Seq(set) => {
      command.raw(b" ");
      command.sequence_set(set);
    }
    SearchKey::XGmRaw(s) => {
      simple(command, "X-GM-RAW");
      command.raw(b" ");
      command.string(s);
    }
  }
}

pub fn capability(tag: &str) -> Command {
  Command::new(tag, "CAPABILITY").finish()
}

pub fn noop(tag: &str) -> Command {
  Command::new(tag, "NOOP").finish()
}

pub fn check(tag: &str) -> Command {
  Command::new(tag, "CHECK").finish()
}

pub fn close(tag: &str) -> Command {
  Command::new(tag, "CLOSE").finish()
}

pub fn logout(tag: &str) -> Command {
  Command::new(tag, "LOGOUT").finish()
}

/// IDLE plus a held-back DONE (requires the IDLE capability).
pub fn idle(tag: &str) -> Command {
  let mut command = Command::new(tag, "IDLE");
  command.raw(b"\r\n");
  command.checkpoints.push(command.buffer.len());
  command.raw(b"DONE");
  command.finish()
}

/// ENABLE (requires the ENABLE capability).
pub fn enable(tag: &str, capabilities: &[&str]) -> Command {
  let mut command = Command::new(tag, "ENABLE");
  for capability in capabilities {
    command.raw(b" ");
    command.raw(capability.as_bytes());
  }
  command.finish()
}

pub fn login(tag: &str, username: &[u8], password: &[u8]) -> Command {
  let mut command = Command::new(tag, "LOGIN");
  command.raw(b" ");
  command.astring(username);
  command.raw(b" ");
  command.astring(password);
  command.sensitive = true;
  command.finish()
}

pub fn examine(tag: &str, mailbox: &[u8]) -> Command {
  let mut command = Command::new(tag, "EXAMINE");
  command.raw(b" ");
  command.mailbox(mailbox);
  command.finish()
}

pub fn select(tag: &str, mailbox: &[u8]) -> Command {
  let mut command = Command::new(tag, "SELECT");
  command.raw(b" ");
  command.mailbox(mailbox);
  command.finish()
}

/// LIST, with piggybacked STATUS items when the server has LIST-STATUS.
pub fn list(
  tag: &str,
  reference: &[u8],
  pattern: &[u8],
  status_items: &[StatusAttribute],
) -> Command {
  let mut command = Command::new(tag, "LIST");
  command.raw(b" ");
  command.mailbox(reference);
  command.raw(b" ");
  command.mailbox(pattern);
  if !status_items.is_empty() {
    command.raw(b" RETURN (STATUS ");
    command.paren_list(status_items, |command, item| command.raw(item.name().as_bytes()));
    command.raw(b")");
  }
  command.finish()
}

pub fn status(tag: &str, mailbox: &[u8], items: &[StatusAttribute]) -> Command {
  let mut command = Command::new(tag, "STATUS");
  command.raw(b" ");
  command.mailbox(mailbox);
  command.raw(b" ");
  command.paren_list(items, |command, item| command.raw(item.name().as_bytes()));
  command.finish()
}

pub fn fetch(
  tag: &str,
  set: &[SeqRange],
  items: &[FetchAtt],
  uid: bool,
  changedsince: Option<u64>,
) -> Command {
  let mut command = Command::new(tag, if uid { "UID FETCH" } else { "FETCH" });
  command.raw(b" ");
  command.sequence_set(set);
  command.raw(b" ");
  if let [item] = items {
    item.format(&mut command);
  } else {
    command.paren_list(items, |command, item| item.format(command));
  }
  if let Some(changedsince) = changedsince {
    command.raw(b" (CHANGEDSINCE ");
    command.number(changedsince);
    command.raw(b")");
  }
  command.finish()
}

/// SEARCH; `esearch` adds a RETURN list (requires the ESEARCH capability;
/// empty means RETURN ()).
pub fn search(tag: &str, keys: &[SearchKey], uid: bool, esearch: Option<&[&str]>) -> Command {
  let mut command = Command::new(tag, if uid { "UID SEARCH" } else { "SEARCH" });
  if let Some(items) = esearch {
    command.raw(b" RETURN (");
    command.raw(items.join(" ").as_bytes());
    command.raw(b")");
  }
  for key in keys {
    format_search_key(&mut command, key);
  }
  command.finish()
}
