// Typed model of everything the server can send us. Strings stay bytes:
// header values and mailbox names have no reliable charset on the wire and
// decoding them is the display layer's problem.

use std::collections::{BTreeMap, BTreeSet};

/// One parsed response line.
#[derive(Clone, Debug, PartialEq)]
pub enum Response {
  /// `+ ...`: the server is ready for the next literal (or IDLE is active).
  Continue(ResponseText),
  Tagged(Tagged),
  Untagged(Untagged),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Condition {
  Ok,
  No,
  Bad,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Tagged {
  pub tag: String,
  pub condition: Condition,
  pub text: ResponseText,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Untagged {
  Ok(ResponseText),
  No(ResponseText),
  Bad(ResponseText),
  PreAuth(ResponseText),
  Bye(ResponseText),
  Capability(Vec<Capability>),
  Enabled(Vec<Capability>),
  Flags(BTreeSet<String>),
  List(List),
  Lsub(List),
  Search(BTreeSet<u32>),
  Esearch(Esearch),
  Status(StatusData),
  Exists(u32),
  Recent(u32),
  Expunge(u32),
  Fetch(Fetch),
}

/// Interned response type, the key of the untagged dispatch registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UntaggedKind {
  Ok,
  No,
  Bad,
  PreAuth,
  Bye,
  Capability,
  Enabled,
  Flags,
  List,
  Lsub,
  Search,
  Esearch,
  Status,
  Exists,
  Recent,
  Expunge,
  Fetch,
}

impl Untagged {
  pub fn kind(&self) -> UntaggedKind {
    match self {
      Untagged::Ok(_) => UntaggedKind::Ok,
      Untagged::No(_) => UntaggedKind::No,
      Untagged::Bad(_) => UntaggedKind::Bad,
      Untagged::PreAuth(_) => UntaggedKind::PreAuth,
      Untagged::Bye(_) => UntaggedKind::Bye,
      Untagged::Capability(_) => UntaggedKind::Capability,
      Untagged::Enabled(_) => UntaggedKind::Enabled,
      Untagged::Flags(_) => UntaggedKind::Flags,
      Untagged::List(_) => UntaggedKind::List,
      Untagged::Lsub(_) => UntaggedKind::Lsub,
      Untagged::Search(_) => UntaggedKind::Search,
      Untagged::Esearch(_) => UntaggedKind::Esearch,
      Untagged::Status(_) => UntaggedKind::Status,
      Untagged::Exists(_) => UntaggedKind::Exists,
      Untagged::Recent(_) => UntaggedKind::Recent,
      Untagged::Expunge(_) => UntaggedKind::Expunge,
      Untagged::Fetch(_) => UntaggedKind::Fetch,
    }
  }
}

/// resp-text: optional bracketed code plus free text.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResponseText {
  pub code: Option<Code>,
  pub text: Option<String>,
}

/// resp-text-code, interned.
#[derive(Clone, Debug, PartialEq)]
pub enum Code {
  Alert,
  Parse,
  ReadOnly,
  ReadWrite,
  TryCreate,
  Closed,
  NoModSeq,
  UidNext(u32),
  UidValidity(u32),
  Unseen(u32),
  HighestModSeq(u64),
  PermanentFlags(BTreeSet<String>),
  Capability(Vec<Capability>),
  Other(String, Option<String>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Capability {
  Imap4Rev1,
  AuthPlain,
  LoginDisabled,
  Idle,
  ListStatus,
  CondStore,
  Esearch,
  Enable,
  XGmExt1,
  Other(String),
}

impl Capability {
  pub fn from_bytes(bytes: &[u8]) -> Capability {
    let known: &[(&[u8], Capability)] = &[
      (b"IMAP4rev1", Capability::Imap4Rev1),
      (b"AUTH=PLAIN", Capability::AuthPlain),
      (b"LOGINDISABLED", Capability::LoginDisabled),
      (b"IDLE", Capability::Idle),
      (b"LIST-STATUS", Capability::ListStatus),
      (b"CONDSTORE", Capability::CondStore),
      (b"ESEARCH", Capability::Esearch),
      (b"ENABLE", Capability::Enable),
      (b"X-GM-EXT-1", Capability::XGmExt1),
    ];
    for (name, capability) in known {
      if name.eq_ignore_ascii_case(bytes) {
        return capability.clone();
      }
    }
    Capability::Other(String::from_utf8_lossy(bytes).into_owned())
  }
}

/// LIST/LSUB reply: name attributes, hierarchy delimiter, raw mailbox name.
#[derive(Clone, Debug, PartialEq)]
pub struct List {
  pub attributes: BTreeSet<String>,
  pub delimiter: Option<u8>,
  pub mailbox: Vec<u8>,
}

/// STATUS reply.
#[derive(Clone, Debug, PartialEq)]
pub struct StatusData {
  pub mailbox: Vec<u8>,
  pub items: Vec<(StatusAttribute, u64)>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusAttribute {
  Messages,
  Recent,
  UidNext,
  UidValidity,
  Unseen,
  HighestModSeq,
}

impl StatusAttribute {
  pub fn name(self) -> &'static str {
    match self {
      StatusAttribute::Messages => "MESSAGES",
      StatusAttribute::Recent => "RECENT",
      StatusAttribute::UidNext => "UIDNEXT",
      StatusAttribute::UidValidity => "UIDVALIDITY",
      StatusAttribute::Unseen => "UNSEEN",
      StatusAttribute::HighestModSeq => "HIGHESTMODSEQ",
    }
  }
}

/// ESEARCH reply (RFC 4731). The correlator tag routes concurrent searches
/// back to their issuing command.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Esearch {
  pub tag: Option<String>,
  pub uid: bool,
  pub min: Option<u32>,
  pub max: Option<u32>,
  pub count: Option<u32>,
  pub all: Option<Vec<(u32, u32)>>,
}

impl Esearch {
  /// Expand the ALL sequence-set into ascending numbers.
  pub fn all_numbers(&self) -> Vec<u32> {
    let mut numbers = Vec::new();
    for (first, last) in self.all.iter().flatten() {
      numbers.extend(*first..=*last);
    }
    numbers
  }
}

/// One FETCH reply: the message sequence number and every returned item,
/// with all BODY[section]<origin> items folded into one `sections` map.
#[derive(Clone, Debug, PartialEq)]
pub struct Fetch {
  pub msg: u32,
  pub items: FetchItems,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FetchItems {
  pub uid: Option<u32>,
  pub flags: Option<BTreeSet<String>>,
  pub envelope: Option<Envelope>,
  pub internal_date: Option<chrono::DateTime<chrono::FixedOffset>>,
  pub rfc822_size: Option<u32>,
  pub bodystructure: Option<BodyStructure>,
  pub sections: BTreeMap<String, Section>,
  pub modseq: Option<u64>,
  pub gm_msgid: Option<u64>,
  pub gm_thrid: Option<u64>,
  pub gm_labels: Option<BTreeSet<Vec<u8>>>,
}

/// BODY[section]<origin> payload.
#[derive(Clone, Debug, PartialEq)]
pub struct Section {
  pub origin: Option<u32>,
  pub content: Option<Vec<u8>>,
}

/// ENVELOPE: RFC 5322 fields as the server parsed them. The date is decoded
/// liberally; everything textual stays raw bytes.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Envelope {
  pub date: Option<chrono::DateTime<chrono::FixedOffset>>,
  pub subject: Option<Vec<u8>>,
  pub from: Option<Vec<Address>>,
  pub sender: Option<Vec<Address>>,
  pub reply_to: Option<Vec<Address>>,
  pub to: Option<Vec<Address>>,
  pub cc: Option<Vec<Address>>,
  pub bcc: Option<Vec<Address>>,
  pub in_reply_to: Option<Vec<u8>>,
  pub message_id: Option<Vec<u8>>,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Address {
  pub name: Option<Vec<u8>>,
  pub adl: Option<Vec<u8>>,
  pub mailbox: Option<Vec<u8>>,
  pub host: Option<Vec<u8>>,
}

/// BODYSTRUCTURE. Extension fields past the last known one land in
/// `extension` untouched; servers keep inventing them.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum BodyStructure {
  Text {
    subtype: String,
    fields: BodyFields,
    lines: u32,
    extension: Option<BodyExt1Part>,
  },
  Message {
    fields: BodyFields,
    envelope: Box<Envelope>,
    body: Box<BodyStructure>,
    lines: u32,
    extension: Option<BodyExt1Part>,
  },
  Basic {
    media_type: String,
    subtype: String,
    fields: BodyFields,
    extension: Option<BodyExt1Part>,
  },
  Multipart {
    subtype: String,
    parts: Vec<BodyStructure>,
    extension: Option<BodyExtMPart>,
  },
}

#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BodyFields {
  pub params: Vec<(String, String)>,
  pub id: Option<String>,
  pub description: Option<String>,
  pub encoding: String,
  pub size: u32,
}

#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BodyExt1Part {
  pub md5: Option<String>,
  pub disposition: Option<(String, Vec<(String, String)>)>,
  pub lang: Option<Vec<String>>,
  pub location: Option<String>,
  pub extension: Vec<BodyExtension>,
}

#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BodyExtMPart {
  pub params: Vec<(String, String)>,
  pub disposition: Option<(String, Vec<(String, String)>)>,
  pub lang: Option<Vec<String>>,
  pub location: Option<String>,
  pub extension: Vec<BodyExtension>,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum BodyExtension {
  Number(u32),
  String(Option<Vec<u8>>),
  List(Vec<BodyExtension>),
}
