// Persistent cache of everything learned from the server: mailboxes,
// messages keyed by Gmail's stable 64-bit id, per-mailbox UID bindings and
// fetched body sections. Mutations accumulate in a deferred transaction the
// engine commits at coherent points; every mutation also notifies
// registered listeners synchronously so the display layer can bind views
// to cache changes.

use crate::error::{Error, Result};
use crate::imap::types::{Address, BodyStructure, Envelope};
use rusqlite::types::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::path;

/// A change to a tracked table, with the affected primary keys.
#[derive(Clone, Debug, PartialEq)]
pub enum Notification {
  MailboxAdd { name: String },
  MailboxUpdate { name: String },
  MailboxDelete { name: String },
  MessageAdd { mailbox: String, uid: u32, gm_msgid: u64 },
  MessageUpdate { gm_msgid: u64 },
  MessageDelete { mailbox: String, uid: u32 },
}

pub type Listener = Box<dyn FnMut(&Notification)>;

/// Partial update of a mailbox row; untouched fields stay None.
#[derive(Debug, Default)]
pub struct MailboxPatch<'a> {
  pub delimiter: Option<u8>,
  pub attributes: Option<&'a BTreeSet<String>>,
  pub exists: Option<u32>,
  pub unseen: Option<u32>,
  pub recent: Option<u32>,
  pub uidvalidity: Option<u32>,
}

/// Partial update of a message row.
#[derive(Debug, Default)]
pub struct MessagePatch<'a> {
  pub bodystructure: Option<&'a BodyStructure>,
  pub flags: Option<&'a BTreeSet<String>>,
  pub labels: Option<&'a BTreeSet<Vec<u8>>>,
  pub modseq: Option<u64>,
}

impl MessagePatch<'_> {
  pub(crate) fn is_empty(&self) -> bool {
    self.bodystructure.is_none()
      && self.flags.is_none()
      && self.labels.is_none()
      && self.modseq.is_none()
  }
}

pub struct Cache {
  db: rusqlite::Connection,
  listeners: Vec<Listener>,
  fetching_mailbox: Option<String>,
}

impl std::fmt::Debug for Cache {
  fn fmt(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
    formatter
      .debug_struct("Cache")
      .field("fetching_mailbox", &self.fetching_mailbox)
      .finish()
  }
}

impl Cache {
  pub fn open(path: &path::Path) -> Result<Self> {
    Self::init(rusqlite::Connection::open(path)?)
  }

  pub fn open_in_memory() -> Result<Self> {
    Self::init(rusqlite::Connection::open_in_memory()?)
  }

  fn init(db: rusqlite::Connection) -> Result<Self> {
    db.pragma_update(None, "foreign_keys", "ON")?;
    db.create_collation("mailbox", collate_mailboxes)?;
    db.execute_batch(
      "CREATE TABLE IF NOT EXISTS mailboxes (
           name TEXT PRIMARY KEY ASC NOT NULL COLLATE mailbox,
           /*
            * name is the decoded display form of the mailbox name; raw_name
            * is the name exactly as the server sent it. In theory the
            * former re-encodes to the latter, but a buggy server could
            * disagree with itself, so both are kept.
            */
           raw_name BLOB NOT NULL,
           delimiter INTEGER,
           attributes TEXT NOT NULL,
           \"exists\" INTEGER,
           unseen INTEGER,
           recent INTEGER,
           uidvalidity INTEGER
       );
       CREATE TABLE IF NOT EXISTS gmail_messages (
           gm_msgid INTEGER PRIMARY KEY,
           date INTEGER NOT NULL, /* Unix time */
           timezone INTEGER, /* Offset from UTC in seconds */
           subject TEXT,
           \"from\" TEXT,
           sender TEXT,
           reply_to TEXT,
           \"to\" TEXT,
           cc TEXT,
           bcc TEXT,
           in_reply_to TEXT,
           message_id TEXT,
           bodystructure TEXT,
           flags TEXT NOT NULL,
           labels TEXT NOT NULL,
           modseq INTEGER NOT NULL
       );
       CREATE TABLE IF NOT EXISTS gmail_message_bodies (
           gm_msgid INTEGER NOT NULL,
           section TEXT NOT NULL,
           body BLOB NOT NULL,
           PRIMARY KEY(gm_msgid, section),
           FOREIGN KEY(gm_msgid) REFERENCES gmail_messages(gm_msgid)
       );
       CREATE TABLE IF NOT EXISTS gmail_mailbox_uids (
           mailbox TEXT NOT NULL COLLATE mailbox,
           uid INTEGER NOT NULL,
           gm_msgid INTEGER NOT NULL,
           date INTEGER NOT NULL,
           PRIMARY KEY(mailbox, uid ASC),
           FOREIGN KEY(mailbox) REFERENCES mailboxes(name),
           FOREIGN KEY(gm_msgid) REFERENCES gmail_messages(gm_msgid)
       );
       CREATE INDEX IF NOT EXISTS gmail_mailbox_index_gm_msgid
       ON gmail_mailbox_uids (gm_msgid);
       CREATE UNIQUE INDEX IF NOT EXISTS gmail_mailbox_index_date
       ON gmail_mailbox_uids (mailbox, date ASC, gm_msgid ASC);
       /* The chronological index must follow a message's date. */
       CREATE TRIGGER IF NOT EXISTS gmail_mailbox_uids_date
       AFTER UPDATE OF date ON gmail_messages
       BEGIN
           UPDATE gmail_mailbox_uids SET date=NEW.date WHERE gm_msgid=OLD.gm_msgid;
       END;",
    )?;
    db.execute(
      "INSERT OR IGNORE INTO mailboxes VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
      rusqlite::params!["INBOX", b"INBOX".to_vec(), b'/', "", None::<u32>, None::<u32>, None::<u32>, None::<u32>],
    )?;
    Ok(Self {
      db,
      listeners: Vec::new(),
      fetching_mailbox: None,
    })
  }

  pub fn register_listener(&mut self, listener: Listener) {
    self.listeners.push(listener);
  }

  fn notify(&mut self, notification: Notification) {
    for listener in &mut self.listeners {
      listener(&notification);
    }
  }

  // Mutations run inside a deferred transaction; `commit` makes everything
  // since the last commit durable at once.

  fn begin(&self) -> Result<()> {
    if self.db.is_autocommit() {
      self.db.execute_batch("BEGIN")?;
    }
    Ok(())
  }

  pub fn commit(&mut self) -> Result<()> {
    if !self.db.is_autocommit() {
      self.db.execute_batch("COMMIT")?;
    }
    Ok(())
  }

  /// Abandon everything since the last commit, scratch tables included (an
  /// interrupted flow must not leave half-applied truth behind).
  pub fn rollback(&mut self) -> Result<()> {
    if !self.db.is_autocommit() {
      self.db.execute_batch("ROLLBACK")?;
    }
    self.db.execute_batch(
      "DROP TABLE IF EXISTS temp.fetching;
       DROP TABLE IF EXISTS temp.listing;",
    )?;
    self.fetching_mailbox = None;
    Ok(())
  }

  // Mailboxes.

  pub fn add_mailbox(
    &mut self,
    name: &str,
    raw_name: &[u8],
    delimiter: Option<u8>,
    attributes: &BTreeSet<String>,
  ) -> Result<()> {
    self.begin()?;
    self.db.execute(
      "INSERT INTO mailboxes VALUES (?, ?, ?, ?, NULL, NULL, NULL, NULL)",
      rusqlite::params![name, raw_name, delimiter, adapt_flags(attributes)],
    )?;
    self.notify(Notification::MailboxAdd { name: name.to_string() });
    Ok(())
  }

  pub fn delete_mailbox(&mut self, name: &str) -> Result<()> {
    self.begin()?;
    self.db.execute("DELETE FROM mailboxes WHERE name=?", [name])?;
    self.notify(Notification::MailboxDelete { name: name.to_string() });
    Ok(())
  }

  pub fn update_mailbox(&mut self, name: &str, patch: &MailboxPatch) -> Result<()> {
    let mut columns = Vec::new();
    let mut params: Vec<Value> = Vec::new();
    if let Some(delimiter) = patch.delimiter {
      columns.push("delimiter=?");
      params.push(Value::Integer(delimiter as i64));
    }
    if let Some(attributes) = patch.attributes {
      columns.push("attributes=?");
      params.push(Value::Text(adapt_flags(attributes)));
    }
    if let Some(exists) = patch.exists {
      columns.push("\"exists\"=?");
      params.push(Value::Integer(exists as i64));
    }
    if let Some(unseen) = patch.unseen {
      columns.push("unseen=?");
      params.push(Value::Integer(unseen as i64));
    }
    if let Some(recent) = patch.recent {
      columns.push("recent=?");
      params.push(Value::Integer(recent as i64));
    }
    if let Some(uidvalidity) = patch.uidvalidity {
      columns.push("uidvalidity=?");
      params.push(Value::Integer(uidvalidity as i64));
    }
    assert!(!columns.is_empty());
    params.push(Value::Text(name.to_string()));
    self.begin()?;
    self.db.execute(
      &format!("UPDATE mailboxes SET {} WHERE name=?", columns.join(", ")),
      rusqlite::params_from_iter(params),
    )?;
    self.notify(Notification::MailboxUpdate { name: name.to_string() });
    Ok(())
  }

  pub fn has_mailbox(&self, name: &str) -> Result<bool> {
    let count: u32 = self
      .db
      .query_row("SELECT COUNT(*) FROM mailboxes WHERE name=?", [name], |row| row.get(0))?;
    Ok(count > 0)
  }

  /// All mailbox names in display order (INBOX first, [Gmail] last).
  pub fn mailboxes(&self) -> Result<Vec<String>> {
    let mut statement = self.db.prepare("SELECT name FROM mailboxes ORDER BY name")?;
    let names = statement
      .query_map([], |row| row.get(0))?
      .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(names)
  }

  pub fn mailbox_raw_name(&self, name: &str) -> Result<Option<Vec<u8>>> {
    optional(
      self
        .db
        .query_row("SELECT raw_name FROM mailboxes WHERE name=?", [name], |row| row.get(0)),
    )
  }

  pub fn mailbox_attributes(&self, name: &str) -> Result<BTreeSet<String>> {
    let attributes: String = self
      .db
      .query_row("SELECT attributes FROM mailboxes WHERE name=?", [name], |row| row.get(0))?;
    Ok(convert_flags(&attributes))
  }

  /// A mailbox can be opened unless flagged \Noselect or \NonExistent.
  pub fn can_select(&self, name: &str) -> Result<bool> {
    let attributes = self.mailbox_attributes(name)?;
    Ok(!attributes.contains("\\Noselect") && !attributes.contains("\\NonExistent"))
  }

  pub fn mailbox_exists(&self, name: &str) -> Result<Option<u32>> {
    self
      .db
      .query_row("SELECT \"exists\" FROM mailboxes WHERE name=?", [name], |row| row.get(0))
      .map_err(Error::from)
  }

  pub fn mailbox_uidvalidity(&self, name: &str) -> Result<Option<u32>> {
    self
      .db
      .query_row("SELECT uidvalidity FROM mailboxes WHERE name=?", [name], |row| row.get(0))
      .map_err(Error::from)
  }

  // The LIST refresh accumulates the server's current truth in a scratch
  // table, then reconciles the real table against it in one pass.

  pub fn create_temp_mailbox_list(&mut self) -> Result<()> {
    self.begin()?;
    self.db.execute_batch(
      "CREATE TEMP TABLE temp.listing (
           name TEXT PRIMARY KEY ASC NOT NULL COLLATE mailbox
       )",
    )?;
    Ok(())
  }

  pub fn drop_temp_mailbox_list(&mut self) -> Result<()> {
    self.db.execute_batch("DROP TABLE temp.listing")?;
    Ok(())
  }

  pub fn add_listing_mailbox(&mut self, name: &str) -> Result<()> {
    self.db.execute("INSERT OR IGNORE INTO temp.listing VALUES (?)", [name])?;
    Ok(())
  }

  pub fn delete_unlisted_mailboxes(&mut self) -> Result<()> {
    // Necessarily a full scan; the mailbox table is small.
    let unlisted = {
      let mut statement = self
        .db
        .prepare("SELECT name FROM mailboxes WHERE name NOT IN temp.listing")?;
      let names = statement
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
      names
    };
    for name in unlisted {
      self.db.execute("DELETE FROM gmail_mailbox_uids WHERE mailbox=?", [&name])?;
      self.delete_mailbox(&name)?;
    }
    Ok(())
  }

  // Messages.

  #[allow(clippy::too_many_arguments)]
  pub fn add_message(
    &mut self,
    gm_msgid: u64,
    date: i64,
    timezone: Option<i32>,
    subject: Option<String>,
    addresses: [Option<String>; 6],
    in_reply_to: Option<String>,
    message_id: Option<String>,
    bodystructure: Option<&BodyStructure>,
    flags: &BTreeSet<String>,
    labels: &BTreeSet<Vec<u8>>,
    modseq: u64,
  ) -> Result<()> {
    let [from, sender, reply_to, to, cc, bcc] = addresses;
    self.begin()?;
    self.db.execute(
      "INSERT INTO gmail_messages VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
      rusqlite::params![
        gm_msgid as i64,
        date,
        timezone,
        subject,
        from,
        sender,
        reply_to,
        to,
        cc,
        bcc,
        in_reply_to,
        message_id,
        bodystructure.map(adapt_bodystructure).transpose()?,
        adapt_flags(flags),
        adapt_labels(labels),
        modseq as i64,
      ],
    )?;
    self.notify(Notification::MessageUpdate { gm_msgid });
    Ok(())
  }

  /// Insert a message straight from a parsed ENVELOPE. Header values are
  /// decoded lossily; RFC 2047 word decoding is the display layer's job.
  pub fn add_message_with_envelope(
    &mut self,
    gm_msgid: u64,
    envelope: &Envelope,
    bodystructure: Option<&BodyStructure>,
    flags: &BTreeSet<String>,
    labels: &BTreeSet<Vec<u8>>,
    modseq: u64,
  ) -> Result<()> {
    let (date, timezone) = match envelope.date {
      Some(date) => (date.timestamp(), Some(date.offset().local_minus_utc())),
      None => (0, None),
    };
    self.add_message(
      gm_msgid,
      date,
      timezone,
      envelope.subject.as_deref().map(decode_header),
      [
        envelope_addrs(&envelope.from),
        envelope_addrs(&envelope.sender),
        envelope_addrs(&envelope.reply_to),
        envelope_addrs(&envelope.to),
        envelope_addrs(&envelope.cc),
        envelope_addrs(&envelope.bcc),
      ],
      envelope.in_reply_to.as_deref().map(decode_header),
      envelope.message_id.as_deref().map(decode_header),
      bodystructure,
      flags,
      labels,
      modseq,
    )
  }

  pub fn delete_message(&mut self, gm_msgid: u64) -> Result<()> {
    self.begin()?;
    self.db.execute(
      "DELETE FROM gmail_messages WHERE gm_msgid=?",
      [gm_msgid as i64],
    )?;
    self.notify(Notification::MessageUpdate { gm_msgid });
    Ok(())
  }

  pub fn update_message(&mut self, gm_msgid: u64, patch: &MessagePatch) -> Result<()> {
    let (sql, params) = update_message_sql(patch)?;
    let mut params = params;
    params.push(Value::Integer(gm_msgid as i64));
    self.begin()?;
    self.db.execute(
      &format!("UPDATE gmail_messages SET {sql} WHERE gm_msgid=?"),
      rusqlite::params_from_iter(params),
    )?;
    self.notify(Notification::MessageUpdate { gm_msgid });
    Ok(())
  }

  /// Update the message bound to `(mailbox, uid)`; a no-op when the binding
  /// isn't cached yet (unsolicited FETCH of a message still being fetched).
  pub fn update_message_by_uid(
    &mut self,
    mailbox: &str,
    uid: u32,
    patch: &MessagePatch,
  ) -> Result<bool> {
    let Some(gm_msgid) = self.uid_msgid(mailbox, uid)? else {
      return Ok(false);
    };
    self.update_message(gm_msgid, patch)?;
    Ok(true)
  }

  pub fn has_message(&self, gm_msgid: u64) -> Result<bool> {
    let count: u32 = self.db.query_row(
      "SELECT COUNT(*) FROM gmail_messages WHERE gm_msgid=?",
      [gm_msgid as i64],
      |row| row.get(0),
    )?;
    Ok(count > 0)
  }

  pub fn message_flags(&self, gm_msgid: u64) -> Result<BTreeSet<String>> {
    let flags: String = self.db.query_row(
      "SELECT flags FROM gmail_messages WHERE gm_msgid=?",
      [gm_msgid as i64],
      |row| row.get(0),
    )?;
    Ok(convert_flags(&flags))
  }

  pub fn message_has_bodystructure(&self, mailbox: &str, uid: u32) -> Result<bool> {
    let count: u32 = self.db.query_row(
      "SELECT COUNT(*) FROM gmail_messages
       WHERE bodystructure NOT NULL
       AND gm_msgid=(SELECT gm_msgid FROM gmail_mailbox_uids WHERE mailbox=? AND uid=?)",
      rusqlite::params![mailbox, uid],
      |row| row.get(0),
    )?;
    Ok(count > 0)
  }

  // Body sections.

  pub fn has_body_section(&self, mailbox: &str, uid: u32, section: &str) -> Result<bool> {
    let count: u32 = self.db.query_row(
      "SELECT COUNT(*) FROM gmail_message_bodies
       WHERE section=?
       AND gm_msgid=(SELECT gm_msgid FROM gmail_mailbox_uids WHERE mailbox=? AND uid=?)",
      rusqlite::params![section, mailbox, uid],
      |row| row.get(0),
    )?;
    Ok(count > 0)
  }

  /// Store fetched body sections; sections are written once and never
  /// mutated, so replays are ignored.
  pub fn add_body_sections_by_uid(
    &mut self,
    mailbox: &str,
    uid: u32,
    sections: &BTreeMap<String, crate::imap::types::Section>,
  ) -> Result<bool> {
    let Some(gm_msgid) = self.uid_msgid(mailbox, uid)? else {
      return Ok(false);
    };
    self.begin()?;
    for (section, payload) in sections {
      let Some(content) = &payload.content else {
        continue;
      };
      assert_eq!(None, payload.origin, "partial fetches aren't requested");
      self.db.execute(
        "INSERT OR IGNORE INTO gmail_message_bodies VALUES (?, ?, ?)",
        rusqlite::params![gm_msgid as i64, section, content],
      )?;
    }
    self.notify(Notification::MessageUpdate { gm_msgid });
    Ok(true)
  }

  pub fn body_section(&self, gm_msgid: u64, section: &str) -> Result<Option<Vec<u8>>> {
    optional(self.db.query_row(
      "SELECT body FROM gmail_message_bodies WHERE gm_msgid=? AND section=?",
      rusqlite::params![gm_msgid as i64, section],
      |row| row.get(0),
    ))
  }

  // Mailbox UIDs.

  pub fn add_mailbox_uid(&mut self, mailbox: &str, uid: u32, gm_msgid: u64) -> Result<()> {
    self.begin()?;
    self.db.execute(
      "INSERT INTO gmail_mailbox_uids
       VALUES (?, ?, ?, (SELECT date FROM gmail_messages WHERE gm_msgid=?))",
      rusqlite::params![mailbox, uid, gm_msgid as i64, gm_msgid as i64],
    )?;
    self.notify(Notification::MessageAdd {
      mailbox: mailbox.to_string(),
      uid,
      gm_msgid,
    });
    Ok(())
  }

  pub fn delete_mailbox_uid(&mut self, mailbox: &str, uid: u32) -> Result<()> {
    self.begin()?;
    self.db.execute(
      "DELETE FROM gmail_mailbox_uids WHERE mailbox=? AND uid=?",
      rusqlite::params![mailbox, uid],
    )?;
    self.notify(Notification::MessageDelete {
      mailbox: mailbox.to_string(),
      uid,
    });
    Ok(())
  }

  /// Drop every UID binding of a mailbox: the epoch changed and the cached
  /// UIDs mean nothing anymore.
  pub fn delete_mailbox_uids(&mut self, mailbox: &str) -> Result<()> {
    let uids = self.mailbox_uids(mailbox)?;
    for uid in uids {
      self.delete_mailbox_uid(mailbox, uid)?;
    }
    Ok(())
  }

  pub fn uid_msgid(&self, mailbox: &str, uid: u32) -> Result<Option<u64>> {
    Ok(
      optional(self.db.query_row(
        "SELECT gm_msgid FROM gmail_mailbox_uids WHERE mailbox=? AND uid=?",
        rusqlite::params![mailbox, uid],
        |row| row.get::<_, i64>(0),
      ))?
      .map(|gm_msgid| gm_msgid as u64),
    )
  }

  /// UIDs bound in a mailbox, ascending.
  pub fn mailbox_uids(&self, mailbox: &str) -> Result<Vec<u32>> {
    let mut statement = self
      .db
      .prepare("SELECT uid FROM gmail_mailbox_uids WHERE mailbox=? ORDER BY uid ASC")?;
    let uids = statement
      .query_map([mailbox], |row| row.get(0))?
      .collect::<rusqlite::Result<Vec<u32>>>()?;
    Ok(uids)
  }

  pub fn mailbox_uid_count(&self, mailbox: &str) -> Result<u32> {
    self
      .db
      .query_row(
        "SELECT COUNT(*) FROM gmail_mailbox_uids WHERE mailbox=?",
        [mailbox],
        |row| row.get(0),
      )
      .map_err(Error::from)
  }

  /// Newest messages first, from the chronological index.
  pub fn messages_by_date_desc(&self, mailbox: &str, limit: u32) -> Result<Vec<(u32, u64)>> {
    let mut statement = self.db.prepare(
      "SELECT uid, gm_msgid FROM gmail_mailbox_uids
       WHERE mailbox=? ORDER BY date DESC, gm_msgid DESC LIMIT ?",
    )?;
    let rows = statement
      .query_map(rusqlite::params![mailbox, limit], |row| {
        Ok((row.get::<_, u32>(0)?, row.get::<_, i64>(1)? as u64))
      })?
      .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
  }

  // Range fetches accumulate the server's truth about a UID range in a
  // scratch table, then apply one set diff against the bindings.

  pub fn create_temp_fetching_table(&mut self, mailbox: &str) -> Result<()> {
    assert!(self.fetching_mailbox.is_none());
    self.begin()?;
    self.db.execute_batch(
      "CREATE TEMP TABLE temp.fetching (
           uid INTEGER PRIMARY KEY,
           gm_msgid INTEGER
       )",
    )?;
    self.fetching_mailbox = Some(mailbox.to_string());
    Ok(())
  }

  pub fn drop_temp_fetching_table(&mut self) -> Result<()> {
    self.db.execute_batch("DROP TABLE temp.fetching")?;
    self.fetching_mailbox = None;
    Ok(())
  }

  pub fn add_fetching_uid(&mut self, uid: u32, gm_msgid: Option<u64>) -> Result<()> {
    self.db.execute(
      "INSERT OR REPLACE INTO temp.fetching VALUES (?, ?)",
      rusqlite::params![uid, gm_msgid.map(|id| id as i64)],
    )?;
    Ok(())
  }

  pub fn delete_fetching_uid(&mut self, uid: u32) -> Result<()> {
    self.db.execute("DELETE FROM temp.fetching WHERE uid=?", [uid])?;
    Ok(())
  }

  pub fn update_fetching_gm_msgid(&mut self, uid: u32, gm_msgid: u64) -> Result<()> {
    self.db.execute(
      "UPDATE temp.fetching SET gm_msgid=? WHERE uid=?",
      rusqlite::params![gm_msgid as i64, uid],
    )?;
    Ok(())
  }

  pub fn fetching_gm_msgid(&self, uid: u32) -> Result<Option<u64>> {
    let row = optional(self.db.query_row(
      "SELECT gm_msgid FROM temp.fetching WHERE uid=?",
      [uid],
      |row| row.get::<_, Option<i64>>(0),
    ))?;
    Ok(row.flatten().map(|gm_msgid| gm_msgid as u64))
  }

  /// Split the scratched UIDs into those already bound in the mailbox and
  /// those not yet cached.
  pub fn get_fetching_old_new_uids(&self) -> Result<(BTreeSet<u32>, BTreeSet<u32>)> {
    let mailbox = self.fetching_mailbox.as_ref().unwrap();
    let mut statement = self.db.prepare(
      "SELECT uid, uid IN (SELECT uid FROM gmail_mailbox_uids WHERE mailbox=?)
       FROM temp.fetching",
    )?;
    let mut old = BTreeSet::new();
    let mut new = BTreeSet::new();
    let rows = statement.query_map([mailbox], |row| {
      Ok((row.get::<_, u32>(0)?, row.get::<_, bool>(1)?))
    })?;
    for row in rows {
      let (uid, known) = row?;
      if known {
        old.insert(uid);
      } else {
        new.insert(uid);
      }
    }
    Ok((old, new))
  }

  /// Split the scratched `uid -> gm_msgid` mapping by whether the message
  /// itself is already cached.
  pub fn get_fetching_old_new_gm_msgids(
    &self,
  ) -> Result<(BTreeMap<u32, u64>, BTreeMap<u32, u64>)> {
    let mut statement = self.db.prepare(
      "SELECT uid, gm_msgid, gm_msgid IN (SELECT gm_msgid FROM gmail_messages)
       FROM temp.fetching WHERE gm_msgid NOT NULL",
    )?;
    let mut old = BTreeMap::new();
    let mut new = BTreeMap::new();
    let rows = statement.query_map([], |row| {
      Ok((
        row.get::<_, u32>(0)?,
        row.get::<_, i64>(1)? as u64,
        row.get::<_, bool>(2)?,
      ))
    })?;
    for row in rows {
      let (uid, gm_msgid, known) = row?;
      if known {
        old.insert(uid, gm_msgid);
      } else {
        new.insert(uid, gm_msgid);
      }
    }
    Ok((old, new))
  }

  /// Bind every scratched UID with a known gm_msgid into the mailbox.
  pub fn add_fetching_uids(&mut self) -> Result<usize> {
    let mailbox = self.fetching_mailbox.clone().unwrap();
    let rows = {
      let mut statement = self.db.prepare(
        "SELECT uid, gm_msgid FROM temp.fetching WHERE gm_msgid NOT NULL ORDER BY uid",
      )?;
      let rows = statement
        .query_map([], |row| {
          Ok((row.get::<_, u32>(0)?, row.get::<_, i64>(1)? as u64))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
      rows
    };
    let count = rows.len();
    for (uid, gm_msgid) in rows {
      self.add_mailbox_uid(&mailbox, uid, gm_msgid)?;
    }
    Ok(count)
  }

  /// Cached UIDs in `[start_uid, end_uid)` the server no longer reports are
  /// deletions that happened while this client was away.
  pub fn delete_fetching_missing(&mut self, start_uid: u32, end_uid: u32) -> Result<usize> {
    let mailbox = self.fetching_mailbox.clone().unwrap();
    let missing = {
      let mut statement = self.db.prepare(
        "SELECT uid FROM gmail_mailbox_uids
         WHERE mailbox=? AND uid>=? AND uid<?
         AND uid NOT IN (SELECT uid FROM temp.fetching)",
      )?;
      let uids = statement
        .query_map(rusqlite::params![mailbox, start_uid, end_uid], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<u32>>>()?;
      uids
    };
    let count = missing.len();
    for uid in missing {
      self.delete_mailbox_uid(&mailbox, uid)?;
    }
    Ok(count)
  }
}

fn optional<T>(result: rusqlite::Result<T>) -> Result<Option<T>> {
  match result {
    Ok(value) => Ok(Some(value)),
    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
    Err(error) => Err(error.into()),
  }
}

// Column adapters, all trivially invertible.

fn adapt_flags(flags: &BTreeSet<String>) -> String {
  flags.iter().cloned().collect::<Vec<_>>().join(",")
}

fn convert_flags(s: &str) -> BTreeSet<String> {
  if s.is_empty() {
    BTreeSet::new()
  } else {
    s.split(',').map(str::to_string).collect()
  }
}

fn adapt_labels(labels: &BTreeSet<Vec<u8>>) -> String {
  labels
    .iter()
    .map(|label| String::from_utf8_lossy(label).into_owned())
    .collect::<Vec<_>>()
    .join(",")
}

fn adapt_bodystructure(body: &BodyStructure) -> Result<String> {
  serde_json::to_string(body).map_err(|error| Error::Protocol(error.to_string()))
}

pub fn convert_bodystructure(s: &str) -> Result<BodyStructure> {
  serde_json::from_str(s).map_err(|error| Error::Protocol(error.to_string()))
}

fn update_message_sql(patch: &MessagePatch) -> Result<(String, Vec<Value>)> {
  assert!(!patch.is_empty());
  let mut columns = Vec::new();
  let mut params = Vec::new();
  if let Some(bodystructure) = patch.bodystructure {
    columns.push("bodystructure=?");
    params.push(Value::Text(adapt_bodystructure(bodystructure)?));
  }
  if let Some(flags) = patch.flags {
    columns.push("flags=?");
    params.push(Value::Text(adapt_flags(flags)));
  }
  if let Some(labels) = patch.labels {
    columns.push("labels=?");
    params.push(Value::Text(adapt_labels(labels)));
  }
  if let Some(modseq) = patch.modseq {
    columns.push("modseq=?");
    params.push(Value::Integer(modseq as i64));
  }
  Ok((columns.join(", "), params))
}

fn decode_header(bytes: &[u8]) -> String {
  String::from_utf8_lossy(bytes).into_owned()
}

/// `"Display Name" <mailbox@host>` lines joined by newlines, one per
/// address; addresses without a usable mailbox@host are dropped.
fn envelope_addrs(addresses: &Option<Vec<Address>>) -> Option<String> {
  let addresses = addresses.as_ref()?;
  let mut lines = Vec::new();
  for address in addresses {
    let (Some(mailbox), Some(host)) = (&address.mailbox, &address.host) else {
      continue;
    };
    let email = format!(
      "{}@{}",
      String::from_utf8_lossy(mailbox),
      String::from_utf8_lossy(host)
    );
    match &address.name {
      Some(name) => lines.push(format!("\"{}\" <{email}>", decode_header(name))),
      None => lines.push(email),
    }
  }
  if lines.is_empty() {
    None
  } else {
    Some(lines.join("\n"))
  }
}

// Mailbox collation: INBOX first, [Gmail] mailboxes last, everything else
// alphabetical ignoring case and (best-effort) accents, ties broken by the
// raw string. Two mailboxes differing only in case are impossible on Gmail
// but other servers allow them.

fn collate_mailboxes(left: &str, right: &str) -> Ordering {
  sort_key(left).cmp(&sort_key(right))
}

fn sort_key(mailbox: &str) -> (u8, String, &str) {
  let bucket = if mailbox == "INBOX" {
    0
  } else if mailbox.starts_with("[Gmail]") {
    2
  } else {
    1
  };
  let folded = mailbox
    .chars()
    .flat_map(char::to_lowercase)
    .map(fold_accent)
    .collect();
  (bucket, folded, mailbox)
}

// Best-effort Latin accent fold; a full locale-aware strxfrm isn't worth
// binding the sort order to the host locale.
fn fold_accent(c: char) -> char {
  match c {
    'à'..='å' | 'ā' | 'ă' | 'ą' => 'a',
    'æ' => 'a',
    'ç' | 'ć' | 'ĉ' | 'ċ' | 'č' => 'c',
    'è'..='ë' | 'ē' | 'ĕ' | 'ė' | 'ę' | 'ě' => 'e',
    'ì'..='ï' | 'ĩ' | 'ī' | 'ĭ' | 'į' | 'ı' => 'i',
    'ñ' | 'ń' | 'ņ' | 'ň' => 'n',
    'ò'..='ö' | 'ø' | 'ō' | 'ŏ' | 'ő' => 'o',
    'ù'..='ü' | 'ũ' | 'ū' | 'ŭ' | 'ů' | 'ű' | 'ų' => 'u',
    'ý' | 'ÿ' => 'y',
    'ś' | 'ŝ' | 'ş' | 'š' => 's',
    'ź' | 'ż' | 'ž' => 'z',
    c => c,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;
  use std::cell::RefCell;
  use std::rc::Rc;

  fn cache() -> Cache {
    Cache::open_in_memory().unwrap()
  }

  fn add_plain_message(cache: &mut Cache, gm_msgid: u64, date: i64) {
    cache
      .add_message(
        gm_msgid,
        date,
        None,
        Some(format!("message {gm_msgid}")),
        [None, None, None, None, None, None],
        None,
        None,
        None,
        &BTreeSet::new(),
        &BTreeSet::new(),
        1,
      )
      .unwrap();
  }

  #[test]
  fn inbox_always_exists() {
    let cache = cache();
    assert!(cache.has_mailbox("INBOX").unwrap());
    assert_eq!(Some(b"INBOX".to_vec()), cache.mailbox_raw_name("INBOX").unwrap());
  }

  #[test]
  fn mailbox_sort_order() {
    let mut cache = cache();
    for name in ["apple", "\u{e1}bacus", "Apple", "[Gmail]/All Mail", "aardvark"] {
      cache
        .add_mailbox(name, name.as_bytes(), Some(b'/'), &BTreeSet::new())
        .unwrap();
    }
    assert_eq!(
      vec![
        "INBOX".to_string(),
        "aardvark".to_string(),
        "\u{e1}bacus".to_string(),
        "Apple".to_string(),
        "apple".to_string(),
        "[Gmail]/All Mail".to_string(),
      ],
      cache.mailboxes().unwrap()
    );
  }

  #[test]
  fn update_mailbox_patch() {
    let mut cache = cache();
    cache
      .update_mailbox(
        "INBOX",
        &MailboxPatch {
          exists: Some(3),
          unseen: Some(1),
          uidvalidity: Some(7),
          ..MailboxPatch::default()
        },
      )
      .unwrap();
    assert_eq!(Some(3), cache.mailbox_exists("INBOX").unwrap());
    assert_eq!(Some(7), cache.mailbox_uidvalidity("INBOX").unwrap());
  }

  #[test]
  fn can_select() {
    let mut cache = cache();
    let attributes = ["\\Noselect".to_string()].into_iter().collect();
    cache
      .add_mailbox("parent", b"parent", Some(b'/'), &attributes)
      .unwrap();
    assert!(!cache.can_select("parent").unwrap());
    assert!(cache.can_select("INBOX").unwrap());
  }

  #[test]
  fn foreign_keys_enforced() {
    let mut cache = cache();
    // Binding a UID to an unknown message is a cache-invariant violation.
    assert!(cache.add_mailbox_uid("INBOX", 1, 12345).is_err());
  }

  #[test]
  fn uid_bindings() {
    let mut cache = cache();
    add_plain_message(&mut cache, 100, 1000);
    add_plain_message(&mut cache, 101, 2000);
    cache.add_mailbox_uid("INBOX", 5, 100).unwrap();
    cache.add_mailbox_uid("INBOX", 9, 101).unwrap();
    assert_eq!(vec![5, 9], cache.mailbox_uids("INBOX").unwrap());
    assert_eq!(Some(100), cache.uid_msgid("INBOX", 5).unwrap());
    assert_eq!(2, cache.mailbox_uid_count("INBOX").unwrap());
    // Newest first.
    assert_eq!(
      vec![(9, 101), (5, 100)],
      cache.messages_by_date_desc("INBOX", 10).unwrap()
    );

    cache.delete_mailbox_uid("INBOX", 5).unwrap();
    assert_eq!(vec![9], cache.mailbox_uids("INBOX").unwrap());

    // A message row can only go once nothing references it.
    assert!(cache.delete_message(101).is_err());
    cache.delete_mailbox_uid("INBOX", 9).unwrap();
    cache.delete_message(101).unwrap();
    assert!(!cache.has_message(101).unwrap());
  }

  #[test]
  fn date_change_cascades_to_index() {
    let mut cache = cache();
    add_plain_message(&mut cache, 100, 1000);
    add_plain_message(&mut cache, 101, 2000);
    cache.add_mailbox_uid("INBOX", 1, 100).unwrap();
    cache.add_mailbox_uid("INBOX", 2, 101).unwrap();
    assert_eq!(
      vec![(2, 101), (1, 100)],
      cache.messages_by_date_desc("INBOX", 10).unwrap()
    );
    // Move message 100 to the future; the chronological index must follow.
    cache
      .db
      .execute("UPDATE gmail_messages SET date=3000 WHERE gm_msgid=100", [])
      .unwrap();
    assert_eq!(
      vec![(1, 100), (2, 101)],
      cache.messages_by_date_desc("INBOX", 10).unwrap()
    );
  }

  #[test]
  fn listing_diff() {
    let mut cache = cache();
    cache
      .add_mailbox("stale", b"stale", Some(b'/'), &BTreeSet::new())
      .unwrap();
    cache.create_temp_mailbox_list().unwrap();
    cache.add_listing_mailbox("INBOX").unwrap();
    cache.add_listing_mailbox("fresh").unwrap();
    cache
      .add_mailbox("fresh", b"fresh", Some(b'/'), &BTreeSet::new())
      .unwrap();
    cache.delete_unlisted_mailboxes().unwrap();
    cache.drop_temp_mailbox_list().unwrap();
    assert_eq!(
      vec!["INBOX".to_string(), "fresh".to_string()],
      cache.mailboxes().unwrap()
    );
  }

  #[test]
  fn fetching_flow() {
    let mut cache = cache();
    add_plain_message(&mut cache, 100, 1000);
    cache.add_mailbox_uid("INBOX", 1, 100).unwrap();
    // UID 2 was deleted server-side while this client was away.
    add_plain_message(&mut cache, 102, 1200);
    cache.add_mailbox_uid("INBOX", 2, 102).unwrap();

    cache.create_temp_fetching_table("INBOX").unwrap();
    cache.add_fetching_uid(1, Some(100)).unwrap();
    cache.add_fetching_uid(3, None).unwrap();
    cache.update_fetching_gm_msgid(3, 103).unwrap();
    assert_eq!(Some(103), cache.fetching_gm_msgid(3).unwrap());

    let (old_uids, new_uids) = cache.get_fetching_old_new_uids().unwrap();
    assert_eq!([1].into_iter().collect::<BTreeSet<_>>(), old_uids);
    assert_eq!([3].into_iter().collect::<BTreeSet<_>>(), new_uids);

    let (old_msgids, new_msgids) = cache.get_fetching_old_new_gm_msgids().unwrap();
    assert_eq!([(1, 100)].into_iter().collect::<BTreeMap<_, _>>(), old_msgids);
    assert_eq!([(3, 103)].into_iter().collect::<BTreeMap<_, _>>(), new_msgids);

    // The server reported UIDs 1 and 3 in [1, 4): UID 2 is gone. The clamp
    // runs while the scratch still holds every reported UID, then the
    // already-bound UID 1 is dropped so only UID 3 gets inserted.
    assert_eq!(1, cache.delete_fetching_missing(1, 4).unwrap());
    cache.delete_fetching_uid(1).unwrap();
    add_plain_message(&mut cache, 103, 3000);
    assert_eq!(1, cache.add_fetching_uids().unwrap());
    cache.drop_temp_fetching_table().unwrap();
    cache.commit().unwrap();

    assert_eq!(vec![1, 3], cache.mailbox_uids("INBOX").unwrap());
  }

  #[test]
  fn notifications() {
    let mut cache = cache();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    cache.register_listener(Box::new(move |notification| {
      sink.borrow_mut().push(notification.clone());
    }));

    cache
      .add_mailbox("fresh", b"fresh", Some(b'/'), &BTreeSet::new())
      .unwrap();
    add_plain_message(&mut cache, 100, 1000);
    cache.add_mailbox_uid("fresh", 1, 100).unwrap();
    cache.delete_mailbox_uid("fresh", 1).unwrap();

    assert_eq!(
      vec![
        Notification::MailboxAdd { name: "fresh".to_string() },
        Notification::MessageUpdate { gm_msgid: 100 },
        Notification::MessageAdd { mailbox: "fresh".to_string(), uid: 1, gm_msgid: 100 },
        Notification::MessageDelete { mailbox: "fresh".to_string(), uid: 1 },
      ],
      seen.borrow().clone()
    );
  }

  #[test]
  fn bodystructure_round_trips() {
    let body = BodyStructure::Text {
      subtype: "plain".to_string(),
      fields: crate::imap::types::BodyFields {
        params: vec![("charset".to_string(), "UTF-8".to_string())],
        id: None,
        description: None,
        encoding: "7bit".to_string(),
        size: 42,
      },
      lines: 3,
      extension: None,
    };
    let mut cache = cache();
    cache
      .add_message(
        100,
        0,
        None,
        None,
        [None, None, None, None, None, None],
        None,
        None,
        Some(&body),
        &BTreeSet::new(),
        &BTreeSet::new(),
        1,
      )
      .unwrap();
    cache.add_mailbox_uid("INBOX", 1, 100).unwrap();
    assert!(cache.message_has_bodystructure("INBOX", 1).unwrap());
    let stored: String = cache
      .db
      .query_row("SELECT bodystructure FROM gmail_messages WHERE gm_msgid=100", [], |row| {
        row.get(0)
      })
      .unwrap();
    assert_eq!(body, convert_bodystructure(&stored).unwrap());
  }

  #[test]
  fn body_sections_write_once() {
    let mut cache = cache();
    add_plain_message(&mut cache, 100, 0);
    cache.add_mailbox_uid("INBOX", 7, 100).unwrap();
    let sections = [(
      "1".to_string(),
      crate::imap::types::Section { origin: None, content: Some(b"hello".to_vec()) },
    )]
    .into_iter()
    .collect();
    assert!(cache.add_body_sections_by_uid("INBOX", 7, &sections).unwrap());
    assert!(cache.has_body_section("INBOX", 7, "1").unwrap());
    assert_eq!(Some(b"hello".to_vec()), cache.body_section(100, "1").unwrap());
    // Replays are ignored, not an error.
    assert!(cache.add_body_sections_by_uid("INBOX", 7, &sections).unwrap());
    // Unknown binding: nothing to attach to.
    assert!(!cache.add_body_sections_by_uid("INBOX", 8, &sections).unwrap());
  }

  #[test]
  fn deferred_commit() {
    let directory = tempfile::tempdir().unwrap();
    let path = directory.path().join("cache.db");
    {
      let mut cache = Cache::open(&path).unwrap();
      cache
        .add_mailbox("committed", b"committed", None, &BTreeSet::new())
        .unwrap();
      cache.commit().unwrap();
      cache
        .add_mailbox("uncommitted", b"uncommitted", None, &BTreeSet::new())
        .unwrap();
      // Dropped without commit: the second mailbox must not survive.
    }
    let cache = Cache::open(&path).unwrap();
    assert_eq!(
      vec!["INBOX".to_string(), "committed".to_string()],
      cache.mailboxes().unwrap()
    );
  }

  #[test]
  fn envelope_addresses() {
    let addresses = Some(vec![
      Address {
        name: Some(b"Terry Gray".to_vec()),
        adl: None,
        mailbox: Some(b"gray".to_vec()),
        host: Some(b"cac.washington.edu".to_vec()),
      },
      Address {
        name: None,
        adl: None,
        mailbox: None, // Group syntax marker, unusable as an address.
        host: None,
      },
      Address {
        name: None,
        adl: None,
        mailbox: Some(b"imap".to_vec()),
        host: Some(b"cac.washington.edu".to_vec()),
      },
    ]);
    assert_eq!(
      Some(
        "\"Terry Gray\" <gray@cac.washington.edu>\nimap@cac.washington.edu".to_string()
      ),
      envelope_addrs(&addresses)
    );
    assert_eq!(None, envelope_addrs(&None));
  }
}
