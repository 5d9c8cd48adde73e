use grist::work::Work;
use pretty_assertions::assert_eq;
use test_log::test;

mod common;

#[test]
fn greeting_then_login() {
  let mut harness = common::Harness::new();
  harness.authenticate("IMAP4rev1 AUTH=PLAIN IDLE");
  // Nothing queued: the state blocks on the work queue.
  assert_eq!(None, harness.client.queue.get_work());
}

#[test]
fn greeting_bye_terminates() {
  let mut harness = common::Harness::new();
  harness.client.start();
  harness.feed(b"* BYE go away\r\n");
  assert!(harness.reported("Rejected by server"));
  assert!(harness.client.is_quit());
  assert_eq!(0, harness.client.live_operations());
}

#[test]
fn missing_capability_terminates() {
  let mut harness = common::Harness::new();
  harness.client.start();
  harness.feed(b"* OK hi\r\n");
  harness.expect_written(b"A001 CAPABILITY\r\n");
  // LOGINDISABLED wins over an advertised AUTH=PLAIN.
  harness.feed(b"* CAPABILITY IMAP4rev1 AUTH=PLAIN LOGINDISABLED\r\nA001 OK\r\n");
  assert!(harness.reported("Cannot authenticate"));
  assert!(harness.client.is_quit());
  assert_eq!(0, harness.client.live_operations());
}

#[test]
fn login_failure_terminates() {
  let mut harness = common::Harness::new();
  harness.client.start();
  harness.feed(b"* OK hi\r\n");
  harness.expect_written(b"A001 CAPABILITY\r\n");
  harness.feed(b"* CAPABILITY IMAP4rev1 AUTH=PLAIN\r\nA001 OK\r\n");
  harness.expect_written(b"A002 LOGIN user password\r\n");
  harness.feed(b"A002 NO [AUTHENTICATIONFAILED] nope\r\n");
  assert!(harness.reported("Login failed"));
  assert!(harness.client.is_quit());
}

#[test]
fn login_literal_continuation() {
  // A password that can't travel as an atom or quoted string goes out as a
  // literal: the sender must stop at the checkpoint until the server's go
  // ahead.
  let mut harness = common::Harness::with_password("p\u{e5}ssword");
  harness.client.start();
  harness.feed(b"* OK hi\r\n");
  harness.expect_written(b"A001 CAPABILITY\r\n");
  harness.feed(b"* CAPABILITY IMAP4rev1 AUTH=PLAIN\r\nA001 OK\r\n");
  // Paused right after the literal header.
  harness.expect_written(b"A002 LOGIN user {9}\r\n");
  harness.feed(b"+ go ahead\r\n");
  harness.expect_written("p\u{e5}ssword\r\n".as_bytes());
  harness.feed(b"A002 OK\r\n");
  assert_eq!(Some("authenticated"), harness.client.state_name());
}

#[test]
fn select_no_falls_back() {
  let mut harness = common::Harness::new();
  harness.authenticate("IMAP4rev1 AUTH=PLAIN");
  harness
    .client
    .cache
    .add_mailbox("Trash", b"Trash", Some(b'/'), &Default::default())
    .unwrap();

  harness.client.select_mailbox("Trash").unwrap();
  harness.expect_written(b"A003 EXAMINE Trash\r\n");
  // Queued behind the selection: a fetch that targets it and a refresh
  // that doesn't.
  harness.client.open_message("Trash", 7, true).unwrap();
  harness.client.refresh();
  assert_eq!(
    Some(&b"Trash"[..]),
    harness.client.queue.selected.as_deref()
  );

  harness.feed(b"A003 NO [NONEXISTENT] no such mailbox\r\n");
  assert!(harness.reported("Could not open Trash"));
  // The fetch died with the selection; the refresh survived and is already
  // being serviced (LIST went out, the item stays queued until it's done).
  assert_eq!(Some(&Work::RefreshList), harness.client.queue.get_work());
  assert_eq!(None, harness.client.queue.selected);
  let written = harness.written();
  assert!(written.starts_with(b"A004 LIST \"\" *"), "{written:?}");
}

fn select_inbox(harness: &mut common::Harness) {
  harness.client.select_mailbox("INBOX").unwrap();
  harness.expect_written(b"A003 EXAMINE INBOX\r\n");
  harness.feed(
    b"* 3 EXISTS\r\n* 0 RECENT\r\n* FLAGS (\\Answered \\Seen)\r\n\
      * OK [UIDVALIDITY 99] UIDs valid\r\nA003 OK\r\n",
  );
  assert_eq!(Some("selected"), harness.client.state_name());
  // Entry priming: the full UID array and the unseen set, two searches.
  harness.expect_written(
    b"A004 UID SEARCH RETURN (ALL) ALL\r\nA005 UID SEARCH RETURN (ALL) UNSEEN\r\n",
  );
  harness.feed(
    b"* ESEARCH (TAG \"A004\") UID ALL 10,20,30\r\nA004 OK\r\n\
      * ESEARCH (TAG \"A005\") UID UNSEEN 20\r\nA005 OK\r\n",
  );
}

fn backfill_inbox(harness: &mut common::Harness) {
  // With nothing queued and no new arrivals, the backfill reconciles the
  // newest 250 messages before the cursor.
  harness.expect_written(b"A006 UID FETCH 10:30 (X-GM-MSGID FLAGS X-GM-LABELS)\r\n");
  harness.feed(
    b"* 1 FETCH (UID 10 X-GM-MSGID 1010 FLAGS (\\Seen) X-GM-LABELS ())\r\n\
      * 2 FETCH (UID 20 X-GM-MSGID 1020 FLAGS () X-GM-LABELS (\\Starred))\r\n\
      * 3 FETCH (UID 30 X-GM-MSGID 1030 FLAGS (\\Seen) X-GM-LABELS ())\r\nA006 OK\r\n",
  );
  // All three messages are unknown: fetch their envelopes.
  harness.expect_written(b"A007 UID FETCH 10,20,30 (ENVELOPE FLAGS X-GM-LABELS)\r\n");
  harness.feed(
    b"* 1 FETCH (UID 10 ENVELOPE (NIL \"a\" NIL NIL NIL NIL NIL NIL NIL NIL) FLAGS (\\Seen) X-GM-LABELS ())\r\n\
      * 2 FETCH (UID 20 ENVELOPE (NIL \"b\" NIL NIL NIL NIL NIL NIL NIL NIL) FLAGS () X-GM-LABELS (\\Starred))\r\n\
      * 3 FETCH (UID 30 ENVELOPE (NIL \"c\" NIL NIL NIL NIL NIL NIL NIL NIL) FLAGS (\\Seen) X-GM-LABELS ())\r\nA007 OK\r\n",
  );
  // A NOOP after the batch so fresh arrivals beat the next backfill round.
  harness.expect_written(b"A008 NOOP\r\n");
  harness.feed(b"A008 OK\r\n");
}

#[test]
fn selected_primes_and_backfills() {
  let mut harness = common::Harness::new();
  harness.authenticate("IMAP4rev1 AUTH=PLAIN ESEARCH X-GM-EXT-1");
  select_inbox(&mut harness);
  backfill_inbox(&mut harness);

  let snapshot = harness.client.selected().unwrap();
  assert_eq!("INBOX", snapshot.name);
  assert_eq!(3, snapshot.exists);
  assert_eq!(vec![10, 20, 30], snapshot.uids);
  assert_eq!(vec![20], snapshot.unseen);

  let cache = &harness.client.cache;
  assert_eq!(vec![10, 20, 30], cache.mailbox_uids("INBOX").unwrap());
  assert_eq!(Some(3), cache.mailbox_exists("INBOX").unwrap());
  assert_eq!(Some(1020), cache.uid_msgid("INBOX", 20).unwrap());
  // The mailbox's own label is added back (the server omits it).
  let flags = cache.message_flags(1010).unwrap();
  assert!(flags.contains("\\Seen"), "{flags:?}");
}

#[test]
fn unsolicited_expunge() {
  let mut harness = common::Harness::new();
  harness.authenticate("IMAP4rev1 AUTH=PLAIN ESEARCH X-GM-EXT-1");
  select_inbox(&mut harness);
  backfill_inbox(&mut harness);

  // No IDLE capability: the state blocks on the queue, and the expunge
  // arrives unsolicited.
  harness.feed(b"* 2 EXPUNGE\r\n");

  let snapshot = harness.client.selected().unwrap();
  assert_eq!(2, snapshot.exists);
  assert_eq!(vec![10, 30], snapshot.uids);
  assert_eq!(Vec::<u32>::new(), snapshot.unseen);
  let cache = &harness.client.cache;
  assert_eq!(vec![10, 30], cache.mailbox_uids("INBOX").unwrap());
  assert_eq!(None, cache.uid_msgid("INBOX", 20).unwrap());
  // Invariant: binding count tracks EXISTS at every commit point.
  assert_eq!(
    cache.mailbox_exists("INBOX").unwrap().unwrap(),
    cache.mailbox_uid_count("INBOX").unwrap()
  );
}

#[test]
fn exists_during_idle_fetches_new_messages() {
  let mut harness = common::Harness::new();
  harness.authenticate("IMAP4rev1 AUTH=PLAIN ESEARCH X-GM-EXT-1 IDLE");
  select_inbox(&mut harness);
  backfill_inbox(&mut harness);

  // Idle once there's nothing left to do; DONE is held back.
  harness.expect_written(b"A009 IDLE\r\n");
  harness.feed(b"+ idling\r\n");
  harness.expect_written(b"");

  // A new message arrives: leave IDLE, then learn its UID and gm_msgid.
  harness.feed(b"* 4 EXISTS\r\n");
  harness.expect_written(b"DONE\r\n");
  harness.feed(b"A009 OK\r\n");
  harness.expect_written(b"A010 UID FETCH 31:* X-GM-MSGID\r\n");
  harness.feed(b"* 4 FETCH (UID 42 X-GM-MSGID 1042)\r\nA010 OK\r\n");
  harness.expect_written(b"A011 UID FETCH 42 (ENVELOPE FLAGS X-GM-LABELS)\r\n");
  harness.feed(
    b"* 4 FETCH (UID 42 ENVELOPE (NIL \"d\" NIL NIL NIL NIL NIL NIL NIL NIL) FLAGS () X-GM-LABELS ())\r\nA011 OK\r\n",
  );
  harness.expect_written(b"A012 NOOP\r\n");
  harness.feed(b"A012 OK\r\n");

  let snapshot = harness.client.selected().unwrap();
  assert_eq!(4, snapshot.exists);
  assert_eq!(vec![10, 20, 30, 42], snapshot.uids);
  assert!(snapshot.unseen.contains(&42));
  assert_eq!(
    Some(1042),
    harness.client.cache.uid_msgid("INBOX", 42).unwrap()
  );
  // Everything serviced: back to IDLE.
  harness.expect_written(b"A013 IDLE\r\n");
}

#[test]
fn bad_then_check_ok_is_a_real_error() {
  let mut harness = common::Harness::new();
  harness.authenticate("IMAP4rev1 AUTH=PLAIN ESEARCH X-GM-EXT-1");
  select_inbox(&mut harness);
  backfill_inbox(&mut harness);

  harness.client.open_message("INBOX", 10, true).unwrap();
  harness.expect_written(b"A009 UID FETCH 10 BODYSTRUCTURE\r\n");
  harness.feed(b"A009 BAD no\r\n");
  // A BAD in Selected can mean Gmail quietly dropped us back to
  // Authenticated; probe with CHECK.
  harness.expect_written(b"A010 CHECK\r\n");
  harness.feed(b"A010 OK\r\n");
  // CHECK went through: the BAD was genuine; the work is dropped.
  assert!(harness.reported("IMAP command failed"));
  assert_eq!(None, harness.client.queue.get_work());
  assert_eq!(Some("selected"), harness.client.state_name());
}

#[test]
fn bad_then_check_bad_demotes_to_authenticated() {
  let mut harness = common::Harness::new();
  harness.authenticate("IMAP4rev1 AUTH=PLAIN ESEARCH X-GM-EXT-1");
  select_inbox(&mut harness);
  backfill_inbox(&mut harness);

  harness.client.open_message("INBOX", 10, true).unwrap();
  harness.expect_written(b"A009 UID FETCH 10 BODYSTRUCTURE\r\n");
  harness.feed(b"A009 BAD no\r\n");
  harness.expect_written(b"A010 CHECK\r\n");
  harness.feed(b"A010 BAD not allowed now\r\n");
  // The CHECK failed too: the mailbox was deleted server-side and Gmail
  // demoted us; the selected-state work is gone.
  assert_eq!(Some("authenticated"), harness.client.state_name());
  assert_eq!(None, harness.client.queue.get_work());
  assert_eq!(None, harness.client.queue.selected);
}

#[test]
fn disconnect_mid_command() {
  let mut harness = common::Harness::new();
  harness.authenticate("IMAP4rev1 AUTH=PLAIN ESEARCH X-GM-EXT-1");
  harness.client.select_mailbox("INBOX").unwrap();
  harness.expect_written(b"A003 EXAMINE INBOX\r\n");
  harness.feed(b"* 0 EXISTS\r\n* OK [UIDVALIDITY 1]\r\nA003 OK\r\n");
  // The two priming searches are in flight when the server goes away.
  harness.expect_written(
    b"A004 UID SEARCH RETURN (ALL) ALL\r\nA005 UID SEARCH RETURN (ALL) UNSEEN\r\n",
  );
  harness.feed_eof();

  assert!(harness.reported("Disconnected"));
  // Every pending handler saw the disconnect sentinel and every pending
  // unit unwound.
  assert_eq!(0, harness.client.live_operations());
  assert_eq!(None, harness.client.state_name());
  assert!(!harness.client.queue.have_work());
  // A reconnection attempt is scheduled (the user didn't quit).
  assert!(harness.client.reconnect_pending());
  assert!(!harness.client.is_quit());

  // Fire the reconnect deadline: a fresh connection dials and greets.
  harness
    .client
    .on_tick(std::time::Instant::now() + std::time::Duration::from_secs(60));
  assert_eq!(2, harness.state.borrow().opened);
  harness.feed(b"* OK hi again\r\n");
  harness.expect_written(b"A001 CAPABILITY\r\n");
}

#[test]
fn quit_logs_out() {
  let mut harness = common::Harness::new();
  harness.authenticate("IMAP4rev1 AUTH=PLAIN");
  harness.client.quit();
  harness.expect_written(b"A003 LOGOUT\r\n");
  harness.feed(b"* BYE logging out\r\nA003 OK\r\n");
  assert!(harness.client.is_quit());
  assert_eq!(0, harness.client.live_operations());
}

#[test]
fn refresh_list_updates_cache() {
  let mut harness = common::Harness::new();
  harness.authenticate("IMAP4rev1 AUTH=PLAIN LIST-STATUS");
  // Stale state from an earlier run: gone from the server by now.
  harness
    .client
    .cache
    .add_mailbox("stale", b"stale", Some(b'/'), &Default::default())
    .unwrap();

  harness.client.refresh();
  harness.expect_written(b"A003 LIST \"\" * RETURN (STATUS (MESSAGES UNSEEN))\r\n");
  harness.feed(
    b"* LIST (\\HasNoChildren) \"/\" INBOX\r\n\
      * STATUS INBOX (MESSAGES 3 UNSEEN 1)\r\n\
      * LIST (\\HasChildren \\Noselect) \"/\" lists\r\n\
      * LIST (\\HasNoChildren) \"/\" lists/rust\r\n\
      * LIST (\\HasNoChildren) \"/\" {17}\r\n[Gmail]/Sent Mail\r\nA003 OK\r\n",
  );
  assert!(harness.reported("Refreshed mailbox list"));

  let cache = &harness.client.cache;
  assert_eq!(
    vec![
      "INBOX".to_string(),
      "lists".to_string(),
      "lists/rust".to_string(),
      "[Gmail]/Sent Mail".to_string(),
    ],
    cache.mailboxes().unwrap()
  );
  assert_eq!(Some(3), cache.mailbox_exists("INBOX").unwrap());
  assert!(!cache.can_select("lists").unwrap());
  // Work consumed; the state is back to waiting.
  assert!(!harness.client.queue.have_work());
}

#[test]
fn refresh_list_without_list_status() {
  let mut harness = common::Harness::new();
  harness.authenticate("IMAP4rev1 AUTH=PLAIN");
  harness.client.refresh();
  harness.expect_written(b"A003 LIST \"\" *\r\n");
  // Without LIST-STATUS, each selectable mailbox costs one STATUS.
  harness.feed(b"* LIST (\\HasNoChildren) \"/\" INBOX\r\nA003 OK\r\n");
  harness.expect_written(b"A004 STATUS INBOX (MESSAGES UNSEEN)\r\n");
  harness.feed(b"* STATUS INBOX (MESSAGES 7 UNSEEN 2)\r\nA004 OK\r\n");
  assert!(harness.reported("Refreshed mailbox list"));
  assert_eq!(
    Some(7),
    harness.client.cache.mailbox_exists("INBOX").unwrap()
  );
}
