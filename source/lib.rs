// https://www.rfc-editor.org/rfc/rfc3501 - IMAP4rev1
// https://www.rfc-editor.org/rfc/rfc4731 - ESEARCH
// https://www.rfc-editor.org/rfc/rfc5258 - LIST extensions (LIST-STATUS)
// https://www.rfc-editor.org/rfc/rfc7162 - CONDSTORE/QRESYNC
// https://developers.google.com/gmail/imap/imap-extensions - X-GM-EXT-1
//
// grist keeps a local SQLite cache consistent with a Gmail IMAP mailbox.
// The library is the whole engine: wire parser and formatter, cache, the
// operation tree, the connection state machine and the work queue. The
// binary is a thin stand-in for a terminal UI: it reads intents from stdin
// and surfaces status lines.

use anyhow::Context as _;
use std::io::BufRead as _;
use std::{io, path, time};

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod imap;
pub mod operation;
pub mod seque;
pub mod stack;
pub mod work;

pub use error::{Error, Result};

#[derive(clap::Args)]
#[group(skip)]
pub struct Arguments {
  #[arg(
    long = "config",
    help = "Configuration file",
    default_value_t = String::from("gristrc")
  )]
  pub config: String,
  #[arg(
    long = "database",
    help = "Cache database file",
    default_value_t = String::from("grist.db")
  )]
  pub database: String,
}

/// Status lines for a user watching the terminal.
struct ConsoleStatus;

impl engine::Status for ConsoleStatus {
  fn update_status(&mut self, message: &str, level: engine::Level) {
    match level {
      engine::Level::Info => println!("* {message}"),
      engine::Level::Error => println!("! {message}"),
    }
  }
}

pub fn run(arguments: &Arguments) -> anyhow::Result<()> {
  let config = config::Config::load(path::Path::new(&arguments.config))?;
  let password = config.imap.password()?;
  if !config.imap.ssl {
    log::warn!("TLS not enabled, credentials will be sent in clear over the wire");
  }
  let mut cache = cache::Cache::open(path::Path::new(&arguments.database))?;
  cache.register_listener(Box::new(|notification| {
    log::debug!("cache: {notification:?}");
  }));
  let open = engine::opener(&config.imap.host, config.imap.port, config.imap.ssl);
  let mut client = engine::Client::new(
    open,
    ConsoleStatus,
    cache,
    config.imap.user.clone(),
    password,
  );
  client.start();
  client.refresh();
  client.select_mailbox("INBOX")?;

  let stdin = io::stdin();
  while !client.is_quit() {
    let (pollable, deadline) = client.wants();
    let mut entries = vec![(
      libc::STDIN_FILENO,
      event::Interest::READABLE,
      event::Ready::default(),
    )];
    if let Some((fd, interest)) = pollable {
      entries.push((fd, interest, event::Ready::default()));
    }
    let timeout = deadline.map(|at| at.saturating_duration_since(time::Instant::now()));
    event::wait(&mut entries, timeout).with_context(|| "poll failed")?;
    if entries[0].2.readable {
      handle_input(&mut client, &stdin);
    }
    if let Some((_, _, ready)) = entries.get(1) {
      if ready.readable || ready.writable || ready.hangup {
        client.on_ready(ready.readable || ready.hangup, ready.writable);
      }
    }
    client.on_tick(time::Instant::now());
  }
  Ok(())
}

/// One intent per line. Deliberately crude: the real front-end is a widget
/// layer subscribing to cache notifications, not this parser.
fn handle_input<O: engine::Open, S: engine::Status>(
  client: &mut engine::Client<O, S>,
  stdin: &io::Stdin,
) {
  let mut line = String::new();
  match stdin.lock().read_line(&mut line) {
    Ok(0) => {
      client.quit();
      return;
    }
    Ok(_) => (),
    Err(error) => {
      log::error!("stdin: {error}");
      return;
    }
  }
  let line = line.trim_end();
  let (command, rest) = match line.split_once(' ') {
    Some((command, rest)) => (command, rest.trim()),
    None => (line, ""),
  };
  let outcome = match command {
    "" => Ok(()),
    "quit" => {
      client.quit();
      Ok(())
    }
    "refresh" => {
      client.refresh();
      Ok(())
    }
    "select" => client.select_mailbox(rest),
    "mailboxes" => client.cache.mailboxes().map(|mailboxes| {
      for mailbox in mailboxes {
        println!("{mailbox}");
      }
    }),
    "messages" => client.cache.messages_by_date_desc(rest, 20).map(|messages| {
      for (uid, gm_msgid) in messages {
        println!("{uid} {gm_msgid:x}");
      }
    }),
    "open" => match rest.split_once(' ') {
      Some((uid, mailbox)) => match uid.parse() {
        Ok(uid) => client.open_message(mailbox.trim(), uid, true),
        Err(_) => Err(Error::UserIntent(format!("bad uid {uid:?}"))),
      },
      None => Err(Error::UserIntent("usage: open <uid> <mailbox>".to_string())),
    },
    "read" => {
      // read <uid> <section[,section...]> <mailbox>
      let mut words = rest.splitn(3, ' ');
      match (words.next(), words.next(), words.next()) {
        (Some(uid), Some(sections), Some(mailbox)) => match uid.parse() {
          Ok(uid) => client.read_body_sections(
            mailbox.trim(),
            uid,
            sections.split(',').map(str::to_string).collect(),
          ),
          Err(_) => Err(Error::UserIntent(format!("bad uid {uid:?}"))),
        },
        _ => Err(Error::UserIntent(
          "usage: read <uid> <section[,section...]> <mailbox>".to_string(),
        )),
      }
    }
    other => Err(Error::UserIntent(format!("unknown command {other:?}"))),
  };
  if let Err(error) = outcome {
    println!("! {error}");
  }
}
