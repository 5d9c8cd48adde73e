// https://www.rfc-editor.org/rfc/rfc3501 - IMAP4rev1
// https://www.rfc-editor.org/rfc/rfc4466 - Collected Extensions to IMAP4 ABNF
// https://www.rfc-editor.org/rfc/rfc4731 - IMAP4 Extension to SEARCH (ESEARCH)
// https://www.rfc-editor.org/rfc/rfc5258 - IMAP4 LIST Command Extensions
// https://www.rfc-editor.org/rfc/rfc7162 - IMAP Extensions: CONDSTORE and QRESYNC
// https://developers.google.com/gmail/imap/imap-extensions - X-GM-EXT-1

pub mod formatter;
pub mod parser;
pub mod scanner;
pub mod types;

/// Render the head of a wire exchange for the debug log: the first line,
/// byte-escaped, with a count of whatever was cut off (literal payloads can
/// run to megabytes).
pub fn preview(bytes: &[u8]) -> String {
  let shown = match memchr::memmem::find(bytes, b"\r\n") {
    Some(at) => at + 2,
    None => bytes.len(),
  };
  let mut text: String = bytes[..shown]
    .iter()
    .flat_map(|byte| std::ascii::escape_default(*byte))
    .map(char::from)
    .collect();
  if shown < bytes.len() {
    text.push_str(&format!(" [+{} byte(s)]", bytes.len() - shown));
  }
  text
}

/// Decode a modified UTF-7 mailbox name (RFC 3501 §5.1.3): runs of
/// printable US-ASCII, with "&...-" sections holding modified-BASE64 of
/// UTF-16BE code units and "&-" denoting a literal ampersand. Returns None
/// on malformed input; the caller falls back to a lossy UTF-8 decode
/// because some servers send names that were never UTF-7 to begin with.
pub fn utf7_to_utf8(input: &[u8]) -> Option<String> {
  use base64::Engine as _;
  let engine = base64::engine::GeneralPurpose::new(
    &base64::alphabet::IMAP_MUTF7,
    base64::engine::general_purpose::NO_PAD,
  );
  let mut decoded = String::with_capacity(input.len());
  let mut rest = input;
  while let Some(shift) = memchr::memchr(b'&', rest) {
    push_printable_ascii(&mut decoded, &rest[..shift])?;
    let section = &rest[shift + 1..];
    // A shift with no closing "-" is malformed.
    let close = memchr::memchr(b'-', section)?;
    if close == 0 {
      decoded.push('&');
    } else {
      let units = engine.decode(&section[..close]).ok()?;
      let pairs = units.chunks_exact(2);
      if !pairs.remainder().is_empty() {
        // UTF-16 comes in whole big-endian code units.
        return None;
      }
      let utf16 = pairs.map(|unit| u16::from_be_bytes([unit[0], unit[1]]));
      for character in char::decode_utf16(utf16) {
        decoded.push(character.ok()?);
      }
    }
    rest = &section[close + 1..];
  }
  push_printable_ascii(&mut decoded, rest)?;
  Some(decoded)
}

// Outside a shift, only printable US-ASCII stands for itself ("&" never
// reaches here; the caller splits on it).
fn push_printable_ascii(decoded: &mut String, bytes: &[u8]) -> Option<()> {
  for byte in bytes {
    if !(0x20..=0x7e).contains(byte) {
      return None;
    }
    decoded.push(char::from(*byte));
  }
  Some(())
}

/// Display form of a raw mailbox name.
pub fn decode_mailbox_name(raw: &[u8]) -> String {
  match utf7_to_utf8(raw) {
    Some(name) => name,
    None => String::from_utf8_lossy(raw).into_owned(),
  }
}

/// Collapse sorted-or-not ids into minimal inclusive ranges, e.g.
/// [1, 3, 4, 5, 7] becomes [(1, 1), (3, 5), (7, 7)].
pub fn sequence_set<I: IntoIterator<Item = u32>>(ids: I) -> Vec<(u32, u32)> {
  let mut ids = ids.into_iter().collect::<Vec<_>>();
  ids.sort_unstable();
  ids.dedup();
  let mut ranges: Vec<(u32, u32)> = Vec::new();
  for id in ids {
    match ranges.last_mut() {
      Some((_, end)) if *end + 1 == id => *end = id,
      _ => ranges.push((id, id)),
    }
  }
  ranges
}

/// The label Gmail implies for a mailbox but omits from X-GM-LABELS: system
/// mailboxes map to their system label, "[Gmail]/All Mail" carries none
/// (every message lives there), anything else is labeled by its own name.
pub fn mailbox_label(raw_name: &[u8]) -> Option<Vec<u8>> {
  static SYSTEM: &[(&[u8], &[u8])] = &[
    (b"INBOX", b"\\Inbox"),
    (b"[Gmail]/Drafts", b"\\Draft"),
    (b"[Gmail]/Important", b"\\Important"),
    (b"[Gmail]/Sent Mail", b"\\Sent"),
    (b"[Gmail]/Spam", b"\\Spam"),
    (b"[Gmail]/Starred", b"\\Starred"),
    (b"[Gmail]/Trash", b"\\Trash"),
  ];
  if raw_name == b"[Gmail]/All Mail" {
    return None;
  }
  for (name, label) in SYSTEM {
    if *name == raw_name {
      return Some(label.to_vec());
    }
  }
  Some(raw_name.to_vec())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn previews() {
    assert_eq!("", preview(b""));
    assert_eq!("* OK hi\\r\\n", preview(b"* OK hi\r\n"));
    // Only the first line is shown; the rest is counted.
    assert_eq!(
      "* OK hi\\r\\n [+9 byte(s)]",
      preview(b"* OK hi\r\nA001 OK\r\n")
    );
    assert_eq!("no newline", preview(b"no newline"));
  }

  #[test]
  fn utf7() {
    // https://www.rfc-editor.org/rfc/rfc3501#section-5.1.3
    assert_eq!("", utf7_to_utf8(b"").unwrap());
    assert_eq!("&", utf7_to_utf8(b"&-").unwrap());
    assert_eq!(
      "~peter/mail/台北/日本語",
      utf7_to_utf8(b"~peter/mail/&U,BTFw-/&ZeVnLIqe-").unwrap()
    );
    // "&Jjo!" doesn't shift back to US-ASCII before the "!".
    assert_eq!(None, utf7_to_utf8(b"&Jjo!"));
    assert_eq!("☺!", utf7_to_utf8(b"&Jjo-!").unwrap());
    // A shifted section must hold whole big-endian UTF-16 code units.
    assert_eq!(None, utf7_to_utf8(b"&QQ-"));
    assert_eq!("A", utf7_to_utf8(b"&AEE-").unwrap());
    // Control and 8-bit bytes never appear outside a shift.
    assert_eq!(None, utf7_to_utf8(b"tab\there"));
  }

  #[test]
  fn decode_fallback() {
    assert_eq!("INBOX", decode_mailbox_name(b"INBOX"));
    // Not modified UTF-7 (raw 8-bit), decoded lossily instead of erroring.
    assert_eq!("caf\u{fffd}", decode_mailbox_name(b"caf\xe9"));
  }

  #[test]
  fn sequence_sets() {
    assert_eq!(Vec::<(u32, u32)>::new(), sequence_set([]));
    assert_eq!(vec![(1, 1), (3, 5), (7, 7)], sequence_set([7, 1, 3, 4, 5]));
    assert_eq!(vec![(2, 3)], sequence_set([2, 3, 3]));
  }

  #[test]
  fn labels() {
    assert_eq!(Some(b"\\Inbox".to_vec()), mailbox_label(b"INBOX"));
    assert_eq!(Some(b"\\Sent".to_vec()), mailbox_label(b"[Gmail]/Sent Mail"));
    assert_eq!(None, mailbox_label(b"[Gmail]/All Mail"));
    assert_eq!(Some(b"lists/rust".to_vec()), mailbox_label(b"lists/rust"));
  }
}
