// Recursive-descent (PEG) parser over the IMAP4rev1 response grammar plus
// the extensions this client speaks: CAPABILITY, IDLE, LIST-STATUS,
// CONDSTORE, ESEARCH, ENABLE and X-GM-EXT-1. The scanner guarantees whole
// logical lines, so every parse failure here is a real protocol problem and
// is reported with the offending buffer and byte offset.

use crate::error::{Error, Result};
use crate::imap::types::{
  Address, BodyExt1Part, BodyExtMPart, BodyExtension, BodyFields, BodyStructure, Capability, Code,
  Condition, Envelope, Esearch, Fetch, FetchItems, List, Response, ResponseText, Section,
  StatusAttribute, StatusData, Tagged, Untagged,
};
use std::collections::BTreeSet;
use std::str;

/// Parse one complete response line (CRLF included) as produced by the
/// scanner.
pub fn parse(line: &[u8]) -> Result<Response> {
  grammar::response(line).map_err(|error| Error::Parse {
    buffer: line.to_vec(),
    cursor: error.location,
    reason: format!("expected {}", error.expected),
  })
}

fn lossy(bytes: &[u8]) -> String {
  String::from_utf8_lossy(bytes).into_owned()
}

fn parse_u32(bytes: &[u8]) -> Option<u32> {
  // Guaranteed ASCII digits by the grammar; the range check still matters.
  str::from_utf8(bytes).ok()?.parse().ok()
}

fn parse_u64(bytes: &[u8]) -> Option<u64> {
  str::from_utf8(bytes).ok()?.parse().ok()
}

/// RFC 5322 permits a lot and real servers emit even more; a date that
/// doesn't parse is absent, never an error.
fn rfc5322_date(bytes: &[u8]) -> Option<chrono::DateTime<chrono::FixedOffset>> {
  let text = String::from_utf8_lossy(bytes);
  let mut text = text.trim();
  // Strip a trailing zone comment like "(PDT)".
  if text.ends_with(')') {
    if let Some(open) = text.rfind('(') {
      text = text[..open].trim_end();
    }
  }
  chrono::DateTime::parse_from_rfc2822(text).ok()
}

/// INTERNALDATE date-time, e.g. `17-Jul-1996 02:44:25 -0700` (the day may be
/// space-padded).
fn internal_date(bytes: &[u8]) -> Option<chrono::DateTime<chrono::FixedOffset>> {
  chrono::DateTime::parse_from_str(
    String::from_utf8_lossy(bytes).trim_start(),
    "%d-%b-%Y %H:%M:%S %z",
  )
  .ok()
}

// One FETCH attribute before aggregation.
enum Att {
  Uid(u32),
  Flags(BTreeSet<String>),
  Envelope(Envelope),
  InternalDate(chrono::DateTime<chrono::FixedOffset>),
  Rfc822Size(u32),
  BodyStructure(BodyStructure),
  Section(String, Option<u32>, Option<Vec<u8>>),
  ModSeq(u64),
  GmMsgid(u64),
  GmThrid(u64),
  GmLabels(BTreeSet<Vec<u8>>),
}

/// Fold the attribute list into one `FetchItems`, aggregating every
/// `BODY[section]<origin>` under the `sections` map.
fn collect_atts(atts: Vec<Att>) -> FetchItems {
  let mut items = FetchItems::default();
  for att in atts {
    match att {
      Att::Uid(uid) => items.uid = Some(uid),
      Att::Flags(flags) => items.flags = Some(flags),
      Att::Envelope(envelope) => items.envelope = Some(envelope),
      Att::InternalDate(date) => items.internal_date = Some(date),
      Att::Rfc822Size(size) => items.rfc822_size = Some(size),
      Att::BodyStructure(body) => items.bodystructure = Some(body),
      Att::Section(section, origin, content) => {
        items.sections.insert(section, Section { origin, content });
      }
      Att::ModSeq(modseq) => items.modseq = Some(modseq),
      Att::GmMsgid(msgid) => items.gm_msgid = Some(msgid),
      Att::GmThrid(thrid) => items.gm_thrid = Some(thrid),
      Att::GmLabels(labels) => items.gm_labels = Some(labels),
    }
  }
  items
}

enum Tail {
  Exists,
  Recent,
  Expunge,
  Fetch(FetchItems),
}

enum EsearchItem {
  Min(u32),
  Max(u32),
  Count(u32),
  All(Vec<(u32, u32)>),
}

// The naive l:$(CHAR8()*<{n}>) would push every byte into a vector before
// discarding it. Literal payloads are how message bodies arrive, so skip
// over them with the undocumented escape hatch instead:
// https://github.com/kevinmehall/rust-peg/issues/284
trait ParserHacks {
  fn skip(&self, position: usize, n: usize) -> peg::RuleResult<()>;
}

impl ParserHacks for [u8] {
  fn skip(&self, position: usize, n: usize) -> peg::RuleResult<()> {
    if self.len() >= position + n {
      return peg::RuleResult::Matched(position + n, ());
    }
    peg::RuleResult::Failed
  }
}

peg::parser! {
  // https://www.rfc-editor.org/rfc/rfc2234#section-2.3
  // https://www.rfc-editor.org/rfc/rfc3501#section-9
  grammar grammar() for [u8] {
    // CR = %x0D
    rule CR() = "\r"
    // LF = %x0A
    rule LF() = "\n"
    // CRLF = CR LF
    rule CRLF() = CR() LF()
    // CHAR = %x01-7F
    rule CHAR() -> u8
      = [b'\x01'..=b'\x7f']
    // CHAR8 = %x01-ff
    rule CHAR8() = [b'\x01'..=b'\xff']
    // CTL = %x00-1F / %x7F
    rule CTL() = [b'\x00'..=b'\x1f'] / "\x7f"
    // DQUOTE = %x22
    rule DQUOTE() -> u8
      = "\""
      { b'"' }
    rule SP() = " "
    // TEXT-CHAR = <any CHAR except CR and LF>
    rule TEXT_CHAR() -> u8
      = !(CR() / LF()) c:CHAR()
      { c }
    // DIGIT = %x30-39
    rule DIGIT() = [b'\x30'..=b'\x39']
    // digit-nz = %x31-39
    rule digit_nz() = [b'\x31'..=b'\x39']

    // number = 1*DIGIT
    rule number() -> u32
      = n:$(DIGIT()+)
      {? parse_u32(n).ok_or("number") }
    // Some quantities (mod-sequences, Gmail message ids) are 64-bit.
    rule number64() -> u64
      = n:$(DIGIT()+)
      {? parse_u64(n).ok_or("number") }
    rule number_usize() -> usize
      = n:$(DIGIT()+)
      {? parse_u64(n).and_then(|n| usize::try_from(n).ok()).ok_or("number") }
    // nz-number = digit-nz *DIGIT
    rule nz_number() -> u32
      = n:$(digit_nz() DIGIT()*)
      {? parse_u32(n).ok_or("number") }
    // text = 1*TEXT-CHAR
    rule text() -> &'input [u8] = $(TEXT_CHAR()+)

    // nil = "NIL"
    rule nil() = "NIL"
    // list-wildcards = "%" / "*"
    rule list_wildcards() = "%" / "*"
    // quoted-specials = DQUOTE / "\"
    rule quoted_specials() -> u8
      = c:(DQUOTE() / ("\\" { b'\\' }))
      { c }
    // QUOTED-CHAR = <any TEXT-CHAR except quoted-specials> / "\" quoted-specials
    rule QUOTED_CHAR() -> u8
      = !quoted_specials() c:TEXT_CHAR() { c } / "\\" c:quoted_specials()
      { c }
    // resp-specials = "]"
    rule resp_specials() = "]"
    // atom-specials = "(" / ")" / "{" / SP / CTL / list-wildcards / quoted-specials / resp-specials
    rule atom_specials() = "(" / ")" / "{" / SP() / CTL() / list_wildcards() / quoted_specials() / resp_specials()
    // ATOM-CHAR = <any CHAR except atom-specials>
    rule ATOM_CHAR() = !atom_specials() CHAR()
    // atom = 1*ATOM-CHAR
    rule atom() -> &'input [u8] = $(ATOM_CHAR()+)
    // ASTRING-CHAR = ATOM-CHAR / resp-specials
    rule ASTRING_CHAR() = ATOM_CHAR() / resp_specials()
    // quoted = DQUOTE *QUOTED-CHAR DQUOTE
    rule quoted() -> Vec<u8>
      = DQUOTE() q:(QUOTED_CHAR()*) DQUOTE()
      { q }
    // literal = "{" number "}" CRLF *CHAR8
    rule literal() -> &'input [u8]
      = "{" n:number_usize() "}" CRLF() l:$(##skip(n))
      { l }
    // string = quoted / literal
    rule string() -> Vec<u8>
      = q:quoted() { q } / l:literal() { l.to_vec() }
    // astring = 1*ASTRING-CHAR / string
    rule astring() -> Vec<u8>
      = s:$(ASTRING_CHAR()+) { s.to_vec() } / string()
    // nstring = string / nil
    rule nstring() -> Option<Vec<u8>>
      = s:string() { Some(s) } / nil() { None }

    // Dispatch tokens (FETCH items, status attributes, response-text codes)
    // are matched case-insensitively against their interned spelling.
    rule token() -> &'input [u8]
      = $(([b'a'..=b'z'] / [b'A'..=b'Z'] / [b'0'..=b'9'] / "." / "-")+)
    rule keyword(kw: &'static str)
      = t:token()
      {? if t.eq_ignore_ascii_case(kw.as_bytes()) { Ok(()) } else { Err(kw) } }

    // tag = 1*<any ASTRING-CHAR except "+">
    rule tag() -> &'input [u8] = $((!"+" ASTRING_CHAR())+)

    // capability = ("AUTH=" auth-type) / atom
    // "=" is an ATOM-CHAR, so a plain atom covers both arms.
    rule capability() -> Capability
      = c:atom()
      { Capability::from_bytes(c) }

    // flag = "\Answered" / "\Flagged" / "\Deleted" / "\Seen" / "\Draft" /
    //        flag-keyword / flag-extension
    // flag-extension admits any system flag, so one rule is equivalent.
    rule flag() -> String
      = f:$("\\"? atom())
      { lossy(f) }
    // flag-perm = flag / "\*"
    rule flag_perm() -> String
      = f:$("\\*") { lossy(f) } / flag()
    // "(" [flag-fetch *(SP flag-fetch)] ")" -- flag-fetch admits \Recent.
    rule flag_list() -> BTreeSet<String>
      = "(" fs:(flag() ** SP()) ")"
      { fs.into_iter().collect() }

    // mailbox = "INBOX" / astring
    rule mailbox() -> Vec<u8>
      = m:astring()
      { if m.eq_ignore_ascii_case(b"INBOX") { b"INBOX".to_vec() } else { m } }

    // mbx-list-flags, rewritten for simplicity.
    rule mbx_list_flags() -> BTreeSet<String>
      = fs:((f:$("\\" atom()) { lossy(f) }) ** SP())
      { fs.into_iter().collect() }
    // mailbox-list = "(" [mbx-list-flags] ")" SP (DQUOTE QUOTED-CHAR DQUOTE / nil) SP mailbox
    rule mailbox_list() -> List
      = "(" fs:mbx_list_flags() ")" SP()
        d:(DQUOTE() c:QUOTED_CHAR() DQUOTE() { Some(c) } / nil() { None }) SP()
        m:mailbox()
      { List { attributes: fs, delimiter: d, mailbox: m } }

    // status-att = "MESSAGES" / "RECENT" / "UIDNEXT" / "UIDVALIDITY" / "UNSEEN"
    // https://www.rfc-editor.org/rfc/rfc7162#section-7: status-att =/ "HIGHESTMODSEQ"
    rule status_att() -> (StatusAttribute, u64)
      = a:(keyword("MESSAGES") { StatusAttribute::Messages }
          / keyword("RECENT") { StatusAttribute::Recent }
          / keyword("UIDNEXT") { StatusAttribute::UidNext }
          / keyword("UIDVALIDITY") { StatusAttribute::UidValidity }
          / keyword("UNSEEN") { StatusAttribute::Unseen }
          / keyword("HIGHESTMODSEQ") { StatusAttribute::HighestModSeq })
        SP() n:number64()
      { (a, n) }

    // seq-range = seq-number ":" seq-number -- 2:4 and 4:2 are equivalent.
    rule seq_range() -> (u32, u32)
      = a:nz_number() ":" b:nz_number()
      { if a <= b { (a, b) } else { (b, a) } }
    // sequence-set, concrete numbers only (as found in ESEARCH replies).
    rule sequence_set() -> Vec<(u32, u32)>
      = (seq_range() / n:nz_number() { (n, n) }) ++ ","

    // https://www.rfc-editor.org/rfc/rfc4731#section-3.1
    // esearch-response = "ESEARCH" [search-correlator] [SP "UID"] *(SP search-return-data)
    rule esearch_item() -> EsearchItem
      = keyword("MIN") SP() n:number() { EsearchItem::Min(n) }
      / keyword("MAX") SP() n:number() { EsearchItem::Max(n) }
      / keyword("COUNT") SP() n:number() { EsearchItem::Count(n) }
      / keyword("ALL") SP() s:sequence_set() { EsearchItem::All(s) }
    rule esearch_data() -> Esearch
      = keyword("ESEARCH")
        t:(SP() "(" keyword("TAG") SP() s:string() ")" { lossy(&s) })?
        uid:(SP() keyword("UID") { () })?
        items:((SP() i:esearch_item() { i })*)
      {
        let mut esearch = Esearch { tag: t, uid: uid.is_some(), ..Esearch::default() };
        for item in items {
          match item {
            EsearchItem::Min(n) => esearch.min = Some(n),
            EsearchItem::Max(n) => esearch.max = Some(n),
            EsearchItem::Count(n) => esearch.count = Some(n),
            EsearchItem::All(s) => esearch.all = Some(s),
          }
        }
        esearch
      }

    // address = "(" addr-name SP addr-adl SP addr-mailbox SP addr-host ")"
    rule address() -> Address
      = "(" name:nstring() SP() adl:nstring() SP() mailbox:nstring() SP() host:nstring() ")"
      { Address { name, adl, mailbox, host } }
    // env-from & co = "(" 1*address ")" / nil
    rule env_addrs() -> Option<Vec<Address>>
      = nil() { None } / "(" a:(address()+) ")" { Some(a) }
    // envelope = "(" env-date SP env-subject SP env-from SP env-sender SP
    //            env-reply-to SP env-to SP env-cc SP env-bcc SP
    //            env-in-reply-to SP env-message-id ")"
    rule envelope() -> Envelope
      = "(" date:nstring() SP() subject:nstring() SP()
        from:env_addrs() SP() sender:env_addrs() SP() reply_to:env_addrs() SP()
        to:env_addrs() SP() cc:env_addrs() SP() bcc:env_addrs() SP()
        in_reply_to:nstring() SP() message_id:nstring() ")"
      {
        Envelope {
          date: date.as_deref().and_then(rfc5322_date),
          subject, from, sender, reply_to, to, cc, bcc, in_reply_to, message_id,
        }
      }

    // body-fld-param = "(" string SP string *(SP string SP string) ")" / nil
    rule body_fld_param() -> Vec<(String, String)>
      = "(" ps:((k:string() SP() v:string() { (lossy(&k).to_lowercase(), lossy(&v)) }) ++ SP()) ")" { ps }
      / nil() { Vec::new() }
    // body-fld-dsp = "(" string SP body-fld-param ")" / nil
    rule body_fld_dsp() -> Option<(String, Vec<(String, String)>)>
      = "(" t:string() SP() p:body_fld_param() ")" { Some((lossy(&t).to_lowercase(), p)) }
      / nil() { None }
    // body-fld-lang = nstring / "(" string *(SP string) ")"
    rule body_fld_lang() -> Option<Vec<String>>
      = "(" ls:((s:string() { lossy(&s) }) ++ SP()) ")" { Some(ls) }
      / s:nstring() { s.map(|s| vec![lossy(&s)]) }
    // body-extension = nstring / number / "(" body-extension *(SP body-extension) ")"
    rule body_extension() -> BodyExtension
      = "(" es:(body_extension() ++ SP()) ")" { BodyExtension::List(es) }
      / n:number() { BodyExtension::Number(n) }
      / s:nstring() { BodyExtension::String(s) }
    // body-ext-1part = body-fld-md5 [SP body-fld-dsp [SP body-fld-lang
    //                  [SP body-fld-loc *(SP body-extension)]]]
    // Greedy: whatever trails the last known field is kept opaque.
    rule body_ext_1part() -> BodyExt1Part
      = md5:nstring()
        dsp:(SP() d:body_fld_dsp() { d })?
        lang:(SP() l:body_fld_lang() { l })?
        location:(SP() s:nstring() { s })?
        extension:((SP() e:body_extension() { e })*)
      {
        BodyExt1Part {
          md5: md5.as_deref().map(lossy),
          disposition: dsp.flatten(),
          lang: lang.flatten(),
          location: location.flatten().as_deref().map(lossy),
          extension,
        }
      }
    // body-ext-mpart = body-fld-param [SP body-fld-dsp [SP body-fld-lang
    //                  [SP body-fld-loc *(SP body-extension)]]]
    rule body_ext_mpart() -> BodyExtMPart
      = params:body_fld_param()
        dsp:(SP() d:body_fld_dsp() { d })?
        lang:(SP() l:body_fld_lang() { l })?
        location:(SP() s:nstring() { s })?
        extension:((SP() e:body_extension() { e })*)
      {
        BodyExtMPart {
          params,
          disposition: dsp.flatten(),
          lang: lang.flatten(),
          location: location.flatten().as_deref().map(lossy),
          extension,
        }
      }
    // body-fields = body-fld-param SP body-fld-id SP body-fld-desc SP
    //               body-fld-enc SP body-fld-octets
    rule body_fields() -> BodyFields
      = params:body_fld_param() SP() id:nstring() SP() description:nstring() SP()
        encoding:string() SP() size:number()
      {
        BodyFields {
          params,
          id: id.as_deref().map(lossy),
          description: description.as_deref().map(lossy),
          encoding: lossy(&encoding).to_lowercase(),
          size,
        }
      }
    rule media_ci(kw: &'static str)
      = t:string()
      {? if t.eq_ignore_ascii_case(kw.as_bytes()) { Ok(()) } else { Err(kw) } }
    // body-type-1part = (body-type-basic / body-type-msg / body-type-text)
    //                   [SP body-ext-1part]
    rule body_type_1part() -> BodyStructure
      = media_ci("TEXT") SP() subtype:string() SP() fields:body_fields() SP() lines:number()
        extension:(SP() e:body_ext_1part() { e })?
      { BodyStructure::Text { subtype: lossy(&subtype).to_lowercase(), fields, lines, extension } }
      / media_ci("MESSAGE") SP() media_ci("RFC822") SP() fields:body_fields() SP()
        envelope:envelope() SP() body:body() SP() lines:number()
        extension:(SP() e:body_ext_1part() { e })?
      {
        BodyStructure::Message {
          fields, envelope: Box::new(envelope), body: Box::new(body), lines, extension,
        }
      }
      / media_type:string() SP() subtype:string() SP() fields:body_fields()
        extension:(SP() e:body_ext_1part() { e })?
      {
        BodyStructure::Basic {
          media_type: lossy(&media_type).to_lowercase(),
          subtype: lossy(&subtype).to_lowercase(),
          fields,
          extension,
        }
      }
    // body-type-mpart = 1*body SP media-subtype [SP body-ext-mpart]
    rule body_type_mpart() -> BodyStructure
      = parts:(body()+) SP() subtype:string()
        extension:(SP() e:body_ext_mpart() { e })?
      { BodyStructure::Multipart { subtype: lossy(&subtype).to_lowercase(), parts, extension } }
    // body = "(" (body-type-1part / body-type-mpart) ")"
    rule body() -> BodyStructure
      = "(" b:(body_type_mpart() / body_type_1part()) ")"
      { b }

    // section = "[" [section-spec] "]" -- kept as the raw text between the
    // brackets; splitting it further buys nothing.
    rule section_spec() -> String
      = s:$((!"]" CHAR8())*)
      { lossy(s) }
    // X-GM-LABELS returns a parenthesized list of flag-ish atoms or astrings.
    rule gm_label() -> Vec<u8>
      = l:$("\\" atom()) { l.to_vec() } / astring()

    // msg-att = "(" (msg-att-dynamic / msg-att-static)
    //           *(SP (msg-att-dynamic / msg-att-static)) ")"
    // Unknown attributes fail the parse on purpose.
    rule msg_att_item() -> Att
      = keyword("FLAGS") SP() fs:flag_list() { Att::Flags(fs) }
      / keyword("ENVELOPE") SP() e:envelope() { Att::Envelope(e) }
      / keyword("INTERNALDATE") SP() DQUOTE() d:$((!DQUOTE() CHAR())*) DQUOTE()
        {? internal_date(d).map(Att::InternalDate).ok_or("date-time") }
      / keyword("RFC822.SIZE") SP() n:number() { Att::Rfc822Size(n) }
      / keyword("RFC822.HEADER") SP() s:nstring() { Att::Section("HEADER".to_string(), None, s) }
      / keyword("RFC822.TEXT") SP() s:nstring() { Att::Section("TEXT".to_string(), None, s) }
      / keyword("RFC822") SP() s:nstring() { Att::Section(String::new(), None, s) }
      / keyword("BODYSTRUCTURE") SP() b:body() { Att::BodyStructure(b) }
      / keyword("BODY") "[" s:section_spec() "]" o:("<" n:number() ">" { n })? SP() c:nstring()
        { Att::Section(s, o, c) }
      / keyword("BODY") SP() b:body() { Att::BodyStructure(b) }
      / keyword("UID") SP() n:nz_number() { Att::Uid(n) }
      / keyword("MODSEQ") SP() "(" n:number64() ")" { Att::ModSeq(n) }
      / keyword("X-GM-MSGID") SP() n:number64() { Att::GmMsgid(n) }
      / keyword("X-GM-THRID") SP() n:number64() { Att::GmThrid(n) }
      / keyword("X-GM-LABELS") SP() "(" ls:(gm_label() ** SP()) ")"
        { Att::GmLabels(ls.into_iter().collect()) }
    rule msg_att() -> FetchItems
      = "(" atts:(msg_att_item() ++ SP()) ")"
      { collect_atts(atts) }

    // message-data = nz-number SP ("EXPUNGE" / ("FETCH" SP msg-att)); some
    // mailbox-data (EXISTS, RECENT, both of which may be 0) also starts
    // with a number.
    rule message_data_tail() -> Tail
      = keyword("EXPUNGE") { Tail::Expunge }
      / keyword("EXISTS") { Tail::Exists }
      / keyword("RECENT") { Tail::Recent }
      / keyword("FETCH") SP() items:msg_att() { Tail::Fetch(items) }
    rule message_data() -> Untagged
      = n:number() SP() tail:message_data_tail()
      {
        match tail {
          Tail::Exists => Untagged::Exists(n),
          Tail::Recent => Untagged::Recent(n),
          Tail::Expunge => Untagged::Expunge(n),
          Tail::Fetch(items) => Untagged::Fetch(Fetch { msg: n, items }),
        }
      }

    // resp-text-code, interned. Unrecognized codes keep their raw spelling.
    rule resp_text_code() -> Code
      = keyword("ALERT") { Code::Alert }
      / keyword("PARSE") { Code::Parse }
      / keyword("READ-ONLY") { Code::ReadOnly }
      / keyword("READ-WRITE") { Code::ReadWrite }
      / keyword("TRYCREATE") { Code::TryCreate }
      / keyword("CLOSED") { Code::Closed }
      / keyword("NOMODSEQ") { Code::NoModSeq }
      / keyword("UIDNEXT") SP() n:nz_number() { Code::UidNext(n) }
      / keyword("UIDVALIDITY") SP() n:nz_number() { Code::UidValidity(n) }
      / keyword("UNSEEN") SP() n:number() { Code::Unseen(n) }
      / keyword("HIGHESTMODSEQ") SP() n:number64() { Code::HighestModSeq(n) }
      / keyword("PERMANENTFLAGS") SP() "(" fs:(flag_perm() ** SP()) ")"
        { Code::PermanentFlags(fs.into_iter().collect()) }
      / keyword("CAPABILITY") cs:((SP() c:capability() { c })+) { Code::Capability(cs) }
      / a:atom() d:(SP() d:$((!(resp_specials() / CR() / LF()) CHAR())+) { lossy(d) })?
        { Code::Other(lossy(a).to_uppercase(), d) }

    // resp-text = ["[" resp-text-code "]" SP] text
    // Gmail sometimes omits the text after the bracketed code.
    rule resp_text() -> ResponseText
      = "[" c:resp_text_code() "]" t:(SP() t:text() { lossy(t) })?
        { ResponseText { code: Some(c), text: t } }
      / t:text() { ResponseText { code: None, text: Some(lossy(t)) } }
    // "A1 OK done", the bare "A1 OK" and even "A1 OK " are seen in the wild.
    rule resp_tail() -> ResponseText
      = SP() t:resp_text() { t }
      / SP() { ResponseText::default() }
      / "" { ResponseText::default() }

    rule condition() -> Condition
      = keyword("OK") { Condition::Ok }
      / keyword("NO") { Condition::No }
      / keyword("BAD") { Condition::Bad }

    // response-data = "*" SP (resp-cond-state / resp-cond-bye / mailbox-data /
    //                 message-data / capability-data) CRLF
    rule untagged_body() -> Untagged
      = message_data()
      / keyword("OK") t:resp_tail() { Untagged::Ok(t) }
      / keyword("NO") t:resp_tail() { Untagged::No(t) }
      / keyword("BAD") t:resp_tail() { Untagged::Bad(t) }
      / keyword("PREAUTH") t:resp_tail() { Untagged::PreAuth(t) }
      / keyword("BYE") t:resp_tail() { Untagged::Bye(t) }
      / keyword("CAPABILITY") cs:((SP() c:capability() { c })*) { Untagged::Capability(cs) }
      / keyword("ENABLED") cs:((SP() c:capability() { c })*) { Untagged::Enabled(cs) }
      / keyword("FLAGS") SP() fs:flag_list() { Untagged::Flags(fs) }
      / keyword("LIST") SP() l:mailbox_list() { Untagged::List(l) }
      / keyword("LSUB") SP() l:mailbox_list() { Untagged::Lsub(l) }
      / e:esearch_data() { Untagged::Esearch(e) }
      / keyword("SEARCH") ns:((SP() n:nz_number() { n })*)
        { Untagged::Search(ns.into_iter().collect()) }
      / keyword("STATUS") SP() m:mailbox() SP() "(" items:(status_att() ** SP()) ")"
        { Untagged::Status(StatusData { mailbox: m, items }) }

    // continue-req = "+" SP (resp-text / base64) CRLF
    rule continue_req() -> Response
      = "+" t:resp_tail() CRLF()
      { Response::Continue(t) }

    // response-tagged = tag SP resp-cond-state CRLF
    rule response_tagged() -> Response
      = t:tag() SP() c:condition() x:resp_tail() CRLF()
      { Response::Tagged(Tagged { tag: lossy(t), condition: c, text: x }) }

    // One whole response line, CRLF included.
    pub rule response() -> Response
      = continue_req()
      / "*" SP() u:untagged_body() CRLF() { Response::Untagged(u) }
      / response_tagged()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  fn untagged(line: &[u8]) -> Untagged {
    match parse(line).unwrap() {
      Response::Untagged(untagged) => untagged,
      other => panic!("{other:?}"),
    }
  }

  fn fetch(line: &[u8]) -> Fetch {
    match untagged(line) {
      Untagged::Fetch(fetch) => fetch,
      other => panic!("{other:?}"),
    }
  }

  fn flags<const N: usize>(flags: [&str; N]) -> BTreeSet<String> {
    flags.iter().map(|f| f.to_string()).collect()
  }

  #[test]
  fn continue_req() {
    assert_eq!(
      Response::Continue(ResponseText {
        code: None,
        text: Some("go ahead".to_string())
      }),
      parse(b"+ go ahead\r\n").unwrap()
    );
    assert_eq!(
      Response::Continue(ResponseText::default()),
      parse(b"+\r\n").unwrap()
    );
  }

  #[test]
  fn tagged() {
    assert_eq!(
      Response::Tagged(Tagged {
        tag: "A001".to_string(),
        condition: Condition::Ok,
        text: ResponseText { code: None, text: Some("LOGIN completed".to_string()) },
      }),
      parse(b"A001 OK LOGIN completed\r\n").unwrap()
    );
    // Bare tagged response without text.
    assert_eq!(
      Response::Tagged(Tagged {
        tag: "A001".to_string(),
        condition: Condition::Ok,
        text: ResponseText::default(),
      }),
      parse(b"A001 OK\r\n").unwrap()
    );
  }

  #[test]
  fn greeting() {
    assert_eq!(
      Untagged::Ok(ResponseText { code: None, text: Some("hi".to_string()) }),
      untagged(b"* OK hi\r\n")
    );
    match untagged(b"* PREAUTH [CAPABILITY IMAP4rev1] ready\r\n") {
      Untagged::PreAuth(text) => {
        assert_eq!(Some(Code::Capability(vec![Capability::Imap4Rev1])), text.code)
      }
      other => panic!("{other:?}"),
    }
  }

  #[test]
  fn capabilities() {
    assert_eq!(
      Untagged::Capability(vec![
        Capability::Imap4Rev1,
        Capability::AuthPlain,
        Capability::Idle,
        Capability::Other("XYZZY".to_string()),
      ]),
      untagged(b"* CAPABILITY IMAP4rev1 AUTH=PLAIN IDLE XYZZY\r\n")
    );
    assert_eq!(
      Untagged::Enabled(vec![Capability::CondStore]),
      untagged(b"* ENABLED CONDSTORE\r\n")
    );
  }

  #[test]
  fn resp_text_codes() {
    match untagged(b"* OK [UIDVALIDITY 1676645821] UIDs valid\r\n") {
      Untagged::Ok(text) => assert_eq!(Some(Code::UidValidity(1676645821)), text.code),
      other => panic!("{other:?}"),
    }
    match untagged(b"* OK [HIGHESTMODSEQ 715194045007]\r\n") {
      // Gmail omits the text after the code.
      Untagged::Ok(text) => {
        assert_eq!(Some(Code::HighestModSeq(715194045007)), text.code);
        assert_eq!(None, text.text);
      }
      other => panic!("{other:?}"),
    }
    match untagged(b"* OK [PERMANENTFLAGS (\\Seen \\*)] limited\r\n") {
      Untagged::Ok(text) => {
        assert_eq!(Some(Code::PermanentFlags(flags(["\\Seen", "\\*"]))), text.code)
      }
      other => panic!("{other:?}"),
    }
    match untagged(b"* NO [UNAVAILABLE backend down] sorry\r\n") {
      Untagged::No(text) => assert_eq!(
        Some(Code::Other("UNAVAILABLE".to_string(), Some("backend down".to_string()))),
        text.code
      ),
      other => panic!("{other:?}"),
    }
  }

  #[test]
  fn mailbox_sizes() {
    assert_eq!(Untagged::Exists(23), untagged(b"* 23 EXISTS\r\n"));
    // An empty mailbox reports zero.
    assert_eq!(Untagged::Exists(0), untagged(b"* 0 EXISTS\r\n"));
    assert_eq!(Untagged::Recent(1), untagged(b"* 1 RECENT\r\n"));
    assert_eq!(Untagged::Expunge(2), untagged(b"* 2 EXPUNGE\r\n"));
  }

  #[test]
  fn list() {
    assert_eq!(
      Untagged::List(List {
        attributes: flags(["\\HasNoChildren"]),
        delimiter: Some(b'/'),
        mailbox: b"lists/rust".to_vec(),
      }),
      untagged(b"* LIST (\\HasNoChildren) \"/\" \"lists/rust\"\r\n")
    );
    // Mailbox names arrive as literals too, and iNbOx is normalized.
    assert_eq!(
      Untagged::List(List {
        attributes: BTreeSet::new(),
        delimiter: None,
        mailbox: b"INBOX".to_vec(),
      }),
      untagged(b"* LIST () NIL {5}\r\niNbOx\r\n")
    );
  }

  #[test]
  fn status() {
    assert_eq!(
      Untagged::Status(StatusData {
        mailbox: b"Drafts".to_vec(),
        items: vec![(StatusAttribute::Messages, 4), (StatusAttribute::Unseen, 2)],
      }),
      untagged(b"* STATUS Drafts (MESSAGES 4 UNSEEN 2)\r\n")
    );
  }

  #[test]
  fn search() {
    assert_eq!(
      Untagged::Search([2, 10, 11].into_iter().collect()),
      untagged(b"* SEARCH 2 10 11\r\n")
    );
    assert_eq!(Untagged::Search(BTreeSet::new()), untagged(b"* SEARCH\r\n"));
  }

  #[test]
  fn esearch() {
    assert_eq!(
      Untagged::Esearch(Esearch {
        tag: Some("A282".to_string()),
        uid: true,
        all: Some(vec![(2, 4), (7, 7), (9, 9)]),
        ..Esearch::default()
      }),
      untagged(b"* ESEARCH (TAG \"A282\") UID ALL 2:4,7,9\r\n")
    );
    assert_eq!(
      Untagged::Esearch(Esearch {
        tag: Some("A283".to_string()),
        min: Some(2),
        count: Some(3),
        ..Esearch::default()
      }),
      untagged(b"* ESEARCH (TAG \"A283\") MIN 2 COUNT 3\r\n")
    );
    assert_eq!(
      Untagged::Esearch(Esearch::default()),
      untagged(b"* ESEARCH\r\n")
    );
  }

  #[test]
  fn fetch_uid_flags_modseq() {
    let fetch = fetch(b"* 1 FETCH (UID 10 FLAGS (\\Seen) MODSEQ (100))\r\n");
    assert_eq!(1, fetch.msg);
    assert_eq!(Some(10), fetch.items.uid);
    assert_eq!(Some(flags(["\\Seen"])), fetch.items.flags);
    assert_eq!(Some(100), fetch.items.modseq);
  }

  #[test]
  fn fetch_gmail_items() {
    let fetch = fetch(
      b"* 3 FETCH (X-GM-THRID 1278455344230334865 X-GM-MSGID 1278455344230334865 \
        X-GM-LABELS (\\Inbox \\Sent \"mountain/hiking\") UID 4)\r\n",
    );
    assert_eq!(Some(1278455344230334865), fetch.items.gm_msgid);
    assert_eq!(Some(1278455344230334865), fetch.items.gm_thrid);
    assert_eq!(
      Some(
        [&b"\\Inbox"[..], &b"\\Sent"[..], &b"mountain/hiking"[..]]
          .into_iter()
          .map(<[u8]>::to_vec)
          .collect()
      ),
      fetch.items.gm_labels
    );
  }

  #[test]
  fn fetch_envelope() {
    let fetch = fetch(
      b"* 12 FETCH (ENVELOPE (\"Wed, 17 Jul 1996 02:23:25 -0700 (PDT)\" \
        \"IMAP4rev1 WG mtg summary and minutes\" \
        ((\"Terry Gray\" NIL \"gray\" \"cac.washington.edu\")) \
        ((\"Terry Gray\" NIL \"gray\" \"cac.washington.edu\")) \
        ((\"Terry Gray\" NIL \"gray\" \"cac.washington.edu\")) \
        ((NIL NIL \"imap\" \"cac.washington.edu\")) \
        ((NIL NIL \"minutes\" \"CNRI.Reston.VA.US\") \
        (\"John Klensin\" NIL \"KLENSIN\" \"MIT.EDU\")) NIL NIL \
        \"<B27397-0100000@cac.washington.edu>\"))\r\n",
    );
    let envelope = fetch.items.envelope.unwrap();
    assert_eq!(
      Some(b"IMAP4rev1 WG mtg summary and minutes".to_vec()),
      envelope.subject
    );
    assert_eq!(
      Some(chrono::DateTime::parse_from_rfc2822("Wed, 17 Jul 1996 02:23:25 -0700").unwrap()),
      envelope.date
    );
    let from = envelope.from.unwrap();
    assert_eq!(1, from.len());
    assert_eq!(Some(b"Terry Gray".to_vec()), from[0].name);
    assert_eq!(Some(b"gray".to_vec()), from[0].mailbox);
    assert_eq!(Some(b"cac.washington.edu".to_vec()), from[0].host);
    assert_eq!(2, envelope.cc.unwrap().len());
    assert_eq!(None, envelope.in_reply_to);
    assert_eq!(
      Some(b"<B27397-0100000@cac.washington.edu>".to_vec()),
      envelope.message_id
    );
  }

  #[test]
  fn envelope_garbage_date() {
    let fetch = fetch(
      b"* 1 FETCH (ENVELOPE (\"not a date\" NIL NIL NIL NIL NIL NIL NIL NIL NIL))\r\n",
    );
    // Real servers emit garbage dates; absence, never an error.
    assert_eq!(None, fetch.items.envelope.unwrap().date);
  }

  #[test]
  fn fetch_internaldate() {
    let fetch = fetch(b"* 5 FETCH (INTERNALDATE \"17-Jul-1996 02:44:25 -0700\")\r\n");
    assert_eq!(
      Some(chrono::DateTime::parse_from_rfc2822("Wed, 17 Jul 1996 02:44:25 -0700").unwrap()),
      fetch.items.internal_date
    );
  }

  #[test]
  fn fetch_body_sections_aggregate() {
    let fetch = fetch(
      b"* 2 FETCH (BODY[HEADER] {14}\r\nSubject: yes\r\n UID 7 BODY[1]<10> \"abc\" BODY[2] NIL)\r\n",
    );
    assert_eq!(Some(7), fetch.items.uid);
    assert_eq!(3, fetch.items.sections.len());
    assert_eq!(
      Some(&Section { origin: None, content: Some(b"Subject: yes\r\n".to_vec()) }),
      fetch.items.sections.get("HEADER")
    );
    assert_eq!(
      Some(&Section { origin: Some(10), content: Some(b"abc".to_vec()) }),
      fetch.items.sections.get("1")
    );
    assert_eq!(
      Some(&Section { origin: None, content: None }),
      fetch.items.sections.get("2")
    );
  }

  #[test]
  fn fetch_unknown_attribute_fails() {
    let error = parse(b"* 1 FETCH (SHOE-SIZE 46)\r\n").unwrap_err();
    match error {
      Error::Parse { cursor, .. } => assert!(cursor > 0),
      other => panic!("{other:?}"),
    }
  }

  #[test]
  fn unknown_untagged_fails() {
    assert!(parse(b"* FROBNICATE 1\r\n").is_err());
  }

  #[test]
  fn bodystructure_text() {
    let fetch = fetch(
      b"* 1 FETCH (BODYSTRUCTURE (\"TEXT\" \"PLAIN\" (\"CHARSET\" \"US-ASCII\") NIL NIL \"7BIT\" 3028 92))\r\n",
    );
    assert_eq!(
      Some(BodyStructure::Text {
        subtype: "plain".to_string(),
        fields: BodyFields {
          params: vec![("charset".to_string(), "US-ASCII".to_string())],
          id: None,
          description: None,
          encoding: "7bit".to_string(),
          size: 3028,
        },
        lines: 92,
        extension: None,
      }),
      fetch.items.bodystructure
    );
  }

  #[test]
  fn bodystructure_multipart_with_extensions() {
    let fetch = fetch(
      b"* 1 FETCH (BODYSTRUCTURE ((\"TEXT\" \"PLAIN\" (\"CHARSET\" \"UTF-8\") NIL NIL \"7BIT\" 4 1 NIL NIL NIL NIL)(\"APPLICATION\" \"PDF\" (\"NAME\" \"x.pdf\") NIL NIL \"BASE64\" 1024 \"md5md5\" (\"ATTACHMENT\" (\"FILENAME\" \"x.pdf\")) NIL NIL \"trailing\") \"MIXED\" (\"BOUNDARY\" \"xyz\") NIL NIL NIL 7))\r\n",
    );
    match fetch.items.bodystructure.unwrap() {
      BodyStructure::Multipart { subtype, parts, extension } => {
        assert_eq!("mixed", subtype);
        assert_eq!(2, parts.len());
        match &parts[1] {
          BodyStructure::Basic { media_type, subtype, extension, .. } => {
            assert_eq!("application", media_type);
            assert_eq!("pdf", subtype);
            let extension = extension.as_ref().unwrap();
            assert_eq!(Some("md5md5".to_string()), extension.md5);
            assert_eq!(
              Some((
                "attachment".to_string(),
                vec![("filename".to_string(), "x.pdf".to_string())]
              )),
              extension.disposition
            );
            // Trailing unknown fields end up in the opaque extension list.
            assert_eq!(
              vec![BodyExtension::String(Some(b"trailing".to_vec()))],
              extension.extension
            );
          }
          other => panic!("{other:?}"),
        }
        let extension = extension.unwrap();
        assert_eq!(
          vec![("boundary".to_string(), "xyz".to_string())],
          extension.params
        );
        assert_eq!(vec![BodyExtension::Number(7)], extension.extension);
      }
      other => panic!("{other:?}"),
    }
  }

  #[test]
  fn bodystructure_message_rfc822() {
    let fetch = fetch(
      b"* 1 FETCH (BODYSTRUCTURE (\"MESSAGE\" \"RFC822\" NIL NIL NIL \"7BIT\" 342 (NIL \"inner\" NIL NIL NIL NIL NIL NIL NIL NIL) (\"TEXT\" \"PLAIN\" NIL NIL NIL \"7BIT\" 5 1) 12))\r\n",
    );
    match fetch.items.bodystructure.unwrap() {
      BodyStructure::Message { envelope, body, lines, .. } => {
        assert_eq!(Some(b"inner".to_vec()), envelope.subject);
        assert_eq!(12, lines);
        match *body {
          BodyStructure::Text { ref subtype, .. } => assert_eq!("plain", subtype),
          other => panic!("{other:?}"),
        }
      }
      other => panic!("{other:?}"),
    }
  }
}
