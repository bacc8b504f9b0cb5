// https://www.rfc-editor.org/rfc/rfc2234#section-2.3
// https://www.rfc-editor.org/rfc/rfc3501#section-9
// https://www.rfc-editor.org/rfc/rfc7162#section-7
//
// Response-side grammar. The connection hands over single lines with the CRLF stripped; units
// that carried trailing literals arrive reassembled with the `{n}` CRLF and raw octets inline,
// which is what the literal rule below consumes. FETCH attribute streams are not parsed as one
// unit: the engine tokenises them attribute by attribute so body literals can be drained to a
// sink instead of memory.

use super::{Cond, FetchAttr, MailboxName, Range, RespCode, State, StatusItem, Untagged};
use std::{borrow, str};

fn parse_u32(n: &[u8]) -> u32 {
  // UTF-8 is guaranteed by the BNF (digits only); absurdly large values saturate.
  str::from_utf8(n).unwrap().parse().unwrap_or(u32::MAX)
}

fn parse_u64(n: &[u8]) -> u64 {
  str::from_utf8(n).unwrap().parse().unwrap_or(u64::MAX)
}

// The naive l:$(CHAR8()*<{n}>) in literal() would push every CHAR8() into a vector before
// discarding it: https://github.com/kevinmehall/rust-peg/pull/292
// Instead, use an undocumented escape hatch to do a fast skip:
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
  pub grammar response() for [u8] {
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
    // In all cases, SP refers to exactly one space.
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
      { parse_u32(n) }
    rule number64() -> u64
      = n:$(DIGIT()+)
      { parse_u64(n) }
    // nz-number = digit-nz *DIGIT
    rule nz_number() -> u32
      = n:$(digit_nz() DIGIT()*)
      { parse_u32(n) }
    // uniqueid = nz-number
    rule uniqueid() -> u32 = nz_number()
    // text = 1*TEXT-CHAR
    // Relaxed to *TEXT-CHAR: servers do send bare "OK".
    rule text() -> &'input [u8] = $(TEXT_CHAR()*)

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
    rule atom() = ATOM_CHAR()+
    // ASTRING-CHAR = ATOM-CHAR / resp-specials
    rule ASTRING_CHAR() = ATOM_CHAR() / resp_specials()
    // quoted = DQUOTE *QUOTED-CHAR DQUOTE
    rule quoted() -> Vec<u8>
      = DQUOTE() q:(QUOTED_CHAR()*) DQUOTE()
      { q }
    // literal = "{" number "}" CRLF *CHAR8
    rule literal() -> &'input [u8]
      = "{" n:number() "}" CRLF() l:$(##skip(n as usize))
      { l }
    // string = quoted / literal
    rule string() -> borrow::Cow<'input, [u8]>
      = q:quoted() { borrow::Cow::Owned(q) } / l:literal() { borrow::Cow::Borrowed(l) }
    // astring = 1*ASTRING-CHAR / string
    rule astring() -> borrow::Cow<'input, [u8]>
      = s:$(ASTRING_CHAR()+) { borrow::Cow::Borrowed(s) } / s:string() { s }
    // nstring = string / nil
    rule nstring() -> Option<borrow::Cow<'input, [u8]>>
      = s:string() { Some(s) } / nil() { None }

    // tag = 1*<any ASTRING-CHAR except "+">
    rule tag() -> &'input [u8] = $((!"+" ASTRING_CHAR())+)

    // auth-type = atom
    rule auth_type() = atom()
    // capability = ("AUTH=" auth-type) / atom
    rule capability() -> &'input [u8] = $(("AUTH=" auth_type()) / atom())
    // capability-data = "CAPABILITY" *(SP capability) SP "IMAP4rev1" *(SP capability)
    // Rewritten for simplicity and to avoid backtracking (capability can match "IMAP4rev1").
    rule capability_data() -> Vec<&'input [u8]>
      = "CAPABILITY" cs:(SP() c:capability() { c })+
      { cs }

    // mailbox = "INBOX" / astring
    rule mailbox() -> MailboxName<'input>
      = ("i" / "I") ("n" / "N") ("b" / "B") ("o" / "O") ("x" / "X") !ASTRING_CHAR() { MailboxName::Inbox }
      / m:astring() { MailboxName::Other(m) }
    // mbx-list-flags, rewritten for simplicity.
    rule mbx_list_flags() -> Vec<&'input [u8]>
      = fs:((f:$("\\" atom()) { f }) ** SP())
      { fs }
    // mailbox-list = "(" [mbx-list-flags] ")" SP (DQUOTE QUOTED-CHAR DQUOTE / nil) SP mailbox
    rule mailbox_list() -> (Vec<&'input [u8]>, Option<u8>, MailboxName<'input>)
      = "(" fs:mbx_list_flags() ")" SP() c:(DQUOTE() c:QUOTED_CHAR() DQUOTE() { Some(c) } / nil() { None }) SP() m:mailbox()
      { (fs, c, m) }

    // flag-keyword = atom
    rule flag_keyword() -> &'input [u8] = $(atom())
    // flag-extension = "\" atom
    rule flag_extension() -> &'input [u8] = $("\\" atom())
    // flag = "\Answered" / "\Flagged" / "\Deleted" / "\Seen" / "\Draft" / flag-keyword / flag-extension
    // This rule is equivalent because flag-extension allows any of the system flags.
    rule flag() -> &'input [u8] = flag_keyword() / flag_extension()
    // flag-perm = flag / "\*"
    rule flag_perm() -> &'input [u8] = f:flag() { f } / $("\\*")
    // flag-fetch = flag / "\Recent"
    // This rule is equivalent (because flag allows any system flag).
    rule flag_fetch() -> &'input [u8] = flag()

    // seq-number = nz-number / "*"
    rule seq_number() -> Range = n:nz_number() { Range(n, n) } / "*" { Range(0, u32::MAX) }
    // seq-range = seq-number ":" seq-number
    // Example: 2:4 and 4:2 are equivalent and indicate values 2, 3, and 4.
    rule seq_range() -> Range
      = r1:seq_number() ":" r2:seq_number()
      {
        if r1.0 <= r2.1 {
          Range(r1.0, r2.1)
        } else {
          Range(r2.0, r1.0)
        }
      }
    // sequence-set = (seq-number / seq-range) *("," sequence-set)
    // Rewritten for simplicity and to avoid backtracking (seq-number can match seq-range).
    rule sequence_set() -> Vec<Range> = (seq_range() / seq_number()) ** ","
    // https://www.rfc-editor.org/rfc/rfc7162#section-7
    // known-uids = sequence-set
    rule known_uids() -> Vec<Range> = sequence_set()

    // https://www.rfc-editor.org/rfc/rfc4315#section-4
    // uid-range = (uniqueid ":" uniqueid)
    rule uid_range() -> Range
      = u1:uniqueid() ":" u2:uniqueid()
      {
        if u1 <= u2 {
          Range(u1, u2)
        } else {
          Range(u2, u1)
        }
      }
    // uid-set = (uniqueid / uid-range) *("," uid-set)
    rule uid_set() -> Vec<Range>
      = (uid_range() / (u:uniqueid() { Range(u, u) })) ** ","

    // resp-text-code, extended by UIDPLUS, CONDSTORE/QRESYNC.
    rule resp_code() -> RespCode<'input>
      = "ALERT" { RespCode::Alert }
      / cs:capability_data() { RespCode::Capability(cs) }
      / "UIDVALIDITY" SP() n:nz_number() { RespCode::UidValidity(n) }
      / "UIDNEXT" SP() n:nz_number() { RespCode::UidNext(n) }
      / "HIGHESTMODSEQ" SP() n:number64() { RespCode::HighestModSeq(n) }
      / "NOMODSEQ" { RespCode::NoModSeq }
      / "TRYCREATE" { RespCode::TryCreate }
      / "CLOSED" { RespCode::Closed }
      / "READ-ONLY" { RespCode::ReadOnly }
      / "READ-WRITE" { RespCode::ReadWrite }
      / "PERMANENTFLAGS" SP() "(" fs:(flag_perm() ** SP()) ")" { RespCode::PermanentFlags(fs) }
      / "APPENDUID" SP() n:nz_number() SP() u:uniqueid() { RespCode::AppendUid { uidvalidity: n, uid: u } }
      / "COPYUID" SP() n:nz_number() SP() f:uid_set() SP() t:uid_set() { RespCode::CopyUid { uidvalidity: n, from: f, to: t } }
      / "MODIFIED" SP() s:sequence_set() { RespCode::Modified(s) }
      / o:$((!"]" CHAR8())+) { RespCode::Other(o) }

    // resp-text = ["[" resp-text-code "]" SP] text
    rule resp_text() -> (Option<RespCode<'input>>, &'input [u8])
      = code:("[" c:resp_code() "]" SP()? { c })? t:text()
      { (code, t) }

    // resp-cond-state = ("OK" / "NO" / "BAD") SP resp-text
    rule state() -> State
      = "OK" { State::Ok } / "NO" { State::No } / "BAD" { State::Bad }
    pub rule cond() -> Cond<'input>
      = s:state() SP()? r:resp_text() ![_]
      { Cond { state: s, code: r.0, text: r.1 } }

    // https://www.rfc-editor.org/rfc/rfc3501#section-2.2.2
    // Data transmitted by the server to the client and status responses that do not indicate
    // command completion are prefixed with the token "*". [...] The server completion result
    // response [...] is tagged with the same tag as the client command which began the operation.
    // A continuation request is prefixed with the token "+".
    #[no_eof]
    pub rule start() -> (usize, &'input [u8])
      = s:($("*") / $("+") / tag()) (SP() / ![_]) p:position!()
      { (p, s) }

    rule status_item() -> Option<StatusItem>
      = "MESSAGES" SP() n:number() { Some(StatusItem::Messages(n)) }
      / "RECENT" SP() n:number() { Some(StatusItem::Recent(n)) }
      / "UIDNEXT" SP() n:number() { Some(StatusItem::UidNext(n)) }
      / "UIDVALIDITY" SP() n:number() { Some(StatusItem::UidValidity(n)) }
      / "UNSEEN" SP() n:number() { Some(StatusItem::Unseen(n)) }
      / "HIGHESTMODSEQ" SP() n:number64() { Some(StatusItem::HighestModSeq(n)) }
      / atom() SP() number64() { None }

    // response-data alternatives this client reacts to. FETCH is deliberately absent: the engine
    // detects it with fetch_start and tokenises the attributes itself.
    pub rule untagged() -> Untagged<'input>
      = n:number() SP() "EXISTS" ![_] { Untagged::Exists(n) }
      / n:number() SP() "RECENT" ![_] { Untagged::Recent(n) }
      / n:nz_number() SP() "EXPUNGE" ![_] { Untagged::Expunge(n) }
      // expunged-resp = "VANISHED" [SP "(EARLIER)"] SP known-uids
      / "VANISHED" e:(SP() "(EARLIER)")? SP() us:known_uids() ![_]
        { Untagged::Vanished { earlier: e.is_some(), uids: us } }
      / "FLAGS" SP() "(" fs:(flag_fetch() ** SP()) ")" ![_] { Untagged::Flags(fs) }
      / cs:capability_data() ![_] { Untagged::Capability(cs) }
      // https://www.rfc-editor.org/rfc/rfc5161
      // enable-data = "ENABLED" *(SP capability)
      / "ENABLED" cs:((SP() c:capability() { c })*) ![_] { Untagged::Enabled(cs) }
      / "LIST" SP() l:mailbox_list() ![_]
        { Untagged::List { flags: l.0, delimiter: l.1, mailbox: l.2 } }
      / "LSUB" SP() l:mailbox_list() ![_]
        { Untagged::Lsub { flags: l.0, delimiter: l.1, mailbox: l.2 } }
      / "STATUS" SP() m:mailbox() SP() "(" items:(status_item() ** SP()) ")" ![_]
        { Untagged::Status { mailbox: m, items: items.into_iter().flatten().collect() } }
      / "BYE" SP()? t:text() ![_] { Untagged::Bye(t) }
      / c:cond() { Untagged::Cond(c) }

    // message-data = nz-number SP "FETCH" SP msg-att
    // Only the opening is recognised here; attributes stream through fetch_attr.
    #[no_eof]
    pub rule fetch_start() -> (usize, u32)
      = n:nz_number() SP() "FETCH" SP() "(" p:position!()
      { (p, n) }

    // section = "[" [section-spec] "]"
    rule section() = "[" (!"]" CHAR8())* "]" ("<" number() ">")?

    // A literal whose octets have not been read yet: only valid at the very end of a line.
    rule literal_marker() -> u32
      = "{" n:number() "}" ![_]
      { n }

    rule balanced() = "(" (balanced() / (!"(" !")" CHAR8()))* ")"
    rule generic_value() = balanced() / (quoted() {}) / nil() / ($((!" " !")" CHAR8())+)) {}

    // msg-att, one attribute at a time.
    rule fetch_attr_inner() -> FetchAttr<'input>
      = "UID" SP() u:uniqueid() { FetchAttr::Uid(u) }
      / "FLAGS" SP() "(" fs:(flag_fetch() ** SP()) ")" { FetchAttr::Flags(fs) }
      / "INTERNALDATE" SP() d:quoted() { FetchAttr::InternalDate(d) }
      / "RFC822.SIZE" SP() n:number64() { FetchAttr::Rfc822Size(n) }
      // fetch-mod-resp = "MODSEQ" SP "(" permsg-modsequence ")"
      / "MODSEQ" SP() "(" m:number64() ")" { FetchAttr::ModSeq(m) }
      / ("BODY" section() / "RFC822.HEADER" / "RFC822.TEXT") SP()
        v:( l:literal_marker() { FetchAttr::BodyLiteral { length: l } }
          / s:nstring() { FetchAttr::BodyInline(s) })
        { v }
      / $(ASTRING_CHAR()+) SP()? generic_value() { FetchAttr::Ignored }

    #[no_eof]
    pub rule fetch_attr() -> (usize, FetchAttr<'input>)
      = a:fetch_attr_inner() SP()? p:position!()
      { (p, a) }

    #[no_eof]
    pub rule fetch_end() -> (usize, ())
      = ")" p:position!()
      { (p, ()) }

    // A line ending in a literal marker; everything before it is opaque here. Used by the unit
    // assembler to decide whether more octets must be pulled before parsing.
    #[no_eof]
    pub rule trailing_literal() -> (usize, u32)
      = (!literal_marker() CHAR8())* l:literal_marker() p:position!()
      { (p, l) }
  }
}
