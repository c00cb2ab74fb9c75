//-
// Copyright (c) 2026, Jason Lingle
//
// This file is part of Postern.
//
// Postern is free software: you can  redistribute it and/or modify it under
// the terms of  the GNU General Public  License as published  by the Free
// Software Foundation, either version  3 of the License, or  (at your option)
// any later version.
//
// Postern is distributed  in the hope that  it will be useful,  but WITHOUT
// ANY WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or
// FITNESS FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License
// for more details.
//
// You should have received a copy of the GNU General Public License along
// with Postern. If not, see <http://www.gnu.org/licenses/>.

//! The command grammar, hand-written over the token stream.
//!
//! Each `make_*` method is the production for one command verb (the verb
//! itself having already been consumed by the dispatcher) and produces
//! either a [`Command`] or the [`SmtpResponse`] describing the syntax
//! failure. The `try_*` productions recognise grammar fragments; they are
//! greedy within their rule and leave the tokenizer exactly where it was on
//! a mismatch, so alternatives can be tried in most-specific-first order.

use std::borrow::Cow;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use super::codes::*;
use super::command::{Command, EhloHost, ProxyHeader};
use super::response::SmtpResponse;
use super::tokenizer::{Token, TokenKind, Tokenizer};
use super::transaction::{is_atext, Host, Mailbox, Parameters, ReversePath};

pub type ParseResult = Result<Command, SmtpResponse<'static>>;

/// A grammar production for one command verb, as stored in the state table.
pub type Production = fn(&mut Parser<'_>) -> ParseResult;

pub struct Parser<'a> {
    tok: Tokenizer<'a>,
}

fn argument_error(text: &'static str) -> SmtpResponse<'static> {
    SmtpResponse(pc::ParameterSyntaxError, Cow::Borrowed(text))
}

impl<'a> Parser<'a> {
    /// Creates a parser over `tok`, which should be positioned just after
    /// the command verb.
    pub fn new(tok: Tokenizer<'a>) -> Self {
        Self { tok }
    }

    /// The unconsumed remainder of the line, for diagnostics.
    pub fn remaining_line(&self) -> &'a str {
        self.tok.remaining()
    }

    // ---- Command productions ----------------------------------------

    pub fn make_helo(&mut self) -> ParseResult {
        if self.require_space().is_none() {
            return Err(argument_error("HELO requires a domain"));
        }

        let Some(host) = self.try_domain() else {
            return Err(argument_error("Malformed domain in HELO"));
        };
        self.end_of_line("HELO")?;

        Ok(Command::Helo { host })
    }

    pub fn make_ehlo(&mut self) -> ParseResult {
        if self.require_space().is_none() {
            return Err(argument_error("EHLO requires a domain"));
        }

        let host = if let Some(addr) = self.try_address_literal() {
            EhloHost::Address(addr)
        } else if let Some(domain) = self.try_domain() {
            EhloHost::Domain(domain)
        } else {
            return Err(argument_error(
                "Malformed domain or address literal in EHLO",
            ));
        };
        self.end_of_line("EHLO")?;

        Ok(Command::Ehlo { host })
    }

    pub fn make_mail(&mut self) -> ParseResult {
        self.skip_spaces();
        if !self.take_word("FROM") || !self.take_char(':') {
            return Err(argument_error("Expected MAIL FROM:"));
        }

        // RFC 5321 permits no whitespace after the colon, but enough
        // clients send it that rejecting it is not a serious option.
        self.skip_spaces();

        let Some(from) = self.try_reverse_path() else {
            return Err(argument_error("Malformed reverse-path"));
        };
        let Some(parameters) = self.try_mail_parameters() else {
            return Err(argument_error("Malformed MAIL FROM parameters"));
        };
        self.end_of_line("MAIL")?;

        Ok(Command::Mail { from, parameters })
    }

    pub fn make_rcpt(&mut self) -> ParseResult {
        self.skip_spaces();
        if !self.take_word("TO") || !self.take_char(':') {
            return Err(argument_error("Expected RCPT TO:"));
        }

        self.skip_spaces();

        let Some(to) = self.try_path() else {
            return Err(argument_error("Malformed forward-path"));
        };
        // ESMTP parameters on RCPT are accepted but ignored.
        if self.try_mail_parameters().is_none() {
            return Err(argument_error("Malformed RCPT TO parameters"));
        }
        self.end_of_line("RCPT")?;

        Ok(Command::Rcpt { to })
    }

    pub fn make_auth(&mut self) -> ParseResult {
        if self.require_space().is_none() {
            return Err(argument_error("AUTH requires a mechanism"));
        }

        let Some(mechanism) = self.try_mechanism() else {
            return Err(argument_error("Malformed AUTH mechanism"));
        };

        let initial_response = if self.require_space().is_some() {
            // "=" is how a client passes a zero-length initial response.
            if self.take_char('=') {
                Some("=".to_owned())
            } else if let Some(b64) = self.try_base64() {
                Some(b64)
            } else {
                return Err(argument_error(
                    "AUTH initial response must be base64",
                ));
            }
        } else {
            None
        };
        self.end_of_line("AUTH")?;

        Ok(Command::Auth {
            mechanism,
            initial_response,
        })
    }

    pub fn make_data(&mut self) -> ParseResult {
        self.bare_verb(Command::Data)
    }

    pub fn make_rset(&mut self) -> ParseResult {
        self.bare_verb(Command::Rset)
    }

    pub fn make_noop(&mut self) -> ParseResult {
        self.bare_verb(Command::Noop)
    }

    pub fn make_quit(&mut self) -> ParseResult {
        self.bare_verb(Command::Quit)
    }

    pub fn make_starttls(&mut self) -> ParseResult {
        self.bare_verb(Command::StartTls)
    }

    pub fn make_dbug(&mut self) -> ParseResult {
        self.bare_verb(Command::Dbug)
    }

    /// Parses the arguments of a PROXY protocol v1 header.
    ///
    /// This is never dispatched through the state table; the session invokes
    /// it directly on the first line of a connection when the endpoint
    /// expects a proxy in front of it.
    pub fn make_proxy(&mut self) -> ParseResult {
        if self.require_space().is_none() {
            return Err(SmtpResponse::syntax_error());
        }

        if self.take_word("UNKNOWN") {
            // The proxy cannot describe the connection; everything up to the
            // line ending is ignored per the haproxy spec.
            return Ok(Command::Proxy(ProxyHeader {
                source: None,
                destination: None,
            }));
        }

        if !self.take_word("TCP") {
            return Err(SmtpResponse::syntax_error());
        }
        let v6 = match self.tok.take() {
            Token {
                kind: TokenKind::Number,
                text: "4",
            } => false,
            Token {
                kind: TokenKind::Number,
                text: "6",
            } => true,
            _ => return Err(SmtpResponse::syntax_error()),
        };

        let source_ip = self.proxy_address(v6)?;
        let destination_ip = self.proxy_address(v6)?;
        let source_port = self.proxy_port()?;
        let destination_port = self.proxy_port()?;
        self.skip_spaces();
        if !self.tok.peek().is_none() {
            return Err(SmtpResponse::syntax_error());
        }

        Ok(Command::Proxy(ProxyHeader {
            source: Some(SocketAddr::new(source_ip, source_port)),
            destination: Some(SocketAddr::new(destination_ip, destination_port)),
        }))
    }

    fn proxy_address(
        &mut self,
        v6: bool,
    ) -> Result<IpAddr, SmtpResponse<'static>> {
        if self.require_space().is_none() {
            return Err(SmtpResponse::syntax_error());
        }

        let mut text = String::new();
        loop {
            let token = self.tok.peek();
            if token.is_none() || TokenKind::Space == token.kind {
                break;
            }
            text.push_str(self.tok.take().text);
        }

        let parsed = if v6 {
            text.parse::<Ipv6Addr>().ok().map(IpAddr::V6)
        } else {
            text.parse::<Ipv4Addr>().ok().map(IpAddr::V4)
        };
        parsed.ok_or_else(SmtpResponse::syntax_error)
    }

    fn proxy_port(&mut self) -> Result<u16, SmtpResponse<'static>> {
        if self.require_space().is_none() {
            return Err(SmtpResponse::syntax_error());
        }

        let token = self.tok.take();
        if TokenKind::Number != token.kind {
            return Err(SmtpResponse::syntax_error());
        }
        token
            .text
            .parse::<u16>()
            .map_err(|_| SmtpResponse::syntax_error())
    }

    fn bare_verb(&mut self, command: Command) -> ParseResult {
        self.skip_spaces();
        if self.tok.peek().is_none() {
            Ok(command)
        } else {
            Err(SmtpResponse::syntax_error())
        }
    }

    fn end_of_line(
        &mut self,
        verb: &'static str,
    ) -> Result<(), SmtpResponse<'static>> {
        self.skip_spaces();
        if self.tok.peek().is_none() {
            Ok(())
        } else {
            Err(SmtpResponse(
                pc::ParameterSyntaxError,
                Cow::Owned(format!("Unexpected trailing text after {}", verb)),
            ))
        }
    }

    // ---- Grammar fragments ------------------------------------------

    /// Runs `f`, rewinding the tokenizer to its pre-call position if `f`
    /// comes back empty. This is what makes alternatives composable: a
    /// failed production can never leave half-consumed tokens behind.
    fn attempt<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Option<T>,
    ) -> Option<T> {
        let checkpoint = self.tok.checkpoint();
        let ret = f(self);
        if ret.is_none() {
            self.tok.restore(checkpoint);
        }
        ret
    }

    fn skip_spaces(&mut self) {
        while TokenKind::Space == self.tok.peek().kind {
            self.tok.take();
        }
    }

    /// Consumes one or more spaces.
    fn require_space(&mut self) -> Option<()> {
        if TokenKind::Space != self.tok.peek().kind {
            return None;
        }
        self.skip_spaces();
        Some(())
    }

    /// Consumes a `Text` token matching `word` case-insensitively.
    fn take_word(&mut self, word: &str) -> bool {
        self.attempt(|p| {
            let token = p.tok.take();
            (TokenKind::Text == token.kind
                && token.text.eq_ignore_ascii_case(word))
            .then_some(())
        })
        .is_some()
    }

    fn take_char(&mut self, c: char) -> bool {
        self.attempt(|p| p.tok.take().is_char(c).then_some(())).is_some()
    }

    /// `Domain`: dot-separated subdomains, each starting with a letter or
    /// digit, continuing with letters, digits, and hyphens, and not ending
    /// with a hyphen.
    pub(super) fn try_domain(&mut self) -> Option<String> {
        self.attempt(|p| {
            let mut domain = p.try_subdomain()?;
            loop {
                let more = p.attempt(|p| {
                    if !p.tok.take().is_char('.') {
                        return None;
                    }
                    p.try_subdomain()
                });
                match more {
                    Some(subdomain) => {
                        domain.push('.');
                        domain.push_str(&subdomain);
                    },
                    None => break,
                }
            }
            Some(domain)
        })
    }

    fn try_subdomain(&mut self) -> Option<String> {
        self.attempt(|p| {
            let mut subdomain = String::new();
            loop {
                let token = p.tok.peek();
                let ok = match token.kind {
                    TokenKind::Text | TokenKind::Number => true,
                    TokenKind::Other => {
                        // A hyphen may not begin a subdomain.
                        token.is_char('-') && !subdomain.is_empty()
                    },
                    _ => false,
                };
                if !ok {
                    break;
                }
                subdomain.push_str(p.tok.take().text);
            }

            if subdomain.is_empty() || subdomain.ends_with('-') {
                None
            } else {
                Some(subdomain)
            }
        })
    }

    /// `address-literal`: a bracketed IPv4 address. IPv6 and general
    /// literals are not supported and fail to parse.
    pub(super) fn try_address_literal(&mut self) -> Option<Ipv4Addr> {
        self.attempt(|p| {
            if !p.tok.take().is_char('[') {
                return None;
            }

            let a = p.try_snum()?;
            let mut octets = [a, 0, 0, 0];
            for octet in octets.iter_mut().skip(1) {
                if !p.tok.take().is_char('.') {
                    return None;
                }
                *octet = p.try_snum()?;
            }

            if !p.tok.take().is_char(']') {
                return None;
            }

            Some(Ipv4Addr::new(
                octets[0], octets[1], octets[2], octets[3],
            ))
        })
    }

    /// `Snum`: one to three digits with a value of at most 255.
    fn try_snum(&mut self) -> Option<u8> {
        self.attempt(|p| {
            let token = p.tok.take();
            if TokenKind::Number != token.kind || token.text.len() > 3 {
                return None;
            }
            let value = token.text.parse::<u16>().ok()?;
            u8::try_from(value).ok()
        })
    }

    /// `Reverse-path`: a path, or `<>` for the null sender.
    pub(super) fn try_reverse_path(&mut self) -> Option<ReversePath> {
        let null = self.attempt(|p| {
            (p.tok.take().is_char('<') && p.tok.take().is_char('>'))
                .then_some(ReversePath::Null)
        });
        if null.is_some() {
            return null;
        }

        self.try_path().map(ReversePath::Mailbox)
    }

    /// `Path`: `"<" [ A-d-l ":" ] Mailbox ">"`.
    ///
    /// The at-domain-list is obsolete source routing; RFC 5321 Appendix C
    /// says to accept and discard it.
    pub(super) fn try_path(&mut self) -> Option<Mailbox> {
        self.attempt(|p| {
            if !p.tok.take().is_char('<') {
                return None;
            }

            let _ = p.attempt(|p| {
                p.try_at_domain_list()?;
                p.tok.take().is_char(':').then_some(())
            });

            let mailbox = p.try_mailbox()?;
            if !p.tok.take().is_char('>') {
                return None;
            }

            Some(mailbox)
        })
    }

    fn try_at_domain_list(&mut self) -> Option<()> {
        self.attempt(|p| {
            p.try_at_domain()?;
            loop {
                let more = p.attempt(|p| {
                    if !p.tok.take().is_char(',') {
                        return None;
                    }
                    p.try_at_domain()
                });
                if more.is_none() {
                    break;
                }
            }
            Some(())
        })
    }

    fn try_at_domain(&mut self) -> Option<()> {
        self.attempt(|p| {
            if !p.tok.take().is_char('@') {
                return None;
            }
            p.try_domain().map(|_| ())
        })
    }

    /// `Mailbox`: `Local-part "@" ( Domain / address-literal )`.
    pub(super) fn try_mailbox(&mut self) -> Option<Mailbox> {
        self.attempt(|p| {
            let local = p.try_local_part()?;
            if !p.tok.take().is_char('@') {
                return None;
            }

            let domain = if let Some(addr) = p.try_address_literal() {
                Host::Address(addr)
            } else {
                Host::Name(p.try_domain()?)
            };

            Some(Mailbox { local, domain })
        })
    }

    fn try_local_part(&mut self) -> Option<String> {
        self.try_quoted_string().or_else(|| self.try_dot_string())
    }

    /// `Dot-string`: atoms joined by single dots.
    fn try_dot_string(&mut self) -> Option<String> {
        self.attempt(|p| {
            let mut string = p.try_atom()?;
            loop {
                let more = p.attempt(|p| {
                    if !p.tok.take().is_char('.') {
                        return None;
                    }
                    p.try_atom()
                });
                match more {
                    Some(atom) => {
                        string.push('.');
                        string.push_str(&atom);
                    },
                    None => break,
                }
            }
            Some(string)
        })
    }

    fn try_atom(&mut self) -> Option<String> {
        self.attempt(|p| {
            let mut atom = String::new();
            loop {
                let token = p.tok.peek();
                let ok = match token.kind {
                    TokenKind::Text | TokenKind::Number => true,
                    TokenKind::Other => token.text.chars().all(is_atext),
                    _ => false,
                };
                if !ok {
                    break;
                }
                atom.push_str(p.tok.take().text);
            }

            (!atom.is_empty()).then_some(atom)
        })
    }

    /// `Quoted-string`: `DQUOTE *QcontentSMTP DQUOTE`, with `\x`
    /// quoted-pairs. The returned string has the quoting removed.
    fn try_quoted_string(&mut self) -> Option<String> {
        self.attempt(|p| {
            if !p.tok.take().is_char('"') {
                return None;
            }

            let mut string = String::new();
            loop {
                let token = p.tok.take();
                if token.is_none() {
                    // Unterminated
                    return None;
                }
                if token.is_char('"') {
                    return Some(string);
                }

                if token.is_char('\\') {
                    // Quoted-pair: the next character is taken literally.
                    // The remainder of a multi-character run after it is
                    // ordinary qtext.
                    let escaped = p.tok.take();
                    if escaped.is_none() || !escaped.text.is_ascii() {
                        return None;
                    }
                    string.push_str(escaped.text);
                    continue;
                }

                // qtextSMTP excludes controls; HTAB in particular is not
                // permitted inside a quoted string.
                if "\t" == token.text || !token.text.is_ascii() {
                    return None;
                }
                string.push_str(token.text);
            }
        })
    }

    /// Zero or more `SP esmtp-param` groups. Returns `None` only when a
    /// parameter is present but malformed.
    fn try_mail_parameters(&mut self) -> Option<Parameters> {
        let mut parameters = Parameters::new();
        loop {
            let checkpoint = self.tok.checkpoint();
            if self.require_space().is_none() || self.tok.peek().is_none() {
                // Trailing whitespace belongs to end-of-line handling.
                self.tok.restore(checkpoint);
                return Some(parameters);
            }

            let (keyword, value) = self.try_esmtp_parameter()?;
            parameters.insert(&keyword, value);
        }
    }

    fn try_esmtp_parameter(&mut self) -> Option<(String, String)> {
        self.attempt(|p| {
            let keyword = p.try_esmtp_keyword()?;
            if !p.take_char('=') {
                // Valueless keyword
                return Some((keyword, String::new()));
            }
            let value = p.try_esmtp_value()?;
            Some((keyword, value))
        })
    }

    fn try_esmtp_keyword(&mut self) -> Option<String> {
        self.attempt(|p| {
            let first = p.tok.peek();
            if !matches!(first.kind, TokenKind::Text | TokenKind::Number) {
                return None;
            }

            let mut keyword = String::new();
            loop {
                let token = p.tok.peek();
                let ok = match token.kind {
                    TokenKind::Text | TokenKind::Number => true,
                    TokenKind::Other => token.is_char('-'),
                    _ => false,
                };
                if !ok {
                    break;
                }
                keyword.push_str(p.tok.take().text);
            }
            Some(keyword)
        })
    }

    /// `esmtp-value`: printable US-ASCII except SP and `=`.
    fn try_esmtp_value(&mut self) -> Option<String> {
        self.attempt(|p| {
            let mut value = String::new();
            loop {
                let token = p.tok.peek();
                if token.is_none() || TokenKind::Space == token.kind {
                    break;
                }
                if !token
                    .text
                    .chars()
                    .all(|c| matches!(c, '!'..='<' | '>'..='~'))
                {
                    return None;
                }
                value.push_str(p.tok.take().text);
            }

            (!value.is_empty()).then_some(value)
        })
    }

    fn try_mechanism(&mut self) -> Option<String> {
        self.attempt(|p| {
            let first = p.tok.peek();
            if TokenKind::Text != first.kind {
                return None;
            }

            let mut mechanism = String::new();
            loop {
                let token = p.tok.peek();
                let ok = match token.kind {
                    TokenKind::Text | TokenKind::Number => true,
                    TokenKind::Other => {
                        token.is_char('-') || token.is_char('_')
                    },
                    _ => false,
                };
                if !ok {
                    break;
                }
                mechanism.push_str(p.tok.take().text);
            }
            Some(mechanism)
        })
    }

    /// A base64 string: the usual alphabet, `=` padding only at the end,
    /// and a length divisible by four.
    pub(super) fn try_base64(&mut self) -> Option<String> {
        self.attempt(|p| {
            let mut b64 = String::new();
            loop {
                let token = p.tok.peek();
                let ok = match token.kind {
                    TokenKind::Text | TokenKind::Number => true,
                    TokenKind::Other => {
                        token.is_char('+')
                            || token.is_char('/')
                            || token.is_char('=')
                    },
                    _ => false,
                };
                if !ok {
                    break;
                }
                b64.push_str(p.tok.take().text);
            }

            let padding_start = b64.trim_end_matches('=').len();
            if b64.is_empty()
                || 0 != b64.len() % 4
                || b64.len() - padding_start > 2
                || b64[..padding_start].contains('=')
            {
                None
            } else {
                Some(b64)
            }
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse(line: &str) -> ParseResult {
        let mut tok = Tokenizer::new(line);
        let verb = tok.take().text.to_ascii_uppercase();
        let mut parser = Parser::new(tok);
        match verb.as_str() {
            "HELO" => parser.make_helo(),
            "EHLO" => parser.make_ehlo(),
            "MAIL" => parser.make_mail(),
            "RCPT" => parser.make_rcpt(),
            "AUTH" => parser.make_auth(),
            "DATA" => parser.make_data(),
            "RSET" => parser.make_rset(),
            "NOOP" => parser.make_noop(),
            "QUIT" => parser.make_quit(),
            "STARTTLS" => parser.make_starttls(),
            "DBUG" => parser.make_dbug(),
            "PROXY" => parser.make_proxy(),
            verb => panic!("unhandled verb {verb}"),
        }
    }

    fn mailbox(local: &str, domain: &str) -> Mailbox {
        Mailbox {
            local: local.to_owned(),
            domain: Host::Name(domain.to_owned()),
        }
    }

    fn mail(line: &str) -> ReversePath {
        match parse(line) {
            Ok(Command::Mail { from, .. }) => from,
            r => panic!("{line:?} did not parse as MAIL: {r:?}"),
        }
    }

    fn rcpt(line: &str) -> Mailbox {
        match parse(line) {
            Ok(Command::Rcpt { to }) => to,
            r => panic!("{line:?} did not parse as RCPT: {r:?}"),
        }
    }

    #[test]
    fn bare_verbs() {
        assert_eq!(Ok(Command::Data), parse("DATA"));
        assert_eq!(Ok(Command::Data), parse("data"));
        assert_eq!(Ok(Command::Rset), parse("RSET "));
        assert_eq!(Ok(Command::Noop), parse("NOOP"));
        assert_eq!(Ok(Command::Quit), parse("QUIT"));
        assert_eq!(Ok(Command::StartTls), parse("STARTTLS"));
        assert_eq!(Ok(Command::Dbug), parse("DBUG"));

        assert!(parse("DATA DATA").is_err());
        assert!(parse("QUIT NOW").is_err());
        assert!(parse("STARTTLS 1.3").is_err());
        assert!(parse("RSET FOO").is_err());
    }

    #[test]
    fn helo_ehlo() {
        assert_eq!(
            Ok(Command::Helo {
                host: "foo.example.com".to_owned(),
            }),
            parse("HELO foo.example.com"),
        );
        assert!(parse("HELO").is_err());
        assert!(parse("HELO foo bar").is_err());
        assert!(parse("HELO [192.0.2.1]").is_err());

        assert_eq!(
            Ok(Command::Ehlo {
                host: EhloHost::Domain("foo.example.com".to_owned()),
            }),
            parse("EHLO foo.example.com"),
        );
        assert_eq!(
            Ok(Command::Ehlo {
                host: EhloHost::Address("192.0.2.1".parse().unwrap()),
            }),
            parse("EHLO [192.0.2.1]"),
        );
        assert!(parse("EHLO [192.0.2.256]").is_err());
    }

    #[test]
    fn mail_paths() {
        assert_eq!(
            ReversePath::Mailbox(mailbox("foo", "bar.com")),
            mail("MAIL FROM:<foo@bar.com>"),
        );
        assert_eq!(ReversePath::Null, mail("MAIL FROM:<>"));
        // Whitespace after the colon is tolerated though non-RFC.
        assert_eq!(
            ReversePath::Mailbox(mailbox("foo", "bar.com")),
            mail("MAIL FROM: <foo@bar.com>"),
        );
        assert_eq!(
            ReversePath::Mailbox(mailbox("foo", "bar.com")),
            mail("mail from:<foo@bar.com>"),
        );

        assert!(parse("MAIL FROM:<foo@bar.com").is_err());
        assert!(parse("MAIL FROM:foo@bar.com").is_err());
        assert!(parse("MAIL <foo@bar.com>").is_err());
        assert!(parse("MAIL FROM:<@>").is_err());
    }

    #[test]
    fn mail_parameters() {
        match parse("MAIL FROM:<foo@bar.com> SIZE=42 BODY=8BITMIME") {
            Ok(Command::Mail { parameters, .. }) => {
                assert_eq!(Some("42"), parameters.get("size"));
                assert_eq!(Some("8BITMIME"), parameters.get("body"));
            },
            r => panic!("unexpected parse: {r:?}"),
        }

        // Valueless keywords are legal
        match parse("MAIL FROM:<foo@bar.com> FOO") {
            Ok(Command::Mail { parameters, .. }) => {
                assert_eq!(Some(""), parameters.get("foo"));
            },
            r => panic!("unexpected parse: {r:?}"),
        }

        // '=' (%d61) is excluded from esmtp-value
        assert!(parse("MAIL FROM:<foo@bar.com> FOO=a=b").is_err());
        // So is SP-adjacent emptiness
        assert!(parse("MAIL FROM:<foo@bar.com> FOO=").is_err());
    }

    #[test]
    fn rcpt_paths() {
        assert_eq!(mailbox("userc", "d.bar.org"), rcpt("RCPT TO:<userc@d.bar.org>"));
        // Source routes are parsed and discarded
        assert_eq!(
            mailbox("userc", "d.bar.org"),
            rcpt("RCPT TO:<@hosta.int,@jkl.org:userc@d.bar.org>"),
        );
        // Parameters are accepted but ignored
        assert_eq!(
            mailbox("userc", "d.bar.org"),
            rcpt("RCPT TO:<userc@d.bar.org> NOTIFY=NEVER"),
        );

        assert!(parse("RCPT TO:<hosta.int:userc@d.bar.org>").is_err());
        assert!(parse("RCPT TO:<>").is_err());
    }

    #[test]
    fn quoted_local_parts() {
        assert_eq!(
            mailbox("john smith", "example.com"),
            rcpt("RCPT TO:<\"john smith\"@example.com>"),
        );
        assert_eq!(
            mailbox("john\"smith", "example.com"),
            rcpt("RCPT TO:<\"john\\\"smith\"@example.com>"),
        );
        assert_eq!(
            mailbox("a@b", "example.com"),
            rcpt("RCPT TO:<\"a@b\"@example.com>"),
        );
        assert!(parse("RCPT TO:<\"unterminated@example.com>").is_err());
    }

    #[test]
    fn address_literal_recipients() {
        assert_eq!(
            Mailbox {
                local: "postmaster".to_owned(),
                domain: Host::Address("192.0.2.1".parse().unwrap()),
            },
            rcpt("RCPT TO:<postmaster@[192.0.2.1]>"),
        );

        // Octet out of range
        assert!(parse("RCPT TO:<a@[192.0.2.256]>").is_err());
        assert!(parse("RCPT TO:<a@[1921.0.2.1]>").is_err());
        assert!(parse("RCPT TO:<a@[192.0.2]>").is_err());
        // IPv6 literals are not supported
        assert!(parse("RCPT TO:<a@[IPv6:::1]>").is_err());
    }

    #[test]
    fn domain_shapes() {
        assert_eq!(
            mailbox("a", "b-c.example"),
            rcpt("RCPT TO:<a@b-c.example>"),
        );
        assert_eq!(mailbox("a", "0example.com"), rcpt("RCPT TO:<a@0example.com>"));

        // A subdomain may not end with a hyphen or start with one
        assert!(parse("RCPT TO:<a@bad-.example>").is_err());
        assert!(parse("RCPT TO:<a@-bad.example>").is_err());
        assert!(parse("RCPT TO:<a@bad..example>").is_err());
        assert!(parse("RCPT TO:<a@>").is_err());
    }

    #[test]
    fn auth_arguments() {
        assert_eq!(
            Ok(Command::Auth {
                mechanism: "PLAIN".to_owned(),
                initial_response: Some("AGF6dXJlAGh1bnRlcjI=".to_owned()),
            }),
            parse("AUTH PLAIN AGF6dXJlAGh1bnRlcjI="),
        );
        assert_eq!(
            Ok(Command::Auth {
                mechanism: "LOGIN".to_owned(),
                initial_response: None,
            }),
            parse("AUTH LOGIN"),
        );
        assert_eq!(
            Ok(Command::Auth {
                mechanism: "PLAIN".to_owned(),
                initial_response: Some("=".to_owned()),
            }),
            parse("AUTH PLAIN ="),
        );

        // Length not divisible by four
        assert!(parse("AUTH PLAIN YWJj1").is_err());
        // Padding in the middle
        assert!(parse("AUTH PLAIN YW=j").is_err());
        assert!(parse("AUTH").is_err());
    }

    #[test]
    fn proxy_headers() {
        assert_eq!(
            Ok(Command::Proxy(ProxyHeader {
                source: Some("192.0.2.7:45678".parse().unwrap()),
                destination: Some("192.0.2.1:25".parse().unwrap()),
            })),
            parse("PROXY TCP4 192.0.2.7 192.0.2.1 45678 25"),
        );
        assert_eq!(
            Ok(Command::Proxy(ProxyHeader {
                source: Some("[2001:db8::7]:45678".parse().unwrap()),
                destination: Some("[2001:db8::1]:25".parse().unwrap()),
            })),
            parse("PROXY TCP6 2001:db8::7 2001:db8::1 45678 25"),
        );
        assert_eq!(
            Ok(Command::Proxy(ProxyHeader {
                source: None,
                destination: None,
            })),
            parse("PROXY UNKNOWN"),
        );

        assert!(parse("PROXY TCP4 192.0.2.7 192.0.2.1 45678").is_err());
        assert!(parse("PROXY TCP5 192.0.2.7 192.0.2.1 1 2").is_err());
        assert!(parse("PROXY TCP4 2001:db8::7 2001:db8::1 1 2").is_err());
        assert!(parse("PROXY TCP4 192.0.2.7 192.0.2.1 1 99999").is_err());
    }

    #[test]
    fn failed_productions_leave_position_unchanged() {
        let mut tok = Tokenizer::new("not-a-path and more");
        let _ = tok.take();
        let mut parser = Parser::new(tok);

        let before = parser.remaining_line();
        assert_eq!(None, parser.try_path());
        assert_eq!(before, parser.remaining_line());
        assert_eq!(None, parser.try_address_literal());
        assert_eq!(before, parser.remaining_line());
        assert_eq!(None, parser.try_reverse_path());
        assert_eq!(before, parser.remaining_line());
    }

    #[test]
    fn printed_mailboxes_reparse() {
        for input in &[
            "RCPT TO:<foo@bar.com>",
            "RCPT TO:<\"john smith\"@example.com>",
            "RCPT TO:<\"a\\\\b\"@example.com>",
            "RCPT TO:<a+b=c@[192.0.2.1]>",
        ] {
            let parsed = rcpt(input);
            let printed = format!("RCPT TO:<{}>", parsed);
            assert_eq!(
                parsed,
                rcpt(&printed),
                "printer/parser fixpoint failed for {input:?}",
            );
        }
    }
}
