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

use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;

/// The host part of a mailbox: either a domain name or a bracketed IPv4
/// address literal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Host {
    Name(String),
    Address(Ipv4Addr),
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Host::Name(ref name) => write!(f, "{}", name),
            Host::Address(addr) => write!(f, "[{}]", addr),
        }
    }
}

/// A parsed `local-part@domain` pair.
///
/// The local part is stored with quoting and escapes removed; `Display`
/// re-quotes it if it is not a valid dot-string, so formatting a parsed
/// mailbox always produces a string that parses back to the same value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mailbox {
    pub local: String,
    pub domain: Host,
}

/// Characters allowed in an atom (RFC 5321 `atext`).
pub fn is_atext(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(
            c,
            '!' | '#'
                | '$'
                | '%'
                | '&'
                | '\''
                | '*'
                | '+'
                | '-'
                | '/'
                | '='
                | '?'
                | '^'
                | '_'
                | '`'
                | '{'
                | '|'
                | '}'
                | '~'
        )
}

fn is_dot_string(s: &str) -> bool {
    !s.is_empty()
        && !s.starts_with('.')
        && !s.ends_with('.')
        && !s.contains("..")
        && s.chars().all(|c| '.' == c || is_atext(c))
}

impl fmt::Display for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if is_dot_string(&self.local) {
            write!(f, "{}@{}", self.local, self.domain)
        } else {
            write!(f, "\"")?;
            for c in self.local.chars() {
                if '"' == c || '\\' == c {
                    write!(f, "\\")?;
                }
                write!(f, "{}", c)?;
            }
            write!(f, "\"@{}", self.domain)
        }
    }
}

/// The sender given in `MAIL FROM`.
///
/// The null reverse-path `<>` is how notifications and bounces declare that
/// no further bounces may be generated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReversePath {
    Null,
    Mailbox(Mailbox),
}

impl ReversePath {
    pub fn mailbox(&self) -> Option<&Mailbox> {
        match *self {
            ReversePath::Null => None,
            ReversePath::Mailbox(ref mailbox) => Some(mailbox),
        }
    }
}

impl fmt::Display for ReversePath {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ReversePath::Null => write!(f, "<>"),
            ReversePath::Mailbox(ref mailbox) => write!(f, "<{}>", mailbox),
        }
    }
}

/// The ESMTP parameters from `MAIL FROM`, keyed case-insensitively.
///
/// Keys are folded to upper case on insertion; values are kept verbatim.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Parameters(HashMap<String, String>);

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, keyword: &str, value: String) {
        self.0.insert(keyword.to_ascii_uppercase(), value);
    }

    pub fn get(&self, keyword: &str) -> Option<&str> {
        self.0
            .get(&keyword.to_ascii_uppercase())
            .map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// One mail transaction, from `MAIL FROM` up to the end of `DATA`.
///
/// The reverse path is `None` until a `MAIL` command has been accepted;
/// `Some(ReversePath::Null)` records an accepted null reverse-path.
#[derive(Clone, Debug, Default)]
pub struct Transaction {
    pub reverse_path: Option<ReversePath>,
    pub recipients: Vec<Mailbox>,
    pub parameters: Parameters,
    pub data: Vec<u8>,
}

impl Transaction {
    pub fn reset(&mut self) {
        *self = Transaction::default();
    }

    /// The sender mailbox, if the transaction has one (i.e. `MAIL` has been
    /// accepted and its reverse-path was not `<>`).
    pub fn from(&self) -> Option<&Mailbox> {
        self.reverse_path.as_ref().and_then(ReversePath::mailbox)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn mailbox(local: &str, domain: &str) -> Mailbox {
        Mailbox {
            local: local.to_owned(),
            domain: Host::Name(domain.to_owned()),
        }
    }

    #[test]
    fn mailbox_display() {
        assert_eq!("foo@bar.com", mailbox("foo", "bar.com").to_string());
        assert_eq!(
            "\"foo bar\"@bar.com",
            mailbox("foo bar", "bar.com").to_string(),
        );
        assert_eq!(
            "\"foo\\\"bar\"@bar.com",
            mailbox("foo\"bar", "bar.com").to_string(),
        );
        assert_eq!(
            "\"foo.\"@bar.com",
            mailbox("foo.", "bar.com").to_string(),
        );
        assert_eq!(
            "[192.0.2.1]",
            Host::Address("192.0.2.1".parse().unwrap()).to_string(),
        );
    }

    #[test]
    fn parameter_keys_are_case_insensitive() {
        let mut parameters = Parameters::new();
        parameters.insert("Size", "42".to_owned());
        assert_eq!(Some("42"), parameters.get("SIZE"));
        assert_eq!(Some("42"), parameters.get("size"));
        assert_eq!(None, parameters.get("BODY"));

        parameters.insert("SIZE", "43".to_owned());
        assert_eq!(Some("43"), parameters.get("size"));
    }

    #[test]
    fn transaction_reset() {
        let mut transaction = Transaction {
            reverse_path: Some(ReversePath::Mailbox(mailbox("a", "b.com"))),
            recipients: vec![mailbox("c", "d.com")],
            parameters: Parameters::new(),
            data: b"hello".to_vec(),
        };
        assert!(transaction.from().is_some());

        transaction.reset();
        assert_eq!(None, transaction.reverse_path);
        assert!(transaction.recipients.is_empty());
        assert!(transaction.data.is_empty());

        transaction.reverse_path = Some(ReversePath::Null);
        assert_eq!(None, transaction.from());
    }
}
