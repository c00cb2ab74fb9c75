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

//! The protocol state machine, as a declarative table.
//!
//! Each state maps the verbs it admits to the grammar production that
//! parses the rest of the line and the state the session moves to when the
//! command both parses and executes successfully. The table itself holds no
//! session data; the session owns the current state id and consults the
//! table per command.

use super::parser::{Parser, Production};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SmtpState {
    /// Before the banner. No commands are admitted; only a PROXY header may
    /// arrive here, and that is handled outside the table.
    None,
    /// After the banner or a completed STARTTLS handshake. The peer must
    /// (re-)introduce itself before anything else.
    Initialized,
    /// Introduced, no transaction in progress.
    WaitingForMail,
    /// `MAIL` accepted, no recipients yet.
    WithinTransaction,
    /// At least one recipient accepted; `DATA` has become legal.
    CanAcceptData,
}

pub struct Transition {
    pub parse: Production,
    /// The state entered when the command parses and executes
    /// successfully; `None` leaves the state untouched.
    pub next: Option<SmtpState>,
}

struct Entry {
    verb: &'static str,
    transition: Transition,
}

macro_rules! entry {
    ($verb:expr, $production:path) => {
        Entry {
            verb: $verb,
            transition: Transition {
                parse: (|p: &mut Parser<'_>| $production(p)),
                next: None,
            },
        }
    };
    ($verb:expr, $production:path, $next:ident) => {
        Entry {
            verb: $verb,
            transition: Transition {
                parse: (|p: &mut Parser<'_>| $production(p)),
                next: Some(SmtpState::$next),
            },
        }
    };
}

// STARTTLS and AUTH are admitted in every post-banner state; their handlers
// refuse redundant use. NOOP and RSET are deliberately absent from
// `Initialized` so that a peer which has not (re-)introduced itself gets a
// sequence error for anything except HELO/EHLO/QUIT.
static INITIALIZED: &[Entry] = &[
    entry!("HELO", Parser::make_helo, WaitingForMail),
    entry!("EHLO", Parser::make_ehlo, WaitingForMail),
    entry!("QUIT", Parser::make_quit),
    entry!("STARTTLS", Parser::make_starttls, Initialized),
    entry!("AUTH", Parser::make_auth),
    entry!("DBUG", Parser::make_dbug),
];

static WAITING_FOR_MAIL: &[Entry] = &[
    entry!("HELO", Parser::make_helo, WaitingForMail),
    entry!("EHLO", Parser::make_ehlo, WaitingForMail),
    entry!("MAIL", Parser::make_mail, WithinTransaction),
    entry!("NOOP", Parser::make_noop),
    entry!("RSET", Parser::make_rset, WaitingForMail),
    entry!("QUIT", Parser::make_quit),
    entry!("STARTTLS", Parser::make_starttls, Initialized),
    entry!("AUTH", Parser::make_auth),
    entry!("DBUG", Parser::make_dbug),
];

static WITHIN_TRANSACTION: &[Entry] = &[
    // MAIL mid-transaction recycles through RSET semantics.
    entry!("MAIL", Parser::make_mail, WithinTransaction),
    entry!("RCPT", Parser::make_rcpt, CanAcceptData),
    entry!("NOOP", Parser::make_noop),
    entry!("RSET", Parser::make_rset, WaitingForMail),
    entry!("QUIT", Parser::make_quit),
    entry!("STARTTLS", Parser::make_starttls, Initialized),
    entry!("AUTH", Parser::make_auth),
    entry!("DBUG", Parser::make_dbug),
];

static CAN_ACCEPT_DATA: &[Entry] = &[
    entry!("RCPT", Parser::make_rcpt, CanAcceptData),
    entry!("DATA", Parser::make_data, WaitingForMail),
    entry!("NOOP", Parser::make_noop),
    entry!("RSET", Parser::make_rset, WaitingForMail),
    entry!("QUIT", Parser::make_quit),
    entry!("STARTTLS", Parser::make_starttls, Initialized),
    entry!("AUTH", Parser::make_auth),
    entry!("DBUG", Parser::make_dbug),
];

/// Every verb any state admits, for distinguishing out-of-sequence commands
/// from unrecognised ones.
static ALL_VERBS: &[&str] = &[
    "HELO", "EHLO", "MAIL", "RCPT", "DATA", "RSET", "NOOP", "QUIT",
    "STARTTLS", "AUTH", "DBUG",
];

fn entries(state: SmtpState) -> &'static [Entry] {
    match state {
        SmtpState::None => &[],
        SmtpState::Initialized => INITIALIZED,
        SmtpState::WaitingForMail => WAITING_FOR_MAIL,
        SmtpState::WithinTransaction => WITHIN_TRANSACTION,
        SmtpState::CanAcceptData => CAN_ACCEPT_DATA,
    }
}

/// Looks up the transition for `verb` in `state`, case-insensitively.
pub fn lookup(state: SmtpState, verb: &str) -> Option<&'static Transition> {
    entries(state)
        .iter()
        .find(|e| e.verb.eq_ignore_ascii_case(verb))
        .map(|e| &e.transition)
}

/// The verbs `state` admits, in table order, for sequence-error messages.
pub fn expected_verbs(
    state: SmtpState,
) -> impl Iterator<Item = &'static str> {
    entries(state).iter().map(|e| e.verb)
}

pub fn is_known_verb(verb: &str) -> bool {
    ALL_VERBS.iter().any(|v| v.eq_ignore_ascii_case(verb))
}

#[cfg(test)]
mod test {
    use super::SmtpState::*;
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        assert!(lookup(WaitingForMail, "mail").is_some());
        assert!(lookup(WaitingForMail, "MaIl").is_some());
        assert!(lookup(WaitingForMail, "MAIL").is_some());
    }

    #[test]
    fn sequencing() {
        // Nothing is legal before the banner
        assert!(lookup(None, "HELO").is_none());
        assert!(lookup(None, "NOOP").is_none());

        // A session which has not introduced itself can do very little
        assert!(lookup(Initialized, "EHLO").is_some());
        assert!(lookup(Initialized, "MAIL").is_none());
        assert!(lookup(Initialized, "RCPT").is_none());
        assert!(lookup(Initialized, "DATA").is_none());
        assert!(lookup(Initialized, "NOOP").is_none());
        assert!(lookup(Initialized, "RSET").is_none());

        // RCPT and DATA only become legal in order
        assert!(lookup(WaitingForMail, "MAIL").is_some());
        assert!(lookup(WaitingForMail, "RCPT").is_none());
        assert!(lookup(WaitingForMail, "DATA").is_none());
        assert!(lookup(WithinTransaction, "RCPT").is_some());
        assert!(lookup(WithinTransaction, "DATA").is_none());
        assert!(lookup(CanAcceptData, "DATA").is_some());
        assert!(lookup(CanAcceptData, "RCPT").is_some());
        assert!(lookup(CanAcceptData, "MAIL").is_none());

        // STARTTLS and AUTH are reachable from every post-banner state
        for state in
            [Initialized, WaitingForMail, WithinTransaction, CanAcceptData]
        {
            assert!(lookup(state, "STARTTLS").is_some(), "{state:?}");
            assert!(lookup(state, "AUTH").is_some(), "{state:?}");
            assert!(lookup(state, "QUIT").is_some(), "{state:?}");
            assert!(lookup(state, "DBUG").is_some(), "{state:?}");
        }
    }

    #[test]
    fn transitions() {
        assert_eq!(
            Some(WithinTransaction),
            lookup(WaitingForMail, "MAIL").unwrap().next,
        );
        assert_eq!(
            Some(CanAcceptData),
            lookup(WithinTransaction, "RCPT").unwrap().next,
        );
        assert_eq!(
            Some(WaitingForMail),
            lookup(CanAcceptData, "DATA").unwrap().next,
        );
        assert_eq!(
            Some(Initialized),
            lookup(CanAcceptData, "STARTTLS").unwrap().next,
        );
        assert_eq!(Option::None, lookup(WaitingForMail, "NOOP").unwrap().next);
        assert_eq!(Option::None, lookup(WaitingForMail, "AUTH").unwrap().next);
    }

    #[test]
    fn known_verbs() {
        assert!(is_known_verb("rcpt"));
        assert!(is_known_verb("STARTTLS"));
        assert!(!is_known_verb("BDAT"));
        assert!(!is_known_verb("PROXY"));
        assert!(!is_known_verb("GET"));

        let expected: Vec<_> = expected_verbs(WaitingForMail).collect();
        assert_eq!(
            vec![
                "HELO", "EHLO", "MAIL", "NOOP", "RSET", "QUIT", "STARTTLS",
                "AUTH", "DBUG",
            ],
            expected,
        );
    }
}
