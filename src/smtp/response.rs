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

use std::borrow::Cow;
use std::fmt;

use super::codes::*;

/// An SMTP response, excluding the continuation/final distinction.
///
/// Collaborators (message stores, mailbox filters, user authenticators)
/// produce these to override the server's stock responses; the session
/// writes them on the wire with the appropriate continuation indicator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SmtpResponse<'a>(pub PrimaryCode, pub Cow<'a, str>);

impl SmtpResponse<'static> {
    pub fn ok() -> Self {
        Self(pc::Ok, Cow::Borrowed("Ok"))
    }

    pub fn syntax_error() -> Self {
        Self(pc::CommandSyntaxError, Cow::Borrowed("Syntax error"))
    }

    /// Generates a response for a sequence error which the state table
    /// should have prevented.
    #[cfg(not(test))]
    pub fn internal_sequence_error() -> Self {
        Self(
            pc::BadSequenceOfCommands,
            Cow::Borrowed("Unexpected command"),
        )
    }

    #[cfg(test)]
    pub fn internal_sequence_error() -> Self {
        panic!("Unexpected command")
    }
}

impl SmtpResponse<'_> {
    /// Whether writing this response also ends the session.
    pub fn closes_session(&self) -> bool {
        matches!(
            self.0,
            pc::ServiceClosing | pc::ServiceNotAvailableClosing,
        )
    }

    pub fn into_owned(self) -> SmtpResponse<'static> {
        SmtpResponse(self.0, Cow::Owned(self.1.into_owned()))
    }
}

impl fmt::Display for SmtpResponse<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}", self.0 as u16, self.1)
    }
}
