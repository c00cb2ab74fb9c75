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

use std::net::SocketAddr;

use super::transaction::{Mailbox, Parameters, ReversePath};

/// A fully-parsed command with its argument values.
///
/// Parsing never mutates the session; the session runtime executes the
/// command against its context after the state table has admitted it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// HELO origin-domain
    Helo { host: String },
    /// EHLO origin-domain-or-address-literal
    Ehlo { host: EhloHost },
    /// MAIL FROM:<reverse-path> [parameters]
    Mail {
        from: ReversePath,
        parameters: Parameters,
    },
    /// RCPT TO:<forward-path> (ESMTP parameters accepted but ignored)
    Rcpt { to: Mailbox },
    /// DATA
    Data,
    /// RSET
    Rset,
    /// NOOP
    Noop,
    /// QUIT
    Quit,
    /// STARTTLS
    StartTls,
    /// DBUG
    Dbug,
    /// AUTH mechanism [initial-response]
    Auth {
        mechanism: String,
        initial_response: Option<String>,
    },
    /// A PROXY protocol v1 header. Only ever parsed as the very first line
    /// of a connection, before the banner; never dispatched through the
    /// state table.
    Proxy(ProxyHeader),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EhloHost {
    Domain(String),
    Address(std::net::Ipv4Addr),
}

impl std::fmt::Display for EhloHost {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match *self {
            EhloHost::Domain(ref domain) => write!(f, "{}", domain),
            EhloHost::Address(addr) => write!(f, "[{}]", addr),
        }
    }
}

/// The addresses conveyed by a PROXY v1 header.
///
/// `UNKNOWN` headers carry no addresses; the session then keeps the socket
/// peer address it already has.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProxyHeader {
    pub source: Option<SocketAddr>,
    pub destination: Option<SocketAddr>,
}
