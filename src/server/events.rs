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

use super::endpoint::Endpoint;
use crate::smtp::command::Command;
use crate::smtp::session::SessionContext;
use crate::support::error::Error;

/// Lifecycle notifications from the server.
///
/// Every method has a no-op default, so implementations only override what
/// they care about. Callbacks are invoked synchronously from inside the
/// accept loops and sessions; anything expensive should be handed off.
pub trait ServerEvents: Send + Sync {
    /// An endpoint has been bound. `local` is the actual bound address,
    /// which differs from the configured one when port 0 was requested.
    fn endpoint_started(&self, _endpoint: &Endpoint, _local: SocketAddr) {}

    /// An endpoint's accept loop has ended and all of its sessions have
    /// completed.
    fn endpoint_stopped(&self, _endpoint: &Endpoint) {}

    /// A connection has been accepted and its session context built.
    fn session_created(&self, _context: &SessionContext) {}

    /// A command has parsed and been admitted by the state table, and is
    /// about to execute.
    fn command_executing(&self, _context: &SessionContext, _command: &Command) {
    }

    /// A session has ended, normally or otherwise.
    fn session_completed(
        &self,
        _context: &SessionContext,
        _error: Option<&Error>,
    ) {
    }
}

/// The default listener: ignores everything.
pub struct NullEvents;

impl ServerEvents for NullEvents {}
