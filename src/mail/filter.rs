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

use async_trait::async_trait;

use crate::smtp::response::SmtpResponse;
use crate::smtp::session::SessionContext;
use crate::smtp::transaction::{Mailbox, ReversePath};

/// A verdict on a sender, recipient, or authentication attempt.
///
/// The refusals optionally carry a response to send instead of the stock
/// `450`/`550` (or `535` for authentication).
#[derive(Clone, Debug)]
pub enum FilterResult {
    Yes,
    NoTemporarily(Option<SmtpResponse<'static>>),
    NoPermanently(Option<SmtpResponse<'static>>),
}

/// Decides which senders and recipients a session may use.
///
/// The filter is consulted once per `MAIL` and once per `RCPT`, before the
/// session records anything in its transaction. It may suspend arbitrarily;
/// the session stays responsive to server shutdown while awaiting it.
#[async_trait]
pub trait MailboxFilter: Send {
    /// Whether a transaction from `from` may begin.
    ///
    /// `estimated_size` is the value of the `SIZE` parameter, or zero if
    /// the client did not declare one. The configured maximum has already
    /// been enforced.
    async fn can_accept_from(
        &mut self,
        context: &SessionContext,
        from: &ReversePath,
        estimated_size: u64,
    ) -> FilterResult;

    /// Whether `to` may be added to the current transaction.
    async fn can_deliver_to(
        &mut self,
        context: &SessionContext,
        to: &Mailbox,
    ) -> FilterResult;
}

pub trait MailboxFilterFactory: Send + Sync {
    fn create_filter(
        &self,
        context: &SessionContext,
    ) -> Box<dyn MailboxFilter>;
}

/// The do-nothing filter: every sender and recipient is welcome.
pub struct AcceptAllFilter;

#[async_trait]
impl MailboxFilter for AcceptAllFilter {
    async fn can_accept_from(
        &mut self,
        _context: &SessionContext,
        _from: &ReversePath,
        _estimated_size: u64,
    ) -> FilterResult {
        FilterResult::Yes
    }

    async fn can_deliver_to(
        &mut self,
        _context: &SessionContext,
        _to: &Mailbox,
    ) -> FilterResult {
        FilterResult::Yes
    }
}

impl MailboxFilterFactory for AcceptAllFilter {
    fn create_filter(
        &self,
        _context: &SessionContext,
    ) -> Box<dyn MailboxFilter> {
        Box::new(AcceptAllFilter)
    }
}
