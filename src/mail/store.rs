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
use crate::smtp::transaction::Transaction;

/// Receives completed messages.
///
/// The store is invoked exactly once per successfully transferred `DATA`
/// body, with the full transaction: reverse-path, recipients, `MAIL`
/// parameters, and the raw message bytes with dot-stuffing removed. The
/// response it returns is written to the peer verbatim, so a store can
/// answer with its own queue id, defer with a `4xx`, or reject with a
/// `5xx`. Returning a closing code (`221`/`421`) additionally ends the
/// session after the response is written.
#[async_trait]
pub trait MessageStore: Send {
    async fn save(
        &mut self,
        context: &SessionContext,
        transaction: &Transaction,
    ) -> SmtpResponse<'static>;
}

pub trait MessageStoreFactory: Send + Sync {
    fn create_store(&self, context: &SessionContext)
        -> Box<dyn MessageStore>;
}

/// A store which discards every message and reports success.
pub struct NullMessageStore;

#[async_trait]
impl MessageStore for NullMessageStore {
    async fn save(
        &mut self,
        _context: &SessionContext,
        _transaction: &Transaction,
    ) -> SmtpResponse<'static> {
        SmtpResponse::ok()
    }
}

impl MessageStoreFactory for NullMessageStore {
    fn create_store(
        &self,
        _context: &SessionContext,
    ) -> Box<dyn MessageStore> {
        Box::new(NullMessageStore)
    }
}
