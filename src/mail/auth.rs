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

use super::filter::FilterResult;
use crate::smtp::session::SessionContext;

/// Validates credentials presented via `AUTH`.
///
/// Both supported mechanisms (`PLAIN` and `LOGIN`) reduce to a user id and
/// a password by the time this is called; the mechanism-specific framing
/// has already been decoded and validated.
#[async_trait]
pub trait UserAuthenticator: Send {
    async fn authenticate(
        &mut self,
        context: &SessionContext,
        user: &str,
        password: &str,
    ) -> FilterResult;
}

pub trait UserAuthenticatorFactory: Send + Sync {
    fn create_authenticator(
        &self,
        context: &SessionContext,
    ) -> Box<dyn UserAuthenticator>;
}
