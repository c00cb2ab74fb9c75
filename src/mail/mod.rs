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

//! The seams where caller-supplied mail handling plugs in.
//!
//! Each trait has a companion factory so that implementations which are not
//! concurrency-safe can be written naively: the server calls the factory
//! once per session and never shares the produced instance.

mod auth;
mod filter;
mod store;

pub use self::auth::{UserAuthenticator, UserAuthenticatorFactory};
pub use self::filter::{
    AcceptAllFilter, FilterResult, MailboxFilter, MailboxFilterFactory,
};
pub use self::store::{MessageStore, MessageStoreFactory, NullMessageStore};
