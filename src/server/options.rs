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

use std::sync::Arc;
use std::time::Duration;

use super::endpoint::Endpoint;
use super::events::{NullEvents, ServerEvents};
use crate::mail::{
    AcceptAllFilter, MailboxFilterFactory, MessageStoreFactory,
    NullMessageStore, UserAuthenticatorFactory,
};
use crate::support::error::Error;

/// The server configuration, immutable once built.
///
/// Constructed via [`ServerOptions::builder`]. There is no way to mutate a
/// running server; every session reads this record through a shared
/// reference.
pub struct ServerOptions {
    /// The name announced in the banner and in HELO/EHLO responses.
    pub server_name: String,
    pub endpoints: Vec<Arc<Endpoint>>,
    pub message_store_factory: Arc<dyn MessageStoreFactory>,
    pub mailbox_filter_factory: Arc<dyn MailboxFilterFactory>,
    pub user_authenticator_factory: Option<Arc<dyn UserAuthenticatorFactory>>,
    /// The AUTH mechanisms offered, in EHLO advertisement order. Only
    /// `PLAIN` and `LOGIN` have server-side support.
    pub authentication_mechanisms: Vec<String>,
    /// Upper bound on message size in octets; zero means unlimited and
    /// suppresses the `SIZE` advertisement.
    pub max_message_size: u64,
    /// How many commands may fail in a row before the session is closed
    /// with a `421`.
    pub max_retry_count: u32,
    /// How many AUTH attempts may fail before the session is closed.
    pub max_authentication_attempts: u32,
    /// Capacity of the per-session read and write buffers.
    pub network_buffer_size: usize,
    /// Bounds the wait for each complete command line.
    pub command_wait_timeout: Duration,
    pub events: Arc<dyn ServerEvents>,
}

impl ServerOptions {
    pub fn builder() -> ServerOptionsBuilder {
        ServerOptionsBuilder::default()
    }
}

pub struct ServerOptionsBuilder {
    server_name: String,
    endpoints: Vec<Arc<Endpoint>>,
    message_store_factory: Arc<dyn MessageStoreFactory>,
    mailbox_filter_factory: Arc<dyn MailboxFilterFactory>,
    user_authenticator_factory: Option<Arc<dyn UserAuthenticatorFactory>>,
    authentication_mechanisms: Vec<String>,
    max_message_size: u64,
    max_retry_count: u32,
    max_authentication_attempts: u32,
    network_buffer_size: usize,
    command_wait_timeout: Duration,
    events: Arc<dyn ServerEvents>,
}

impl Default for ServerOptionsBuilder {
    fn default() -> Self {
        Self {
            server_name: String::new(),
            endpoints: Vec::new(),
            message_store_factory: Arc::new(NullMessageStore),
            mailbox_filter_factory: Arc::new(AcceptAllFilter),
            user_authenticator_factory: None,
            authentication_mechanisms: vec![
                "PLAIN".to_owned(),
                "LOGIN".to_owned(),
            ],
            max_message_size: 0,
            max_retry_count: 5,
            max_authentication_attempts: 3,
            network_buffer_size: 128,
            command_wait_timeout: Duration::from_secs(5 * 60),
            events: Arc::new(NullEvents),
        }
    }
}

impl ServerOptionsBuilder {
    pub fn server_name(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = server_name.into();
        self
    }

    /// Adds a listening endpoint. May be called repeatedly.
    pub fn endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoints.push(Arc::new(endpoint));
        self
    }

    pub fn message_store_factory(
        mut self,
        factory: Arc<dyn MessageStoreFactory>,
    ) -> Self {
        self.message_store_factory = factory;
        self
    }

    pub fn mailbox_filter_factory(
        mut self,
        factory: Arc<dyn MailboxFilterFactory>,
    ) -> Self {
        self.mailbox_filter_factory = factory;
        self
    }

    pub fn user_authenticator_factory(
        mut self,
        factory: Arc<dyn UserAuthenticatorFactory>,
    ) -> Self {
        self.user_authenticator_factory = Some(factory);
        self
    }

    pub fn authentication_mechanisms(
        mut self,
        mechanisms: Vec<String>,
    ) -> Self {
        self.authentication_mechanisms = mechanisms;
        self
    }

    pub fn max_message_size(mut self, max_message_size: u64) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    pub fn max_retry_count(mut self, max_retry_count: u32) -> Self {
        self.max_retry_count = max_retry_count;
        self
    }

    pub fn max_authentication_attempts(mut self, max: u32) -> Self {
        self.max_authentication_attempts = max;
        self
    }

    pub fn network_buffer_size(mut self, size: usize) -> Self {
        self.network_buffer_size = size;
        self
    }

    pub fn command_wait_timeout(mut self, timeout: Duration) -> Self {
        self.command_wait_timeout = timeout;
        self
    }

    pub fn events(mut self, events: Arc<dyn ServerEvents>) -> Self {
        self.events = events;
        self
    }

    pub fn build(self) -> Result<ServerOptions, Error> {
        if self.server_name.is_empty() {
            return Err(Error::InvalidOptions("server_name is required"));
        }
        if self.endpoints.is_empty() {
            return Err(Error::InvalidOptions(
                "at least one endpoint is required",
            ));
        }
        if self.authentication_mechanisms.is_empty()
            && self.user_authenticator_factory.is_some()
        {
            return Err(Error::InvalidOptions(
                "an authenticator without mechanisms can never be used",
            ));
        }

        Ok(ServerOptions {
            server_name: self.server_name,
            endpoints: self.endpoints,
            message_store_factory: self.message_store_factory,
            mailbox_filter_factory: self.mailbox_filter_factory,
            user_authenticator_factory: self.user_authenticator_factory,
            authentication_mechanisms: self.authentication_mechanisms,
            max_message_size: self.max_message_size,
            max_retry_count: self.max_retry_count,
            max_authentication_attempts: self.max_authentication_attempts,
            network_buffer_size: self.network_buffer_size,
            command_wait_timeout: self.command_wait_timeout,
            events: self.events,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn build_requires_name_and_endpoint() {
        assert!(matches!(
            ServerOptions::builder().build(),
            Err(Error::InvalidOptions(_)),
        ));
        assert!(matches!(
            ServerOptions::builder().server_name("localhost").build(),
            Err(Error::InvalidOptions(_)),
        ));

        let options = ServerOptions::builder()
            .server_name("localhost")
            .endpoint(Endpoint::new("127.0.0.1:0".parse().unwrap()))
            .build()
            .unwrap();
        assert_eq!("localhost", options.server_name);
        assert_eq!(5, options.max_retry_count);
        assert_eq!(128, options.network_buffer_size);
        assert_eq!(Duration::from_secs(300), options.command_wait_timeout);
        assert_eq!(
            vec!["PLAIN".to_owned(), "LOGIN".to_owned()],
            options.authentication_mechanisms,
        );
    }
}
