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

//! Postern is an embeddable ESMTP (RFC 5321) receive server.
//!
//! The crate accepts TCP connections on one or more endpoints, negotiates an
//! ESMTP session with each peer, parses and validates commands, runs mail
//! transactions, optionally upgrades the transport to TLS (both implicitly
//! and via `STARTTLS`), optionally authenticates the peer, and hands each
//! accepted message to a caller-supplied store.
//!
//! What happens to a message once it has been accepted is entirely up to the
//! caller: the [`mail::MessageStore`], [`mail::MailboxFilter`], and
//! [`mail::UserAuthenticator`] traits are the seams where policy and
//! persistence plug in. Postern itself never touches the file system and
//! never interprets the message body.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use postern::mail::{AcceptAllFilter, NullMessageStore};
//! use postern::server::{Endpoint, ServerOptions, SmtpServer};
//!
//! # async fn example() -> Result<(), postern::support::error::Error> {
//! let options = ServerOptions::builder()
//!     .server_name("mx.example.com")
//!     .endpoint(Endpoint::new("0.0.0.0:25".parse().unwrap()))
//!     .message_store_factory(Arc::new(NullMessageStore))
//!     .mailbox_filter_factory(Arc::new(AcceptAllFilter))
//!     .build()?;
//!
//! let server = SmtpServer::new(options);
//! let shutdown = server.shutdown_handle();
//! # drop(shutdown);
//! server.serve().await
//! # }
//! ```

pub mod mail;
pub mod server;
pub mod smtp;
pub mod support;

#[cfg(test)]
static INIT_TEST_LOG: std::sync::Once = std::sync::Once::new();

#[cfg(test)]
fn init_test_log() {
    INIT_TEST_LOG.call_once(|| {
        if !std::env::var("TEST_LOG").ok().map_or(false, |v| "1" == v) {
            return;
        }

        let stderr = log4rs::append::console::ConsoleAppender::builder()
            .target(log4rs::append::console::Target::Stderr)
            .encoder(Box::new(log4rs::encode::pattern::PatternEncoder::new(
                "{d(%H:%M:%S%.3f)} [{l}][{t}] {m}{n}",
            )))
            .build();
        let log_config = log4rs::config::Config::builder()
            .appender(
                log4rs::config::Appender::builder()
                    .build("stderr", Box::new(stderr)),
            )
            .build(
                log4rs::config::Root::builder()
                    .appender("stderr")
                    .build(log::LevelFilter::Trace),
            )
            .unwrap();
        let _ = log4rs::init_config(log_config);
    })
}
