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

//! The per-connection protocol engine.
//!
//! One task owns one `Session`; reads and writes are strictly serialised by
//! the protocol, so there is no intra-session concurrency to manage. The
//! loop reads a command line, consults the state table, runs the matching
//! grammar production, executes the command against the session context,
//! writes the response, and applies the state transition.

use std::borrow::Cow;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::str;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream,
};
use tokio_util::sync::CancellationToken;

use super::codes::*;
use super::command::{Command, EhloHost};
use super::parser::Parser;
use super::response::SmtpResponse;
use super::state::{self, SmtpState};
use super::tokenizer::{TokenKind, Tokenizer};
use super::transaction::{Mailbox, Parameters, ReversePath, Transaction};
use crate::mail::{
    FilterResult, MailboxFilter, MessageStore, UserAuthenticator,
};
use crate::server::{Endpoint, ServerOptions};
use crate::support::{
    error::Error, log_prefix::LogPrefix, net::SmtpStream,
};

/// Maximum length of a command line, including the CRLF (RFC 5321 §4.5.3.1).
const MAX_LINE: usize = 1000;
/// Maximum length of a PROXY protocol v1 header line, per the haproxy spec.
const PROXY_MAX_LINE: usize = 107;
/// Maximum recipients per transaction; beyond this, RCPT answers 452.
const MAX_RECIPIENTS: usize = 50;
/// Bound on the STARTTLS / implicit-TLS handshake.
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

static HTTP_VERBS: &[&str] = &["GET", "HEAD", "PUT", "POST", "DELETE", "OPTIONS"];

/// The per-session state visible to collaborators.
///
/// Everything a filter, store, authenticator, or event listener may want to
/// know about the connection lives here; the I/O handles and the protocol
/// state id stay private to the session.
pub struct SessionContext {
    pub options: Arc<ServerOptions>,
    pub endpoint: Arc<Endpoint>,
    /// The peer address, as reported by the socket or overridden by a
    /// PROXY header.
    pub remote_endpoint: SocketAddr,
    /// Whether the transport is (already) TLS. Never reverts to false once
    /// set.
    pub secure: bool,
    /// The domain the peer introduced itself with, cleared by STARTTLS.
    pub helo_host: Option<String>,
    /// Identity established by a successful AUTH. RSET does not clear it.
    pub authenticated_user: Option<String>,
    pub transaction: Transaction,
    /// Consecutive failed commands; any success resets it.
    pub retry_count: u32,
    pub authentication_attempts: u32,
    /// Open string-keyed storage for collaborator extension data.
    pub properties: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseKind {
    /// The last in a series of responses.
    ///
    /// Indicates no continuation and forces a flush.
    Final,
    /// A non-final response that is safe to buffer.
    Delayable,
}

impl ResponseKind {
    fn or_final(self, phinal: bool) -> Self {
        if phinal {
            ResponseKind::Final
        } else {
            self
        }
    }

    fn indicator(self) -> char {
        match self {
            Final => ' ',
            Delayable => '-',
        }
    }
}

use self::ResponseKind::*;

/// Whether a command both parsed and had its intended effect.
///
/// `Rejected` covers everything from filter refusals to redundant STARTTLS:
/// the response has been written, the state does not advance, and the
/// failure counts against the retry limit.
enum Executed {
    Accepted,
    Rejected,
}

pub(crate) struct Session {
    io: BufStream<SmtpStream>,
    ctx: SessionContext,
    state: SmtpState,
    log_prefix: LogPrefix,
    store: Box<dyn MessageStore>,
    filter: Box<dyn MailboxFilter>,
    authenticator: Option<Box<dyn UserAuthenticator>>,
    shutdown: CancellationToken,
    quit: bool,
}

impl Session {
    pub(crate) fn new(
        socket: std::net::TcpStream,
        peer: SocketAddr,
        endpoint: Arc<Endpoint>,
        options: Arc<ServerOptions>,
        shutdown: CancellationToken,
    ) -> Result<Self, Error> {
        let stream = SmtpStream::new(socket)?;
        let ctx = SessionContext {
            endpoint,
            remote_endpoint: peer,
            secure: false,
            helo_host: None,
            authenticated_user: None,
            transaction: Transaction::default(),
            retry_count: 0,
            authentication_attempts: 0,
            properties: HashMap::new(),
            options,
        };

        let store = ctx.options.message_store_factory.create_store(&ctx);
        let filter = ctx.options.mailbox_filter_factory.create_filter(&ctx);
        let authenticator = ctx
            .options
            .user_authenticator_factory
            .as_ref()
            .map(|f| f.create_authenticator(&ctx));

        let buffer_size = ctx.options.network_buffer_size;
        Ok(Self {
            io: BufStream::with_capacity(buffer_size, buffer_size, stream),
            log_prefix: LogPrefix::new(peer.to_string()),
            state: SmtpState::None,
            store,
            filter,
            authenticator,
            shutdown,
            quit: false,
            ctx,
        })
    }

    pub(crate) async fn run(mut self) {
        self.ctx.options.events.session_created(&self.ctx);
        info!("{} Connection established", self.log_prefix);

        let shutdown = self.shutdown.clone();
        let result = tokio::select! {
            r = self.serve() => r,
            _ = shutdown.cancelled() => Err(Error::Cancelled),
        };

        match result {
            Ok(()) => info!("{} Normal client disconnect", self.log_prefix),
            Err(Error::Cancelled) => {
                info!("{} Session aborted by server shutdown", self.log_prefix)
            },
            Err(ref e) => {
                warn!("{} Abnormal client disconnect: {}", self.log_prefix, e)
            },
        }

        // Best effort; the peer may already be gone.
        let _ = self.io.shutdown().await;

        // Cancellation is a normal shutdown, not a session failure.
        let error = match result {
            Err(ref e) if !matches!(*e, Error::Cancelled) => Some(e),
            _ => None,
        };
        self.ctx.options.events.session_completed(&self.ctx, error);
    }

    async fn serve(&mut self) -> Result<(), Error> {
        if self.ctx.endpoint.expect_proxy_header {
            self.read_proxy_header().await?;
        }

        if self.ctx.endpoint.is_secure {
            let endpoint = Arc::clone(&self.ctx.endpoint);
            let acceptor = endpoint.tls_acceptor.as_deref().ok_or(
                Error::InvalidOptions("implicit TLS endpoint without acceptor"),
            )?;
            tokio::time::timeout(
                TLS_HANDSHAKE_TIMEOUT,
                self.io.get_mut().ssl_accept(acceptor),
            )
            .await
            .map_err(|_| {
                Error::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "TLS handshake timed out",
                ))
            })??;
            self.ctx.secure = true;
            info!("{} Implicit TLS handshake completed", self.log_prefix);
        }

        self.state = SmtpState::Initialized;
        self.send_greeting().await?;

        let mut buffer = Vec::new();
        while !self.quit {
            self.run_command(&mut buffer).await?;
        }

        Ok(())
    }

    /// Consumes the mandatory PROXY protocol v1 header which a fronting
    /// proxy sends before anything else on the connection.
    ///
    /// No response is ever written for it; a malformed header aborts the
    /// session without a word, since whatever is on the other end is not
    /// the proxy this endpoint was configured for.
    async fn read_proxy_header(&mut self) -> Result<(), Error> {
        let mut buffer = Vec::new();
        tokio::time::timeout(
            self.ctx.endpoint.read_timeout,
            (&mut self.io)
                .take(PROXY_MAX_LINE as u64)
                .read_until(b'\n', &mut buffer),
        )
        .await
        .map_err(|_| {
            Error::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "Timed out waiting for PROXY header",
            ))
        })??;

        if !buffer.ends_with(b"\r\n") {
            warn!("{} Malformed PROXY header", self.log_prefix);
            return Err(Error::InvalidProxyHeader);
        }

        let Ok(line) = str::from_utf8(&buffer[..buffer.len() - 2]) else {
            warn!("{} Non-ASCII PROXY header", self.log_prefix);
            return Err(Error::InvalidProxyHeader);
        };

        let mut tok = Tokenizer::new(line);
        let verb = tok.take();
        let mut parser = Parser::new(tok);
        let header = match verb.text.eq_ignore_ascii_case("PROXY") {
            true => match parser.make_proxy() {
                Ok(Command::Proxy(header)) => header,
                _ => {
                    warn!(
                        "{} Malformed PROXY header: {:?}",
                        self.log_prefix, line,
                    );
                    return Err(Error::InvalidProxyHeader);
                },
            },
            false => {
                warn!(
                    "{} Expected PROXY header, got {:?}",
                    self.log_prefix, line,
                );
                return Err(Error::InvalidProxyHeader);
            },
        };

        if let Some(source) = header.source {
            info!(
                "{} Peer address {} declared via PROXY",
                self.log_prefix, source,
            );
            self.ctx.remote_endpoint = source;
            self.log_prefix.set_peer(source.to_string());
        }

        Ok(())
    }

    async fn run_command(&mut self, buffer: &mut Vec<u8>) -> Result<(), Error> {
        buffer.clear();

        let read = tokio::time::timeout(
            self.ctx.options.command_wait_timeout,
            (&mut self.io).take(MAX_LINE as u64).read_until(b'\n', buffer),
        )
        .await;
        match read {
            Ok(r) => {
                r?;
            },
            Err(_elapsed) => {
                warn!(
                    "{} Timed out waiting for a command",
                    self.log_prefix,
                );
                return self
                    .send_response(
                        Final,
                        pc::ServiceNotAvailableClosing,
                        Cow::Borrowed("Timed out waiting for a command"),
                    )
                    .await;
            },
        }

        if buffer.is_empty() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "EOF reached at start of command",
            )));
        }

        if !buffer.ends_with(b"\n") {
            if buffer.len() >= MAX_LINE {
                self.command_failed(
                    pc::CommandSyntaxError,
                    Cow::Borrowed("Line too long"),
                )
                .await?;

                // Skip the rest of the line
                while !self.quit
                    && !buffer.is_empty()
                    && !buffer.ends_with(b"\n")
                {
                    buffer.clear();
                    tokio::time::timeout(
                        self.ctx.endpoint.read_timeout,
                        (&mut self.io)
                            .take(MAX_LINE as u64)
                            .read_until(b'\n', buffer),
                    )
                    .await
                    .map_err(|_| {
                        Error::Io(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "Timed out draining overlong line",
                        ))
                    })??;
                }

                return Ok(());
            } else {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "EOF reached within command",
                )));
            }
        }

        if !buffer.ends_with(b"\r\n") {
            return self
                .command_failed(
                    pc::CommandSyntaxError,
                    Cow::Borrowed("Sadly we cannot allow UNIX newlines here"),
                )
                .await;
        }

        let command_line = &buffer[..buffer.len() - 2];
        if command_line.contains(&0) {
            warn!(
                "{} Remote is speaking binary, closing connection",
                self.log_prefix,
            );
            self.quit = true;
            return Ok(());
        }

        let command_line = match str::from_utf8(command_line) {
            Ok(s) => s,
            Err(_) => {
                warn!("{} Non-UTF-8 command received", self.log_prefix);
                return self
                    .command_failed(
                        pc::CommandSyntaxError,
                        Cow::Borrowed("Malformed UTF-8"),
                    )
                    .await;
            },
        };

        let mut tok = Tokenizer::new(command_line);
        let verb = tok.take();
        if TokenKind::Text != verb.kind {
            warn!(
                "{} Received malformed line {:?}",
                self.log_prefix,
                truncate(command_line),
            );
            return self
                .command_failed(
                    pc::CommandSyntaxError,
                    Cow::Borrowed("Unrecognised command"),
                )
                .await;
        }

        let Some(transition) = state::lookup(self.state, verb.text) else {
            return self.dispatch_failed(verb.text, command_line).await;
        };

        let mut parser = Parser::new(tok);
        let command = match (transition.parse)(&mut parser) {
            Ok(command) => command,
            Err(response) => {
                warn!(
                    "{} Received bad {} command {:?}",
                    self.log_prefix,
                    verb.text.to_ascii_uppercase(),
                    truncate(command_line),
                );
                let SmtpResponse(code, quip) = response;
                return self.command_failed(code, quip).await;
            },
        };

        self.ctx.options.events.command_executing(&self.ctx, &command);

        match self.execute(command).await? {
            Executed::Accepted => {
                self.ctx.retry_count = 0;
                if let Some(next) = transition.next {
                    self.state = next;
                }
                Ok(())
            },
            Executed::Rejected => self.note_failure().await,
        }
    }

    /// Responds to a verb the current state does not admit: a sequence
    /// error if the verb means something somewhere, otherwise a syntax
    /// error.
    async fn dispatch_failed(
        &mut self,
        verb: &str,
        command_line: &str,
    ) -> Result<(), Error> {
        if state::is_known_verb(verb) {
            let expected = state::expected_verbs(self.state)
                .collect::<Vec<_>>()
                .join(", ");
            warn!(
                "{} Out-of-sequence {} command",
                self.log_prefix,
                verb.to_ascii_uppercase(),
            );
            self.command_failed(
                pc::BadSequenceOfCommands,
                Cow::Owned(format!(
                    "Bad sequence of commands, expected {}",
                    expected,
                )),
            )
            .await
        } else if HTTP_VERBS.iter().any(|v| v.eq_ignore_ascii_case(verb)) {
            warn!(
                "{} Remote is speaking HTTP, closing connection",
                self.log_prefix,
            );
            self.send_response(
                Final,
                pc::CommandSyntaxError,
                Cow::Borrowed("This is an SMTP server, not a web server"),
            )
            .await?;
            self.quit = true;
            Ok(())
        } else {
            warn!(
                "{} Received bad command {:?}",
                self.log_prefix,
                truncate(command_line),
            );
            self.command_failed(
                pc::CommandSyntaxError,
                Cow::Borrowed("Unrecognised command"),
            )
            .await
        }
    }

    async fn execute(&mut self, command: Command) -> Result<Executed, Error> {
        match command {
            Command::Helo { host } => self.cmd_helo(host).await,
            Command::Ehlo { host } => self.cmd_ehlo(host).await,
            Command::Mail { from, parameters } => {
                self.cmd_mail(from, parameters).await
            },
            Command::Rcpt { to } => self.cmd_rcpt(to).await,
            Command::Data => self.cmd_data().await,
            Command::Rset => self.cmd_rset().await,
            Command::Noop => self.cmd_noop().await,
            Command::Quit => self.cmd_quit().await,
            Command::StartTls => self.cmd_start_tls().await,
            Command::Dbug => self.cmd_dbug().await,
            Command::Auth {
                mechanism,
                initial_response,
            } => self.cmd_auth(mechanism, initial_response).await,
            Command::Proxy(_) => {
                // The state table never produces this; PROXY is consumed
                // before the banner.
                let SmtpResponse(code, quip) =
                    SmtpResponse::internal_sequence_error();
                self.send_response(Final, code, quip).await?;
                Ok(Executed::Rejected)
            },
        }
    }

    async fn cmd_helo(&mut self, host: String) -> Result<Executed, Error> {
        self.log_prefix.set_helo(host.clone());
        info!("{} SMTP HELO", self.log_prefix);
        self.ctx.helo_host = Some(host);
        self.ctx.transaction.reset();

        self.send_response(
            Final,
            pc::Ok,
            Cow::Owned(self.ctx.options.server_name.clone()),
        )
        .await?;
        Ok(Executed::Accepted)
    }

    async fn cmd_ehlo(&mut self, host: EhloHost) -> Result<Executed, Error> {
        self.log_prefix.set_helo(host.to_string());
        info!("{} SMTP EHLO", self.log_prefix);
        self.ctx.helo_host = Some(host.to_string());
        self.ctx.transaction.reset();

        let mut extensions = Vec::<Cow<'static, str>>::new();
        if self.ctx.options.max_message_size > 0 {
            extensions.push(Cow::Owned(format!(
                "SIZE {}",
                self.ctx.options.max_message_size,
            )));
        }
        // RFC 3207 requires not offering STARTTLS after TLS has been
        // negotiated.
        if self.ctx.endpoint.tls_acceptor.is_some() && !self.ctx.secure {
            extensions.push(Cow::Borrowed("STARTTLS"));
        }
        if self.authenticator.is_some()
            && (self.ctx.secure
                || self.ctx.endpoint.allow_unsecure_authentication)
        {
            extensions.push(Cow::Owned(format!(
                "AUTH {}",
                self.ctx.options.authentication_mechanisms.join(" "),
            )));
        }
        extensions.push(Cow::Borrowed("8BITMIME"));
        extensions.push(Cow::Borrowed("PIPELINING"));

        self.send_response(
            Delayable,
            pc::Ok,
            Cow::Owned(self.ctx.options.server_name.clone()),
        )
        .await?;
        let count = extensions.len();
        for (ix, ext) in extensions.into_iter().enumerate() {
            self.send_response(Delayable.or_final(ix + 1 == count), pc::Ok, ext)
                .await?;
        }

        Ok(Executed::Accepted)
    }

    async fn cmd_mail(
        &mut self,
        from: ReversePath,
        parameters: Parameters,
    ) -> Result<Executed, Error> {
        // A MAIL mid-transaction was admitted by the table specifically to
        // recycle through RSET semantics.
        self.ctx.transaction.reset();

        let declared_size = match parameters.get("SIZE") {
            None => 0,
            Some(text) => match text.parse::<u64>() {
                Ok(size) => size,
                Err(_) => {
                    self.send_response(
                        Final,
                        pc::ParameterSyntaxError,
                        Cow::Borrowed("Invalid SIZE parameter"),
                    )
                    .await?;
                    return Ok(Executed::Rejected);
                },
            },
        };

        let max_size = self.ctx.options.max_message_size;
        if max_size > 0 && declared_size > max_size {
            self.send_response(
                Final,
                pc::ExceededStorageAllocation,
                Cow::Owned(format!(
                    "Maximum message size is {} bytes",
                    max_size,
                )),
            )
            .await?;
            return Ok(Executed::Rejected);
        }

        let verdict = self
            .filter
            .can_accept_from(&self.ctx, &from, declared_size)
            .await;
        match verdict {
            FilterResult::Yes => {
                info!("{} Start mail transaction from {}", self.log_prefix, from);
                self.ctx.transaction.reverse_path = Some(from);
                self.ctx.transaction.parameters = parameters;
                self.send_response(Final, pc::Ok, Cow::Borrowed("Ok")).await?;
                Ok(Executed::Accepted)
            },
            FilterResult::NoTemporarily(response) => {
                warn!("{} Sender {} refused (transient)", self.log_prefix, from);
                self.send_refusal(
                    response,
                    pc::ActionNotTakenTemporary,
                    "Sender temporarily rejected",
                )
                .await?;
                Ok(Executed::Rejected)
            },
            FilterResult::NoPermanently(response) => {
                warn!("{} Sender {} refused", self.log_prefix, from);
                self.send_refusal(
                    response,
                    pc::ActionNotTakenPermanent,
                    "Sender rejected",
                )
                .await?;
                Ok(Executed::Rejected)
            },
        }
    }

    async fn cmd_rcpt(&mut self, to: Mailbox) -> Result<Executed, Error> {
        if self.ctx.transaction.recipients.len() >= MAX_RECIPIENTS {
            self.send_response(
                Final,
                pc::InsufficientStorage,
                Cow::Borrowed("Too many recipients"),
            )
            .await?;
            return Ok(Executed::Rejected);
        }

        let verdict = self.filter.can_deliver_to(&self.ctx, &to).await;
        match verdict {
            FilterResult::Yes => {
                self.ctx.transaction.recipients.push(to);
                self.send_response(Final, pc::Ok, Cow::Borrowed("Ok")).await?;
                Ok(Executed::Accepted)
            },
            FilterResult::NoTemporarily(response) => {
                warn!(
                    "{} Recipient {} refused (transient)",
                    self.log_prefix, to,
                );
                self.send_refusal(
                    response,
                    pc::ActionNotTakenTemporary,
                    "Recipient temporarily rejected",
                )
                .await?;
                Ok(Executed::Rejected)
            },
            FilterResult::NoPermanently(response) => {
                warn!("{} Recipient {} refused", self.log_prefix, to);
                self.send_refusal(
                    response,
                    pc::ActionNotTakenPermanent,
                    "Recipient rejected",
                )
                .await?;
                Ok(Executed::Rejected)
            },
        }
    }

    async fn cmd_data(&mut self) -> Result<Executed, Error> {
        self.send_response(
            Final,
            pc::StartMailInput,
            Cow::Borrowed("Go ahead"),
        )
        .await?;

        info!("{} Begin data transfer", self.log_prefix);

        let mut data = Vec::new();
        let overflow = read_data_body(
            &mut self.io,
            self.ctx.options.max_message_size,
            self.ctx.endpoint.read_timeout,
            &mut data,
        )
        .await?;

        if overflow {
            warn!(
                "{} Message discarded: larger than {} bytes",
                self.log_prefix, self.ctx.options.max_message_size,
            );
            self.send_response(
                Final,
                pc::ExceededStorageAllocation,
                Cow::Owned(format!(
                    "Maximum message size is {} bytes",
                    self.ctx.options.max_message_size,
                )),
            )
            .await?;
            return Ok(Executed::Rejected);
        }

        self.ctx.transaction.data = data;
        let response = self
            .store
            .save(&self.ctx, &self.ctx.transaction)
            .await
            .into_owned();

        info!(
            "{} Completed data transfer {}",
            self.log_prefix,
            if (response.0 as u16) < 300 {
                "successfully"
            } else {
                "unsuccessfully"
            },
        );

        let SmtpResponse(code, quip) = response;
        self.send_response(Final, code, quip).await?;
        self.ctx.transaction.reset();
        Ok(Executed::Accepted)
    }

    async fn cmd_rset(&mut self) -> Result<Executed, Error> {
        self.ctx.transaction.reset();
        self.send_response(Final, pc::Ok, Cow::Borrowed("Ok")).await?;
        Ok(Executed::Accepted)
    }

    async fn cmd_noop(&mut self) -> Result<Executed, Error> {
        self.send_response(Final, pc::Ok, Cow::Borrowed("Ok")).await?;
        Ok(Executed::Accepted)
    }

    async fn cmd_quit(&mut self) -> Result<Executed, Error> {
        self.send_response(
            Final,
            pc::ServiceClosing,
            Cow::Borrowed("Service closing transmission channel"),
        )
        .await?;
        Ok(Executed::Accepted)
    }

    async fn cmd_dbug(&mut self) -> Result<Executed, Error> {
        debug!(
            "{} DBUG: state={:?} secure={} authenticated={:?} \
             reverse_path={:?} recipients={} properties={:?}",
            self.log_prefix,
            self.state,
            self.ctx.secure,
            self.ctx.authenticated_user,
            self.ctx.transaction.reverse_path,
            self.ctx.transaction.recipients.len(),
            self.ctx.properties,
        );
        self.send_response(Final, pc::Ok, Cow::Borrowed("Ok")).await?;
        Ok(Executed::Accepted)
    }

    async fn cmd_start_tls(&mut self) -> Result<Executed, Error> {
        if self.ctx.secure {
            self.send_response(
                Final,
                pc::BadSequenceOfCommands,
                Cow::Borrowed("Already using TLS"),
            )
            .await?;
            return Ok(Executed::Rejected);
        }

        let endpoint = Arc::clone(&self.ctx.endpoint);
        let Some(acceptor) = endpoint.tls_acceptor.as_deref() else {
            self.send_response(
                Final,
                pc::TlsNotAvailable,
                Cow::Borrowed("TLS not available"),
            )
            .await?;
            return Ok(Executed::Rejected);
        };

        self.send_response(
            Final,
            pc::ServiceReady,
            Cow::Borrowed("Ready to start TLS"),
        )
        .await?;

        info!("{} Start TLS handshake", self.log_prefix);

        tokio::time::timeout(
            TLS_HANDSHAKE_TIMEOUT,
            self.io.get_mut().ssl_accept(acceptor),
        )
        .await
        .map_err(|_| {
            Error::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "TLS handshake timed out",
            ))
        })??;

        info!("{} TLS handshake completed", self.log_prefix);

        // RFC 3207: knowledge obtained from the peer before the handshake
        // must be discarded, and the peer must introduce itself again.
        self.ctx.secure = true;
        self.ctx.helo_host = None;
        self.log_prefix.clear_helo();
        self.ctx.transaction.reset();

        Ok(Executed::Accepted)
    }

    async fn cmd_auth(
        &mut self,
        mechanism: String,
        initial_response: Option<String>,
    ) -> Result<Executed, Error> {
        if self.ctx.authenticated_user.is_some() {
            self.send_response(
                Final,
                pc::BadSequenceOfCommands,
                Cow::Borrowed("Already authenticated"),
            )
            .await?;
            return Ok(Executed::Rejected);
        }

        if self.authenticator.is_none() {
            warn!(
                "{} Rejected attempt to AUTH on an unauthenticated service",
                self.log_prefix,
            );
            self.send_response(
                Final,
                pc::CommandNotImplemented,
                Cow::Borrowed("Authentication is not supported here"),
            )
            .await?;
            return Ok(Executed::Rejected);
        }

        if !self.ctx.secure
            && !self.ctx.endpoint.allow_unsecure_authentication
        {
            warn!(
                "{} Rejected attempt to AUTH without TLS",
                self.log_prefix,
            );
            self.send_response(
                Final,
                pc::EncryptionRequiredForRequestedAuthenticationMechanism,
                Cow::Borrowed("Encryption required for authentication"),
            )
            .await?;
            return Ok(Executed::Rejected);
        }

        if !self
            .ctx
            .options
            .authentication_mechanisms
            .iter()
            .any(|m| m.eq_ignore_ascii_case(&mechanism))
        {
            warn!(
                "{} Rejected attempt to auth with mechanism {:?}",
                self.log_prefix, mechanism,
            );
            self.send_response(
                Final,
                pc::CommandParameterNotImplemented,
                Cow::Borrowed("Unsupported AUTH mechanism"),
            )
            .await?;
            return Ok(Executed::Rejected);
        }

        if mechanism.eq_ignore_ascii_case("PLAIN") {
            self.auth_plain(initial_response).await
        } else if mechanism.eq_ignore_ascii_case("LOGIN") {
            self.auth_login(initial_response).await
        } else {
            // Configured but not something we know how to drive.
            self.send_response(
                Final,
                pc::CommandParameterNotImplemented,
                Cow::Borrowed("Unsupported AUTH mechanism"),
            )
            .await?;
            Ok(Executed::Rejected)
        }
    }

    /// RFC 4616 PLAIN: one base64 blob,
    /// `authorise-id NUL authenticate-id NUL password`, where the
    /// authorise-id is optional if it equals the authenticate-id.
    async fn auth_plain(
        &mut self,
        initial_response: Option<String>,
    ) -> Result<Executed, Error> {
        let data = match initial_response {
            Some(data) if data != "=" => data,
            _ => {
                self.send_response(
                    Final,
                    pc::ServerChallenge,
                    Cow::Borrowed(""),
                )
                .await?;
                self.read_auth_line().await?
            },
        };

        if data == "*" {
            return self.auth_aborted().await;
        }

        if data.is_empty() || data == "=" {
            self.send_response(
                Final,
                pc::ParameterSyntaxError,
                Cow::Borrowed("The empty string is not valid for PLAIN"),
            )
            .await?;
            return Ok(Executed::Rejected);
        }

        let Some(data) = base64::decode(&data)
            .ok()
            .and_then(|d| String::from_utf8(d).ok())
        else {
            self.send_response(
                Final,
                pc::ParameterSyntaxError,
                Cow::Borrowed("Invalid base64"),
            )
            .await?;
            return Ok(Executed::Rejected);
        };

        let mut parts = data.split('\x00');
        let (Some(authorise), Some(authenticate), Some(password), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            self.send_response(
                Final,
                pc::ParameterSyntaxError,
                Cow::Borrowed("Invalid auth syntax"),
            )
            .await?;
            return Ok(Executed::Rejected);
        };

        if !authorise.is_empty() && authorise != authenticate {
            return self
                .auth_failed(Some(SmtpResponse(
                    pc::AuthenticationCredentialsInvalid,
                    Cow::Borrowed("authorise-id must match authenticate-id"),
                )))
                .await;
        }

        let authenticate = authenticate.to_owned();
        let password = password.to_owned();
        self.try_authenticate(&authenticate, &password).await
    }

    /// The LOGIN mechanism: base64 username and password in separate
    /// challenge rounds. Long obsolete, still widely spoken.
    async fn auth_login(
        &mut self,
        initial_response: Option<String>,
    ) -> Result<Executed, Error> {
        let user_b64 = match initial_response {
            Some(data) if data != "=" => data,
            _ => {
                // "Username:"
                self.send_response(
                    Final,
                    pc::ServerChallenge,
                    Cow::Borrowed("VXNlcm5hbWU6"),
                )
                .await?;
                self.read_auth_line().await?
            },
        };
        if user_b64 == "*" {
            return self.auth_aborted().await;
        }

        let Some(user) = base64::decode(&user_b64)
            .ok()
            .and_then(|d| String::from_utf8(d).ok())
        else {
            self.send_response(
                Final,
                pc::ParameterSyntaxError,
                Cow::Borrowed("Invalid base64"),
            )
            .await?;
            return Ok(Executed::Rejected);
        };

        // "Password:"
        self.send_response(
            Final,
            pc::ServerChallenge,
            Cow::Borrowed("UGFzc3dvcmQ6"),
        )
        .await?;
        let password_b64 = self.read_auth_line().await?;
        if password_b64 == "*" {
            return self.auth_aborted().await;
        }

        let Some(password) = base64::decode(&password_b64)
            .ok()
            .and_then(|d| String::from_utf8(d).ok())
        else {
            self.send_response(
                Final,
                pc::ParameterSyntaxError,
                Cow::Borrowed("Invalid base64"),
            )
            .await?;
            return Ok(Executed::Rejected);
        };

        self.try_authenticate(&user, &password).await
    }

    async fn try_authenticate(
        &mut self,
        user: &str,
        password: &str,
    ) -> Result<Executed, Error> {
        let verdict = self
            .authenticator
            .as_mut()
            .expect("checked in cmd_auth")
            .authenticate(&self.ctx, user, password)
            .await;

        match verdict {
            FilterResult::Yes => {
                self.ctx.authenticated_user = Some(user.to_owned());
                self.ctx.authentication_attempts = 0;
                self.log_prefix.set_user(user.to_owned());
                info!("{} Authenticated", self.log_prefix);
                self.send_response(
                    Final,
                    pc::AuthenticationSucceeded,
                    Cow::Borrowed("Ok"),
                )
                .await?;
                Ok(Executed::Accepted)
            },
            FilterResult::NoTemporarily(response)
            | FilterResult::NoPermanently(response) => {
                self.auth_failed(response).await
            },
        }
    }

    async fn auth_aborted(&mut self) -> Result<Executed, Error> {
        self.send_response(
            Final,
            pc::ParameterSyntaxError,
            Cow::Borrowed("SASL aborted"),
        )
        .await?;
        Ok(Executed::Rejected)
    }

    async fn auth_failed(
        &mut self,
        response: Option<SmtpResponse<'static>>,
    ) -> Result<Executed, Error> {
        self.ctx.authentication_attempts += 1;
        warn!(
            "{} Authentication failed (attempt {})",
            self.log_prefix, self.ctx.authentication_attempts,
        );

        let SmtpResponse(code, quip) = response.unwrap_or(SmtpResponse(
            pc::AuthenticationCredentialsInvalid,
            Cow::Borrowed("Authentication credentials invalid"),
        ));
        self.send_response(Final, code, quip).await?;

        if self.ctx.authentication_attempts
            > self.ctx.options.max_authentication_attempts
        {
            warn!(
                "{} Terminating session after too many failed \
                 authentication attempts",
                self.log_prefix,
            );
            self.quit = true;
        }

        Ok(Executed::Rejected)
    }

    /// Reads one line of an authentication exchange.
    async fn read_auth_line(&mut self) -> Result<String, Error> {
        let mut buffer = Vec::new();
        tokio::time::timeout(
            self.ctx.endpoint.read_timeout,
            (&mut self.io)
                .take(MAX_LINE as u64)
                .read_until(b'\n', &mut buffer),
        )
        .await
        .map_err(|_| {
            Error::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "Timed out waiting for authentication data",
            ))
        })??;

        if buffer.is_empty() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "EOF reached in authentication exchange",
            )));
        }

        if !buffer.ends_with(b"\n") {
            self.send_response(
                Final,
                pc::CommandSyntaxError,
                Cow::Borrowed("Line too long"),
            )
            .await?;
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::Other,
                "Authentication line too long",
            )));
        }

        let _ = buffer.pop();
        if Some(&b'\r') == buffer.last() {
            let _ = buffer.pop();
        }

        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    /// Writes a filter refusal: the override response if the filter gave
    /// one, otherwise the stock code and text.
    async fn send_refusal(
        &mut self,
        response: Option<SmtpResponse<'static>>,
        code: PrimaryCode,
        quip: &'static str,
    ) -> Result<(), Error> {
        let SmtpResponse(code, quip) =
            response.unwrap_or(SmtpResponse(code, Cow::Borrowed(quip)));
        self.send_response(Final, code, quip).await
    }

    /// Records a failed command, sending `code quip` as its response, or
    /// `421` instead if the failure exhausted the retry budget.
    async fn command_failed(
        &mut self,
        code: PrimaryCode,
        quip: Cow<'_, str>,
    ) -> Result<(), Error> {
        self.ctx.retry_count += 1;
        if self.ctx.retry_count > self.ctx.options.max_retry_count {
            warn!(
                "{} Terminating session after too many failed commands",
                self.log_prefix,
            );
            self.send_response(
                Final,
                pc::ServiceNotAvailableClosing,
                Cow::Borrowed("Too many bad commands"),
            )
            .await
        } else {
            self.send_response(Final, code, quip).await
        }
    }

    /// As `command_failed`, for failures whose response has already been
    /// written (command executes).
    async fn note_failure(&mut self) -> Result<(), Error> {
        self.ctx.retry_count += 1;
        if self.ctx.retry_count > self.ctx.options.max_retry_count {
            warn!(
                "{} Terminating session after too many failed commands",
                self.log_prefix,
            );
            self.send_response(
                Final,
                pc::ServiceNotAvailableClosing,
                Cow::Borrowed("Too many bad commands"),
            )
            .await?;
        }
        Ok(())
    }

    async fn send_greeting(&mut self) -> Result<(), Error> {
        self.send_response(
            Final,
            pc::ServiceReady,
            Cow::Owned(format!(
                "{} ESMTP ready",
                self.ctx.options.server_name,
            )),
        )
        .await
    }

    async fn send_response(
        &mut self,
        kind: ResponseKind,
        primary_code: PrimaryCode,
        quip: Cow<'_, str>,
    ) -> Result<(), Error> {
        use std::fmt::Write as _;

        if SmtpResponse(primary_code, Cow::Borrowed("")).closes_session() {
            self.quit = true;
        }

        let mut s = String::new();
        let _ = write!(s, "{}{}", primary_code as u16, kind.indicator());
        let _ = write!(s, "{}\r\n", quip);

        self.io.write_all(s.as_bytes()).await?;
        match kind {
            Final => self.io.flush().await?,
            Delayable => (),
        }

        Ok(())
    }
}

fn truncate(line: &str) -> &str {
    match line.char_indices().nth(64) {
        Some((ix, _)) => &line[..ix],
        None => line,
    }
}

/// Reads a dot-stuffed DATA body from `src` into `dst`, consuming up to and
/// including the line with just `.`.
///
/// The body is handled strictly in terms of CRLF lines so that binary
/// content is preserved exactly; a lone LF is message content, not a line
/// ending. When `limit` is non-zero and the decoded body exceeds it, the
/// remainder is still consumed so the protocol stays in sync, `dst` is
/// emptied, and `true` is returned.
async fn read_data_body(
    src: &mut (impl AsyncBufRead + Unpin),
    limit: u64,
    read_timeout: Duration,
    dst: &mut Vec<u8>,
) -> io::Result<bool> {
    // Whether the next read is reading from the start of the line; i.e.,
    // true at the beginning of text and after each CRLF.
    let mut start_of_line = true;
    // Whether the last read ended with CR. This means that if the next read
    // is just \n, we still treat it as a line ending.
    let mut has_trailing_cr = false;

    let mut stored = 0u64;
    let mut overflow = false;
    let mut buffer = Vec::new();

    loop {
        buffer.clear();
        tokio::time::timeout(
            read_timeout,
            src.read_until(b'\n', &mut buffer),
        )
        .await
        .map_err(|_| {
            io::Error::new(
                io::ErrorKind::TimedOut,
                "Timed out reading DATA body",
            )
        })??;

        if buffer.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "EOF encountered in DATA payload",
            ));
        }

        if b".\r\n" == &buffer[..] && start_of_line {
            // End of content
            break;
        }

        // Else, everything inside buffer is content, except possibly a
        // stuffed leading '.'.
        let contents = if b'.' == buffer[0] && start_of_line {
            &buffer[1..]
        } else {
            &buffer[..]
        };

        stored += contents.len() as u64;
        if limit > 0 && stored > limit && !overflow {
            overflow = true;
            dst.clear();
        }
        if !overflow {
            dst.extend_from_slice(contents);
        }

        start_of_line = buffer.ends_with(b"\r\n")
            || (b"\n" == &buffer[..] && has_trailing_cr);
        has_trailing_cr = buffer.ends_with(b"\r");
    }

    Ok(overflow)
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    fn read_data_body_sync(
        stuffed: &[u8],
        buffer_size: usize,
        limit: u64,
    ) -> (Vec<u8>, bool) {
        let mut decoded = Vec::<u8>::new();
        let mut reader =
            tokio::io::BufReader::with_capacity(buffer_size, stuffed);
        let overflow = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap()
            .block_on(read_data_body(
                &mut reader,
                limit,
                Duration::from_secs(60),
                &mut decoded,
            ))
            .unwrap();

        (decoded, overflow)
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 1024,
            ..ProptestConfig::default()
        })]

        #[test]
        fn dot_stuffing_decodes_properly(
            content in "[x.\r\n]{0,100}\r\n",
            buffer_size in 1usize..=32,
        ) {
            let mut stuffed = content.replace("\r\n.", "\r\n..");
            if stuffed.starts_with(".") {
                stuffed = format!(".{}", stuffed);
            }
            stuffed.push_str(".\r\n");

            let (decoded, overflow) =
                read_data_body_sync(stuffed.as_bytes(), buffer_size, 0);

            prop_assert!(!overflow);
            prop_assert_eq!(
                content,
                str::from_utf8(&decoded).unwrap(),
            );
        }
    }

    #[test]
    fn dot_stuffing_edge_cases() {
        // A lone LF is content, not a line ending; ".\n" after it does not
        // end the body.
        let (decoded, _) =
            read_data_body_sync(b"foo\n.\nbar\r\n.\r\n", 64, 0);
        assert_eq!(b"foo\n.\nbar\r\n".to_vec(), decoded);

        // A stuffed dot at the very start
        let (decoded, _) = read_data_body_sync(b"..\r\n.\r\n", 64, 0);
        assert_eq!(b".\r\n".to_vec(), decoded);

        // Empty body
        let (decoded, _) = read_data_body_sync(b".\r\n", 64, 0);
        assert_eq!(Vec::<u8>::new(), decoded);
    }

    #[test]
    fn data_body_eof_is_an_error() {
        let mut decoded = Vec::<u8>::new();
        let mut reader =
            tokio::io::BufReader::new(&b"unterminated\r\n"[..]);
        let result = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap()
            .block_on(read_data_body(
                &mut reader,
                0,
                Duration::from_secs(60),
                &mut decoded,
            ));
        assert!(matches!(
            result,
            Err(ref e) if io::ErrorKind::UnexpectedEof == e.kind(),
        ));
    }

    #[test]
    fn data_body_size_limit() {
        // "12345\r\n" is exactly 7 decoded octets
        let (decoded, overflow) =
            read_data_body_sync(b"12345\r\n.\r\n", 64, 7);
        assert!(!overflow);
        assert_eq!(b"12345\r\n".to_vec(), decoded);

        // One octet over: body is drained, flagged, and discarded
        let (decoded, overflow) =
            read_data_body_sync(b"123456\r\n.\r\n", 64, 7);
        assert!(overflow);
        assert!(decoded.is_empty());

        // The limit counts decoded bytes, not stuffed ones
        let (decoded, overflow) = read_data_body_sync(b"..2345\r\n.\r\n", 64, 7);
        assert!(!overflow);
        assert_eq!(b".2345\r\n".to_vec(), decoded);
    }
}
