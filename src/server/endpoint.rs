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

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{error, warn};
use openssl::ssl::SslAcceptor;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::options::ServerOptions;
use crate::smtp::session::Session;

/// One listening address and the transport policy applied to connections
/// accepted on it.
///
/// Certificate loading is the caller's concern: an endpoint that should
/// speak TLS (implicitly or via `STARTTLS`) carries a fully-configured
/// [`SslAcceptor`], which also embodies the permitted protocol versions and
/// cipher suites.
pub struct Endpoint {
    pub address: SocketAddr,
    /// Bounds each individual read during DATA transfers, authentication
    /// exchanges, and PROXY header consumption.
    pub read_timeout: Duration,
    /// Whether connections are TLS from the first byte (implicit TLS, as on
    /// port 465) rather than upgraded via `STARTTLS`.
    pub is_secure: bool,
    pub tls_acceptor: Option<Arc<SslAcceptor>>,
    /// Whether `AUTH` may be used before the transport is secured. Leave
    /// this off anywhere credentials could cross a real network.
    pub allow_unsecure_authentication: bool,
    /// Whether connections arrive through a proxy that prefixes them with a
    /// PROXY protocol v1 header. The header is mandatory when this is set;
    /// PROXY v1 gives the server no way to sniff for it reliably.
    pub expect_proxy_header: bool,
}

impl Endpoint {
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            read_timeout: Duration::from_secs(120),
            is_secure: false,
            tls_acceptor: None,
            allow_unsecure_authentication: false,
            expect_proxy_header: false,
        }
    }

    pub fn read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// Offers `STARTTLS` with the given acceptor.
    pub fn tls(mut self, acceptor: Arc<SslAcceptor>) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    /// Speaks TLS from the first byte with the given acceptor.
    pub fn implicit_tls(mut self, acceptor: Arc<SslAcceptor>) -> Self {
        self.is_secure = true;
        self.tls_acceptor = Some(acceptor);
        self
    }

    pub fn allow_unsecure_authentication(mut self, allow: bool) -> Self {
        self.allow_unsecure_authentication = allow;
        self
    }

    pub fn expect_proxy_header(mut self, expect: bool) -> Self {
        self.expect_proxy_header = expect;
        self
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("address", &self.address)
            .field("read_timeout", &self.read_timeout)
            .field("is_secure", &self.is_secure)
            .field("tls", &self.tls_acceptor.is_some())
            .field(
                "allow_unsecure_authentication",
                &self.allow_unsecure_authentication,
            )
            .field("expect_proxy_header", &self.expect_proxy_header)
            .finish()
    }
}

/// Accepts connections on `listener` until the server shuts down, then
/// drains the sessions it spawned.
///
/// Accept errors are transient on any loaded system (file descriptor
/// exhaustion, aborted handshakes); they are logged and retried after a
/// short pause rather than taking the endpoint down.
pub(crate) async fn serve_endpoint(
    listener: TcpListener,
    endpoint: Arc<Endpoint>,
    options: Arc<ServerOptions>,
    shutdown: CancellationToken,
) {
    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,

            Some(_) = sessions.join_next(), if !sessions.is_empty() => {},

            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    // The session drives the socket through the reactor
                    // itself so that it can hand the raw stream to OpenSSL
                    // mid-session.
                    let socket = match socket.into_std() {
                        Ok(socket) => socket,
                        Err(e) => {
                            error!(
                                "Failed to detach accepted socket from {}: {}",
                                peer, e,
                            );
                            continue;
                        },
                    };

                    match Session::new(
                        socket,
                        peer,
                        Arc::clone(&endpoint),
                        Arc::clone(&options),
                        shutdown.clone(),
                    ) {
                        Ok(session) => {
                            sessions.spawn(session.run());
                        },
                        Err(e) => {
                            error!("Failed to set up session for {}: {}", peer, e);
                        },
                    }
                },

                Err(e) => {
                    warn!("Accept failed on {}: {}", endpoint.address, e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                },
            },
        }
    }

    // Stop accepting before waiting out the sessions, which will each
    // notice the cancellation and wind down.
    drop(listener);
    while sessions.join_next().await.is_some() {}

    options.events.endpoint_stopped(&endpoint);
}
