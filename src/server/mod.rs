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

//! Server assembly: binding endpoints, spawning sessions, shutting down.

mod endpoint;
mod events;
mod options;

pub use self::endpoint::Endpoint;
pub use self::events::{NullEvents, ServerEvents};
pub use self::options::{ServerOptions, ServerOptionsBuilder};

use std::sync::Arc;

use log::{error, info};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::support::error::Error;

/// The server: a set of endpoint accept loops sharing one configuration and
/// one shutdown signal.
pub struct SmtpServer {
    options: Arc<ServerOptions>,
    shutdown: CancellationToken,
}

/// Requests a graceful stop of the server it was obtained from.
///
/// Cloneable and cheap; hand it to whatever owns process lifetime.
#[derive(Clone)]
pub struct ShutdownHandle(CancellationToken);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.0.cancel();
    }
}

impl SmtpServer {
    pub fn new(options: ServerOptions) -> Self {
        Self {
            options: Arc::new(options),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown.clone())
    }

    /// Binds every endpoint and serves until shut down.
    ///
    /// A bind failure is fatal and reported immediately. Once running, the
    /// call returns only after a [`ShutdownHandle::shutdown`]: the accept
    /// loops unbind, in-flight sessions abort their current read or write,
    /// and the shutdown is then surfaced as [`Error::Cancelled`].
    pub async fn serve(self) -> Result<(), Error> {
        let mut listeners = Vec::new();
        for endpoint in &self.options.endpoints {
            let listener = TcpListener::bind(endpoint.address).await?;
            let local = listener.local_addr()?;
            info!("Listening on {}", local);
            self.options.events.endpoint_started(endpoint, local);
            listeners.push((listener, Arc::clone(endpoint)));
        }

        let mut accept_tasks = JoinSet::new();
        for (listener, endpoint) in listeners {
            accept_tasks.spawn(endpoint::serve_endpoint(
                listener,
                endpoint,
                Arc::clone(&self.options),
                self.shutdown.clone(),
            ));
        }

        while let Some(result) = accept_tasks.join_next().await {
            if let Err(e) = result {
                error!("Accept task failed: {}", e);
            }
        }

        if self.shutdown.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}
