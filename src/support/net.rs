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

use std::io;
use std::net::{SocketAddr, TcpStream};
use std::pin::Pin;
use std::sync::Arc;
use std::task;

use openssl::ssl::{
    ErrorCode, HandshakeError, MidHandshakeSslStream, ShutdownResult,
    SslAcceptor, SslStream,
};
use tokio::io::{
    unix::{AsyncFd, AsyncFdReadyGuard},
    AsyncRead, AsyncWrite, ReadBuf,
};

use crate::support::error::Error;

/// The transport for one server connection.
///
/// This fulfils two roles:
/// - Supporting switching from cleartext to TLS mid-stream, as `STARTTLS`
///   requires, without giving up ownership of the socket.
/// - Bridging OpenSSL's synchronous stream model onto Tokio's readiness
///   model.
///
/// The session owns the stream exclusively and the protocol strictly
/// serialises reads and writes, so unlike a full-duplex transport there is
/// no need for separately usable read and write halves.
pub struct SmtpStream {
    socket: Arc<AsyncFd<TcpStream>>,
    mode: Mode,
}

enum Mode {
    Cleartext(SocketRw),
    Ssl(SslStream<SocketRw>),
}

impl SmtpStream {
    /// Wraps an accepted socket.
    ///
    /// The socket is put into non-blocking mode and registered with the
    /// Tokio reactor; it is closed when the stream is dropped.
    pub fn new(socket: TcpStream) -> io::Result<Self> {
        socket.set_nonblocking(true)?;
        let socket = Arc::new(AsyncFd::with_interest(
            socket,
            tokio::io::Interest::READABLE | tokio::io::Interest::WRITABLE,
        )?);

        Ok(Self {
            mode: Mode::Cleartext(SocketRw(Arc::clone(&socket))),
            socket,
        })
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.socket.get_ref().peer_addr()
    }

    pub fn is_secure(&self) -> bool {
        matches!(self.mode, Mode::Ssl(_))
    }

    /// Describes the negotiated TLS session, if any, as
    /// `version:cipher:strength`.
    pub fn ssl_string(&self) -> Option<String> {
        match self.mode {
            Mode::Cleartext(..) => None,
            Mode::Ssl(ref stream) => {
                let ssl = stream.ssl();
                let cipher = ssl.current_cipher();
                Some(format!(
                    "{tls_version}:{cipher}:{strength}",
                    tls_version = ssl.version_str(),
                    cipher = cipher.map_or("NONE", |c| c.name()),
                    strength = cipher.map_or(0, |c| c.bits().algorithm),
                ))
            },
        }
    }

    /// Performs server-side TLS setup with the given acceptor, in place.
    ///
    /// On success, all further reads and writes go through the TLS session.
    /// On failure the stream is unusable and must be dropped.
    pub async fn ssl_accept(
        &mut self,
        acceptor: &SslAcceptor,
    ) -> Result<(), Error> {
        let socket = Arc::clone(&self.socket);
        let mut result = acceptor.accept(SocketRw(Arc::clone(&socket)));

        // The workflow around the ready guards is awkward because there's no
        // way to tell Tokio "I just saw that it's not ready, block until
        // it's ready again"; there's also no way to know which operation we
        // need without running through one pass of the OpenSSL
        // implementation. Instead, we get the guard when Tokio thinks the
        // operation is ready (but we know it probably isn't, because OpenSSL
        // just told us, but because of the await point it may have become
        // actually ready) and then need to do another round of the loop to
        // test whether it's still blocked. Then, once we do get another
        // WANT_READ/WANT_WRITE while holding the guard, we can finally tell
        // Tokio that it's not ready and drop the guard.
        let mut read_guard = None::<AsyncFdReadyGuard<'_, TcpStream>>;
        let mut write_guard = None::<AsyncFdReadyGuard<'_, TcpStream>>;

        loop {
            match result {
                Ok(stream) => {
                    self.mode = Mode::Ssl(stream);
                    return Ok(());
                },

                Err(HandshakeError::SetupFailure(e)) => {
                    return Err(e.into());
                },

                Err(HandshakeError::Failure(mhss)) => {
                    return Err(mhss_to_error(mhss));
                },

                Err(HandshakeError::WouldBlock(mhss)) => {
                    match mhss.error().code() {
                        ErrorCode::WANT_READ => {
                            if let Some(mut read_guard) = read_guard.take() {
                                read_guard.clear_ready();
                            }

                            read_guard = Some(socket.readable().await?);
                            result = mhss.handshake();
                        },

                        ErrorCode::WANT_WRITE => {
                            if let Some(mut write_guard) = write_guard.take() {
                                write_guard.clear_ready();
                            }

                            write_guard = Some(socket.writable().await?);
                            result = mhss.handshake();
                        },

                        _ => return Err(mhss_to_error(mhss)),
                    }
                },
            }
        }
    }
}

/// Called when an error is returned from `ssl_read` or `ssl_write`.
///
/// The main purpose of this function is to handle the cases where OpenSSL
/// returns `WANT_READ` or `WANT_WRITE`: it arranges a readiness check for
/// the socket and clears its readiness status if currently set. Because of
/// this, it is critical that this *only* be called immediately after
/// `ssl_read` or `ssl_write`, with no await points in between, so that we
/// can be certain that there is absolutely no data on the socket.
fn on_rw_ssl_error(
    socket: &AsyncFd<TcpStream>,
    ctx: &mut task::Context<'_>,
    e: openssl::ssl::Error,
) -> task::Poll<io::Result<()>> {
    match e.code() {
        ErrorCode::WANT_READ => {
            futures::ready!(socket.poll_read_ready(ctx))?.clear_ready();
            // Call again to get Tokio to actually watch for more changes.
            futures::ready!(socket.poll_read_ready(ctx))?.retain_ready();
            // If we get here, the socket has somehow become ready meanwhile.
            task::Poll::Ready(Ok(()))
        },

        ErrorCode::WANT_WRITE => {
            futures::ready!(socket.poll_write_ready(ctx))?.clear_ready();
            // Call again to get Tokio to actually watch for more changes.
            futures::ready!(socket.poll_write_ready(ctx))?.retain_ready();
            // If we get here, the socket has somehow become ready meanwhile.
            task::Poll::Ready(Ok(()))
        },

        // As can be seen in the `fmt::Display` implementation of
        // `openssl::ssl::Error`, EOF is represented by the SYSCALL error
        // code with no associated IO error, and into_io_error() doesn't
        // bother to translate that.
        ErrorCode::SYSCALL => task::Poll::Ready(Err(e
            .into_io_error()
            .unwrap_or_else(|_| io::ErrorKind::UnexpectedEof.into()))),

        _ => task::Poll::Ready(Err(e
            .into_io_error()
            .unwrap_or_else(|e| io::Error::new(io::ErrorKind::Other, e)))),
    }
}

impl AsyncRead for SmtpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> task::Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.mode {
            Mode::Cleartext(ref mut s) => Pin::new(s).poll_read(ctx, buf),
            Mode::Ssl(ref mut ssl) => loop {
                match ssl.ssl_read(buf.initialize_unfilled()) {
                    Ok(n) => {
                        buf.advance(n);
                        return task::Poll::Ready(Ok(()));
                    },

                    Err(e) => {
                        futures::ready!(on_rw_ssl_error(&this.socket, ctx, e))?
                    },
                }
            },
        }
    }
}

impl AsyncWrite for SmtpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &[u8],
    ) -> task::Poll<io::Result<usize>> {
        let this = self.get_mut();
        match this.mode {
            Mode::Cleartext(ref mut s) => Pin::new(s).poll_write(ctx, buf),
            Mode::Ssl(ref mut ssl) => loop {
                match ssl.ssl_write(buf) {
                    Ok(n) => return task::Poll::Ready(Ok(n)),
                    Err(e) => {
                        futures::ready!(on_rw_ssl_error(&this.socket, ctx, e))?
                    },
                }
            },
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        _ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        // OpenSSL doesn't buffer anything itself (i.e. SslStream::flush()
        // just delegates to the underlying writer without invoking OpenSSL)
        // and we also have no buffers, so there's nothing to do.
        task::Poll::Ready(Ok(()))
    }

    /// If there is an SSL session, the session is shut down, returning the
    /// socket to cleartext.
    ///
    /// During the shutdown process, other reads and writes are not
    /// well-defined.
    fn poll_shutdown(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        let this = self.get_mut();
        let done = if let Mode::Ssl(ref mut ssl) = this.mode {
            loop {
                match ssl.shutdown() {
                    Ok(ShutdownResult::Received) => break,
                    Ok(ShutdownResult::Sent) => {
                        return task::Poll::Pending;
                    },

                    Err(e) => {
                        futures::ready!(on_rw_ssl_error(&this.socket, ctx, e))?
                    },
                }
            }

            true
        } else {
            false
        };

        if done {
            this.mode = Mode::Cleartext(SocketRw(Arc::clone(&this.socket)));
        }

        task::Poll::Ready(Ok(()))
    }
}

/// Implements both the synchronous and asynchronous read and write traits
/// atop the shared non-blocking socket.
///
/// The synchronous implementations are what OpenSSL drives; they surface
/// `WouldBlock`, which the handshake pump and `on_rw_ssl_error` translate
/// back into reactor readiness waits.
struct SocketRw(Arc<AsyncFd<TcpStream>>);

fn read_socket(socket: &TcpStream, buf: &mut [u8]) -> io::Result<usize> {
    let mut socket = socket;
    io::Read::read(&mut socket, buf)
}

fn write_socket(socket: &TcpStream, buf: &[u8]) -> io::Result<usize> {
    let mut socket = socket;
    io::Write::write(&mut socket, buf)
}

impl io::Read for SocketRw {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        read_socket(self.0.get_ref(), dst)
    }
}

impl io::Write for SocketRw {
    fn write(&mut self, src: &[u8]) -> io::Result<usize> {
        write_socket(self.0.get_ref(), src)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsyncRead for SocketRw {
    fn poll_read(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> task::Poll<io::Result<()>> {
        loop {
            let mut guard = futures::ready!(self.0.poll_read_ready(ctx))?;

            match guard.try_io(|fd| {
                read_socket(fd.get_ref(), buf.initialize_unfilled())
            }) {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return task::Poll::Ready(Ok(()));
                },

                Ok(Err(e)) => return task::Poll::Ready(Err(e)),

                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for SocketRw {
    fn poll_write(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &[u8],
    ) -> task::Poll<io::Result<usize>> {
        loop {
            let mut guard = futures::ready!(self.0.poll_write_ready(ctx))?;

            if let Ok(result) =
                guard.try_io(|fd| write_socket(fd.get_ref(), buf))
            {
                return task::Poll::Ready(result);
            }
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        _ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        _ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        let _ = self.0.get_ref().shutdown(std::net::Shutdown::Write);
        task::Poll::Ready(Ok(()))
    }
}

fn mhss_to_error(mhss: MidHandshakeSslStream<SocketRw>) -> Error {
    let e = mhss.into_error();
    if let Some(es) = e.ssl_error() {
        Error::Ssl(es.clone())
    } else {
        match e.into_io_error() {
            Ok(io) => Error::Io(io),
            Err(e) if e.code() == ErrorCode::SYSCALL => {
                Error::Io(io::ErrorKind::UnexpectedEof.into())
            },
            Err(e) => Error::Io(io::Error::new(io::ErrorKind::Other, e)),
        }
    }
}
