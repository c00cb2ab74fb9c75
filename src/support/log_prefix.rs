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
use std::sync::{Arc, Mutex};

/// Tracks text that should be included at the start of every log statement
/// for one session.
///
/// Clones of a `LogPrefix` share the same underlying data, so the peer name
/// recorded by a PROXY header or the host name recorded by HELO become
/// visible to every holder at once.
#[derive(Clone)]
pub struct LogPrefix {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Clone)]
struct Inner {
    peer: String,
    helo: Option<String>,
    user: Option<String>,
}

impl LogPrefix {
    pub fn new(peer: String) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                peer,
                helo: None,
                user: None,
            })),
        }
    }

    /// Replaces the peer name, as when a PROXY header declares the real
    /// client address.
    pub fn set_peer(&self, peer: String) {
        self.inner.lock().unwrap().peer = peer;
    }

    pub fn set_helo(&self, helo: String) {
        self.inner.lock().unwrap().helo = Some(helo);
    }

    pub fn clear_helo(&self) {
        self.inner.lock().unwrap().helo = None;
    }

    pub fn set_user(&self, user: String) {
        self.inner.lock().unwrap().user = Some(user);
    }
}

impl fmt::Display for LogPrefix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        write!(f, "smtp:{}", inner.peer)?;
        if inner.helo.is_some() || inner.user.is_some() {
            write!(f, "[{}", inner.helo.as_deref().unwrap_or("<no-helo>"))?;
            if let Some(ref user) = inner.user {
                write!(f, " {}", user)?;
            }
            write!(f, "]")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn prefix_formatting() {
        let prefix = LogPrefix::new("192.0.2.1:25252".to_owned());
        assert_eq!("smtp:192.0.2.1:25252", prefix.to_string());

        prefix.set_helo("mail.irk.com".to_owned());
        assert_eq!("smtp:192.0.2.1:25252[mail.irk.com]", prefix.to_string());

        prefix.set_user("zim".to_owned());
        assert_eq!(
            "smtp:192.0.2.1:25252[mail.irk.com zim]",
            prefix.to_string(),
        );

        prefix.clear_helo();
        assert_eq!("smtp:192.0.2.1:25252[<no-helo> zim]", prefix.to_string());
    }
}
