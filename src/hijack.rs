//! Connection hijack handshake.
//!
//! Hijacking hands the raw connection transport to the application and
//! tells the server layer to stop framing requests and responses on it.
//! Instead of an opaque closure mutating the environment from the outside,
//! the handshake is an explicit state machine shared between the
//! [`Environment`] and the `rack.hijack` callable it exposes:
//!
//! ```text
//! Armed(transport) --fire--> Fired(transport) --drain--> Drained
//! ```
//!
//! `fire` is what the application-visible callable does; `drain` moves the
//! transport into the environment as `rack.hijack_io` on first lookup.
//! Every transition past `Armed` is terminal for the request.
//!
//! [`Environment`]: crate::Environment

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::AlreadyHijacked;
use crate::io::Transport;

#[derive(Debug)]
enum HijackState {
    Armed(Transport),
    Fired(Transport),
    Drained,
}

#[derive(Debug)]
pub(crate) struct HijackCell {
    state: Mutex<HijackState>,
}

impl HijackCell {
    pub(crate) fn new(transport: Transport) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(HijackState::Armed(transport)),
        })
    }

    pub(crate) fn fire(&self) -> Result<(), AlreadyHijacked> {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, HijackState::Drained) {
            HijackState::Armed(transport) => {
                *state = HijackState::Fired(transport);
                tracing::debug!("rack env: connection hijacked by application");
                Ok(())
            }
            HijackState::Fired(transport) => {
                *state = HijackState::Fired(transport);
                Err(AlreadyHijacked)
            }
            HijackState::Drained => Err(AlreadyHijacked),
        }
    }

    pub(crate) fn drain(&self) -> Option<Transport> {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, HijackState::Drained) {
            HijackState::Fired(transport) => Some(transport),
            HijackState::Armed(transport) => {
                *state = HijackState::Armed(transport);
                None
            }
            HijackState::Drained => None,
        }
    }

    /// True once `fire` succeeded, whether or not the transport
    /// was already drained into the environment.
    pub(crate) fn is_hijacked(&self) -> bool {
        !matches!(&*self.state.lock(), HijackState::Armed(_))
    }

    /// True while a fired transport is still waiting to be drained.
    pub(crate) fn pending_io(&self) -> bool {
        matches!(&*self.state.lock(), HijackState::Fired(_))
    }
}

/// The zero-argument `rack.hijack` callable.
///
/// Invoking it claims the raw transport for the application: the
/// environment's `rack.hijack_io` entry becomes available and the server
/// layer must not write a framed response for this request anymore.
#[derive(Debug, Clone)]
pub struct HijackProc {
    cell: Arc<HijackCell>,
}

impl HijackProc {
    pub(crate) fn new(cell: Arc<HijackCell>) -> Self {
        Self { cell }
    }

    /// Fire the hijack.
    ///
    /// Returns [`AlreadyHijacked`] on every invocation after the first.
    pub fn call(&self) -> Result<(), AlreadyHijacked> {
        self.cell.fire()
    }
}

impl fmt::Display for HijackProc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("rack.hijack")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn armed_cell() -> Arc<HijackCell> {
        let (near, _far) = tokio::io::duplex(8);
        HijackCell::new(Transport::new(near))
    }

    #[test]
    fn fire_is_one_shot() {
        let cell = armed_cell();
        let proc_ = HijackProc::new(cell.clone());

        assert!(!cell.is_hijacked());
        assert_eq!(proc_.call(), Ok(()));
        assert!(cell.is_hijacked());
        assert_eq!(proc_.call(), Err(AlreadyHijacked));
    }

    #[test]
    fn drain_yields_the_transport_exactly_once() {
        let cell = armed_cell();

        // not fired yet, nothing to drain
        assert!(cell.drain().is_none());
        assert!(!cell.is_hijacked());

        cell.fire().unwrap();
        assert!(cell.pending_io());
        assert!(cell.drain().is_some());
        assert!(cell.drain().is_none());
        assert!(cell.is_hijacked());
        assert!(!cell.pending_io());
    }
}
