use tokio::sync::mpsc;

use crate::{
    engine::EngineEvent,
    event::Event,
    lookup::LookupResult,
    socket::Socket,
};

/// Drives a [`Socket`] from tokio channels
///
/// Lookup results come from a [`TokioLookup`](crate::TokioLookup) and engine events from
/// whatever channel the engine reports on. Both are fed into the socket as they arrive, and the
/// resulting notifications are handed out one at a time by [`next_event`](Self::next_event).
#[derive(Debug)]
pub struct Driver {
    socket: Socket,
    lookups: mpsc::UnboundedReceiver<LookupResult>,
    events: mpsc::UnboundedReceiver<EngineEvent>,
}

impl Driver {
    /// Wrap a socket together with the channels its collaborators report on
    pub fn new(
        socket: Socket,
        lookups: mpsc::UnboundedReceiver<LookupResult>,
        events: mpsc::UnboundedReceiver<EngineEvent>,
    ) -> Self {
        Self {
            socket,
            lookups,
            events,
        }
    }

    /// The driven socket
    pub fn socket(&mut self) -> &mut Socket {
        &mut self.socket
    }

    /// Stop driving and return the socket
    pub fn into_socket(self) -> Socket {
        self.socket
    }

    /// Wait for the next notification
    ///
    /// Returns `None` once the socket has been destroyed and everything it queued has been
    /// handed out, when an unreferenced socket has nothing left to do, or when both channels are
    /// closed.
    pub async fn next_event(&mut self) -> Option<Event> {
        loop {
            if let Some(event) = self.socket.poll() {
                return Some(event);
            }
            if self.socket.is_finished() || (!self.socket.is_ref() && self.socket.is_idle()) {
                return None;
            }
            tokio::select! {
                Some(lookup) = self.lookups.recv() => {
                    self.socket.handle_lookup(lookup.token, lookup.result);
                }
                Some(event) = self.events.recv() => self.socket.handle_event(event),
                else => return None,
            }
        }
    }
}
