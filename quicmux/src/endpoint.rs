use std::{
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
};

use socket2::{Domain, Protocol, Type};
use tracing::{debug, trace};

use crate::{
    config::EndpointConfig,
    error::Error,
    event::Task,
    lookup::LookupToken,
    socket::{LookupPurpose, Socket},
    EndpointHandle,
};

/// Lifecycle of an endpoint
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EndpointState {
    /// Waiting for the socket to need it
    Unbound,
    /// Resolving its address or binding
    Pending,
    /// Sending and receiving through the engine
    Bound,
    /// Closed or closing
    Destroyed,
}

#[derive(Debug)]
pub(crate) struct EndpointInner {
    pub(crate) config: EndpointConfig,
    pub(crate) state: EndpointState,
    lookup: Option<LookupToken>,
    /// Our handle on the OS socket, used for socket options; the engine holds a duplicate
    socket: Option<socket2::Socket>,
    local_addr: Option<SocketAddr>,
    /// Whether the engine knows about this endpoint
    pub(crate) attached: bool,
    pub(crate) error: Option<Error>,
}

impl EndpointInner {
    pub(crate) fn new(config: EndpointConfig) -> Self {
        Self {
            config,
            state: EndpointState::Unbound,
            lookup: None,
            socket: None,
            local_addr: None,
            attached: false,
            error: None,
        }
    }
}

impl Socket {
    /// Access an endpoint
    pub fn endpoint(&mut self, handle: EndpointHandle) -> Endpoint<'_> {
        Endpoint {
            socket: self,
            handle,
        }
    }

    /// Start resolving an endpoint's address
    ///
    /// Only the first call for an endpoint does anything; the lookup it issues is shared by every
    /// later request to bind.
    pub(crate) fn bind_endpoint(&mut self, handle: EndpointHandle) -> Result<(), Error> {
        match self.endpoints.get(&handle).map(|e| e.state) {
            None | Some(EndpointState::Destroyed) => {
                return Err(Error::destroyed("Endpoint", "bind"))
            }
            Some(EndpointState::Unbound) => {}
            Some(_) => return Ok(()),
        }
        let token = self.alloc_lookup(LookupPurpose::Bind(handle));
        let Some(endpoint) = self.endpoints.get_mut(&handle) else {
            return Ok(());
        };
        endpoint.state = EndpointState::Pending;
        endpoint.lookup = Some(token);
        let host = endpoint.config.host().to_owned();
        let family = endpoint.config.family;
        trace!(endpoint = ?handle, %host, %family, "resolving endpoint address");
        self.lookup.lookup(token, &host, family);
        Ok(())
    }

    pub(crate) fn endpoint_resolved(
        &mut self,
        handle: EndpointHandle,
        token: LookupToken,
        result: io::Result<IpAddr>,
    ) {
        let Some(endpoint) = self.endpoints.get_mut(&handle) else {
            return;
        };
        if endpoint.state != EndpointState::Pending || endpoint.lookup != Some(token) {
            return;
        }
        endpoint.lookup = None;
        let host = endpoint.config.host().to_owned();
        let port = endpoint.config.port;

        let ip = match result {
            Ok(ip) => ip,
            Err(e) => {
                let error = Error::Lookup {
                    host,
                    source: Arc::new(e),
                };
                self.destroy_endpoint(handle, Some(error));
                return;
            }
        };

        let addr = SocketAddr::new(ip, port);
        let (socket, udp) = match bind_udp(&endpoint.config, addr) {
            Ok(x) => x,
            Err(e) => {
                debug!(endpoint = ?handle, %addr, error = %e, "bind failed");
                let error = Error::Bind {
                    host,
                    port,
                    source: Arc::new(e),
                };
                self.destroy_endpoint(handle, Some(error));
                return;
            }
        };
        endpoint.local_addr = socket.local_addr().ok().and_then(|a| a.as_socket());
        endpoint.socket = Some(socket);
        let preferred = endpoint.config.preferred;

        if let Err(e) = self.engine.add_endpoint(handle, udp, preferred) {
            self.destroy_endpoint(handle, Some(e.into()));
            return;
        }
        if let Some(endpoint) = self.endpoints.get_mut(&handle) {
            endpoint.attached = true;
            endpoint.state = EndpointState::Bound;
            debug!(endpoint = ?handle, addr = ?endpoint.local_addr, "endpoint bound");
        }
        if !self.referenced {
            self.engine.set_endpoint_ref(handle, false);
        }
        self.endpoint_bound();
    }

    /// Begin closing an endpoint
    ///
    /// Endpoints the engine never saw finish closing on the next [`poll`](Socket::poll); the
    /// rest finish once the engine reports [`EndpointClosed`](crate::EngineEvent::EndpointClosed).
    pub(crate) fn destroy_endpoint(&mut self, handle: EndpointHandle, error: Option<Error>) {
        let Some(endpoint) = self.endpoints.get_mut(&handle) else {
            return;
        };
        if endpoint.state == EndpointState::Destroyed {
            return;
        }
        trace!(endpoint = ?handle, ?error, "destroying endpoint");
        endpoint.state = EndpointState::Destroyed;
        endpoint.socket = None;
        endpoint.error = error.clone();
        if let Some(token) = endpoint.lookup.take() {
            self.lookups.remove(&token);
        }
        if endpoint.attached {
            self.engine.close_endpoint(handle);
        } else {
            self.tasks.push(Task::EndpointClosed {
                endpoint: handle,
                error,
            });
        }
    }
}

fn bind_udp(
    config: &EndpointConfig,
    addr: SocketAddr,
) -> io::Result<(socket2::Socket, std::net::UdpSocket)> {
    let socket = socket2::Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    if addr.is_ipv6() {
        socket.set_only_v6(config.ipv6_only)?;
    }
    if config.reuse_addr {
        socket.set_reuse_address(true)?;
    }
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    let udp = socket.try_clone()?.into();
    Ok((socket, udp))
}

/// A UDP binding owned by a [`Socket`]
#[derive(Debug)]
pub struct Endpoint<'a> {
    socket: &'a mut Socket,
    handle: EndpointHandle,
}

impl Endpoint<'_> {
    /// The endpoint's handle
    pub fn handle(&self) -> EndpointHandle {
        self.handle
    }

    /// Lifecycle state; `Destroyed` once the endpoint is gone
    pub fn state(&self) -> EndpointState {
        self.inner().map_or(EndpointState::Destroyed, |e| e.state)
    }

    /// Whether the engine sends from this endpoint by default
    pub fn is_preferred(&self) -> bool {
        self.inner().is_some_and(|e| e.config.preferred)
    }

    /// Bound local address
    pub fn address(&self) -> Option<SocketAddr> {
        self.inner()
            .filter(|e| e.state == EndpointState::Bound)
            .and_then(|e| e.local_addr)
    }

    /// Resolve the endpoint's address and bind it
    ///
    /// Does nothing once a bind is under way or done; calls made while the lookup is pending
    /// share it.
    pub fn bind(&mut self) -> Result<(), Error> {
        self.socket.bind_endpoint(self.handle)
    }

    /// Stop using this endpoint
    ///
    /// [`SocketEvent::EndpointClose`](crate::SocketEvent::EndpointClose) follows. Closing the
    /// last endpoint destroys the socket.
    pub fn close(&mut self) -> Result<(), Error> {
        match self.inner().map(|e| e.state) {
            None | Some(EndpointState::Destroyed) => Err(Error::destroyed("Endpoint", "close")),
            Some(_) => {
                self.socket.destroy_endpoint(self.handle, None);
                Ok(())
            }
        }
    }

    /// Set the IP time-to-live of outgoing packets
    pub fn set_ttl(&self, ttl: u32) -> Result<(), Error> {
        self.with_socket("set_ttl", |s| s.set_ttl(ttl))
    }

    /// Set the time-to-live of outgoing IPv4 multicast packets
    pub fn set_multicast_ttl(&self, ttl: u32) -> Result<(), Error> {
        self.with_socket("set_multicast_ttl", |s| s.set_multicast_ttl_v4(ttl))
    }

    /// Allow sending to broadcast addresses
    pub fn set_broadcast(&self, on: bool) -> Result<(), Error> {
        self.with_socket("set_broadcast", |s| s.set_broadcast(on))
    }

    /// Deliver our own multicast packets back to us
    pub fn set_multicast_loopback(&self, on: bool) -> Result<(), Error> {
        let v6 = self.address().is_some_and(|a| a.is_ipv6());
        self.with_socket("set_multicast_loopback", |s| match v6 {
            true => s.set_multicast_loop_v6(on),
            false => s.set_multicast_loop_v4(on),
        })
    }

    /// Join a multicast group
    ///
    /// `interface` selects the local IPv4 interface; IPv6 groups are joined on the default
    /// interface.
    pub fn add_membership(&self, group: IpAddr, interface: Option<Ipv4Addr>) -> Result<(), Error> {
        self.with_socket("add_membership", |s| match group {
            IpAddr::V4(group) => {
                s.join_multicast_v4(&group, &interface.unwrap_or(Ipv4Addr::UNSPECIFIED))
            }
            IpAddr::V6(group) => s.join_multicast_v6(&group, 0),
        })
    }

    /// Leave a multicast group joined with [`add_membership`](Self::add_membership)
    pub fn drop_membership(&self, group: IpAddr, interface: Option<Ipv4Addr>) -> Result<(), Error> {
        self.with_socket("drop_membership", |s| match group {
            IpAddr::V4(group) => {
                s.leave_multicast_v4(&group, &interface.unwrap_or(Ipv4Addr::UNSPECIFIED))
            }
            IpAddr::V6(group) => s.leave_multicast_v6(&group, 0),
        })
    }

    fn inner(&self) -> Option<&EndpointInner> {
        self.socket.endpoints.get(&self.handle)
    }

    fn with_socket<T>(
        &self,
        op: &'static str,
        f: impl FnOnce(&socket2::Socket) -> io::Result<T>,
    ) -> Result<T, Error> {
        let endpoint = self
            .inner()
            .filter(|e| e.state != EndpointState::Destroyed)
            .ok_or(Error::destroyed("Endpoint", op))?;
        let socket = endpoint
            .socket
            .as_ref()
            .ok_or(Error::InvalidState("endpoint is not bound"))?;
        f(socket).map_err(|e| Error::Io(Arc::new(e)))
    }
}
