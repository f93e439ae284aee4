//! Kernel route table access over rtnetlink
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SC-7: Boundary Protection - Kernel interface for forwarding state
//! - AC-3: Access Enforcement - Route changes require CAP_NET_ADMIN
//! - AU-12: Audit Record Generation - Log all route mutations

#[cfg(target_os = "linux")]
mod linux {
    use crate::error::{BackendError, Result};
    use crate::route::{Route, RouteTable};
    use fabric_types::{IpAddress, IpPrefix};
    use netlink_packet_core::{
        NetlinkHeader, NetlinkMessage, NetlinkPayload, NLM_F_ACK, NLM_F_CREATE, NLM_F_DUMP,
        NLM_F_EXCL, NLM_F_REQUEST,
    };
    use netlink_packet_route::route::{
        RouteAddress, RouteAttribute, RouteHeader, RouteMessage, RouteProtocol, RouteScope,
        RouteType,
    };
    use netlink_packet_route::{AddressFamily, RouteNetlinkMessage};
    use netlink_sys::{Socket, SocketAddr, protocols::NETLINK_ROUTE};
    use parking_lot::Mutex;
    use std::net::{Ipv4Addr, Ipv6Addr};
    use std::os::fd::AsRawFd;
    use tracing::{debug, instrument, trace, warn};

    /// Receive buffer capacity; large enough for a multipart dump chunk.
    const RECV_BUFFER_SIZE: usize = 64 * 1024;

    /// Kernel socket receive buffer for full-table dumps (1MB)
    /// NIST: SC-5 - Adequate buffering for large route tables
    const SOCKET_RECV_BUFFER_SIZE: usize = 1024 * 1024;

    struct Connection {
        socket: Socket,
        sequence: u32,
        buffer: Vec<u8>,
    }

    /// Route table backed by a blocking rtnetlink socket.
    ///
    /// Requests are serialized through one socket; each call waits for the
    /// kernel's acknowledgement (or the end of a dump) before returning.
    pub struct NetlinkRouteTable {
        conn: Mutex<Connection>,
    }

    impl NetlinkRouteTable {
        /// Opens and connects an rtnetlink socket.
        ///
        /// # NIST Controls
        /// - AC-3: Access Enforcement - Kernel socket requires CAP_NET_ADMIN
        #[instrument]
        pub fn new() -> Result<Self> {
            let mut socket =
                Socket::new(NETLINK_ROUTE).map_err(|e| BackendError::netlink("socket", e))?;
            socket
                .bind_auto()
                .map_err(|e| BackendError::netlink("bind", e))?;
            socket
                .connect(&SocketAddr::new(0, 0))
                .map_err(|e| BackendError::netlink("connect", e))?;

            debug!("Netlink route socket connected");
            tune_socket(&socket);

            Ok(Self {
                conn: Mutex::new(Connection {
                    socket,
                    sequence: 0,
                    buffer: Vec::with_capacity(RECV_BUFFER_SIZE),
                }),
            })
        }

        /// Sends one request and collects route messages until the kernel
        /// acknowledges it or finishes the dump.
        fn request(
            &self,
            operation: &str,
            message: RouteNetlinkMessage,
            flags: u16,
        ) -> Result<Vec<RouteMessage>> {
            let mut guard = self.conn.lock();
            let conn = &mut *guard;
            conn.sequence = conn.sequence.wrapping_add(1);
            let sequence = conn.sequence;

            let mut header = NetlinkHeader::default();
            header.flags = flags;
            header.sequence_number = sequence;

            let mut packet = NetlinkMessage::new(header, NetlinkPayload::InnerMessage(message));
            packet.finalize();
            let mut buf = vec![0u8; packet.buffer_len()];
            packet.serialize(&mut buf);

            conn.socket
                .send(&buf, 0)
                .map_err(|e| BackendError::netlink(operation, e))?;

            let mut routes = Vec::new();
            loop {
                conn.buffer.clear();
                let len = conn
                    .socket
                    .recv(&mut conn.buffer, 0)
                    .map_err(|e| BackendError::netlink(operation, e))?;

                let mut offset = 0;
                while offset < len {
                    let msg =
                        NetlinkMessage::<RouteNetlinkMessage>::deserialize(&conn.buffer[offset..])
                            .map_err(|e| BackendError::netlink(operation, e))?;

                    let msg_len = msg.header.length as usize;
                    if msg_len == 0 {
                        return Err(BackendError::netlink(operation, "zero-length message"));
                    }
                    // Align to 4 bytes (netlink alignment requirement)
                    offset = (offset + msg_len + 3) & !3;

                    if msg.header.sequence_number != sequence {
                        trace!(seq = msg.header.sequence_number, "Skipping unrelated message");
                        continue;
                    }

                    match msg.payload {
                        NetlinkPayload::Done(_) => return Ok(routes),
                        NetlinkPayload::Error(err) => {
                            return match err.code {
                                None => Ok(routes),
                                Some(code) => Err(BackendError::netlink(
                                    operation,
                                    std::io::Error::from_raw_os_error(-code.get()),
                                )),
                            };
                        }
                        NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewRoute(route)) => {
                            routes.push(route);
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    impl RouteTable for NetlinkRouteTable {
        #[instrument(skip_all, fields(route = %route))]
        fn add_route(&self, route: &Route) -> Result<()> {
            let msg = route_message(route, RouteProtocol::Boot, RouteScope::Universe);
            self.request(
                "add_route",
                RouteNetlinkMessage::NewRoute(msg),
                NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
            )?;
            debug!("Route installed");
            Ok(())
        }

        #[instrument(skip_all, fields(route = %route))]
        fn delete_route(&self, route: &Route) -> Result<()> {
            let msg = route_message(route, RouteProtocol::Unspec, RouteScope::NoWhere);
            self.request(
                "delete_route",
                RouteNetlinkMessage::DelRoute(msg),
                NLM_F_REQUEST | NLM_F_ACK,
            )?;
            debug!("Route deleted");
            Ok(())
        }

        fn list_routes(&self) -> Result<Vec<Route>> {
            let messages = self.request(
                "list_routes",
                RouteNetlinkMessage::GetRoute(RouteMessage::default()),
                NLM_F_REQUEST | NLM_F_DUMP,
            )?;
            let routes: Vec<Route> = messages.iter().filter_map(parse_route).collect();
            trace!(count = routes.len(), "Listed main table routes");
            Ok(routes)
        }
    }

    /// Enlarges the socket receive buffer; failure only costs dump throughput.
    fn tune_socket(socket: &Socket) {
        let fd = socket.as_raw_fd();
        let size = SOCKET_RECV_BUFFER_SIZE as libc::c_int;
        let ret = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                &size as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            warn!("Failed to set SO_RCVBUF, using default buffer size");
        } else {
            debug!(size = SOCKET_RECV_BUFFER_SIZE, "Set socket receive buffer");
        }
    }

    fn route_message(route: &Route, protocol: RouteProtocol, scope: RouteScope) -> RouteMessage {
        let destination = route.destination.network();
        let mut msg = RouteMessage::default();
        msg.header.address_family = if destination.is_ipv4() {
            AddressFamily::Inet
        } else {
            AddressFamily::Inet6
        };
        msg.header.destination_prefix_length = destination.prefix_len();
        msg.header.table = RouteHeader::RT_TABLE_MAIN;
        msg.header.protocol = protocol;
        msg.header.scope = scope;
        msg.header.kind = RouteType::Unicast;

        msg.attributes
            .push(RouteAttribute::Destination(route_address(destination.address())));
        msg.attributes
            .push(RouteAttribute::Gateway(route_address(&route.gateway)));
        msg.attributes.push(RouteAttribute::Oif(route.link_index));
        if route.metric != 0 {
            msg.attributes.push(RouteAttribute::Priority(route.metric));
        }
        msg
    }

    fn route_address(addr: &IpAddress) -> RouteAddress {
        match addr {
            IpAddress::V4(v4) => RouteAddress::Inet(*v4),
            IpAddress::V6(v6) => RouteAddress::Inet6(*v6),
        }
    }

    fn parse_address(addr: &RouteAddress) -> Option<IpAddress> {
        match addr {
            RouteAddress::Inet(v4) => Some(IpAddress::V4(*v4)),
            RouteAddress::Inet6(v6) => Some(IpAddress::V6(*v6)),
            _ => None,
        }
    }

    /// Converts a dumped main-table unicast gateway route.
    fn parse_route(msg: &RouteMessage) -> Option<Route> {
        if msg.header.kind != RouteType::Unicast {
            return None;
        }

        let mut table = u32::from(msg.header.table);
        let mut destination = None;
        let mut gateway = None;
        let mut link_index = 0;
        let mut metric = 0;

        for attr in &msg.attributes {
            match attr {
                RouteAttribute::Destination(addr) => destination = parse_address(addr),
                RouteAttribute::Gateway(addr) => gateway = parse_address(addr),
                RouteAttribute::Oif(index) => link_index = *index,
                RouteAttribute::Priority(priority) => metric = *priority,
                RouteAttribute::Table(id) => table = *id,
                _ => {}
            }
        }

        if table != u32::from(RouteHeader::RT_TABLE_MAIN) {
            return None;
        }

        let gateway = gateway?;
        let address = match (destination, msg.header.address_family) {
            (Some(addr), _) => addr,
            (None, AddressFamily::Inet) => IpAddress::V4(Ipv4Addr::UNSPECIFIED),
            (None, AddressFamily::Inet6) => IpAddress::V6(Ipv6Addr::UNSPECIFIED),
            (None, _) => return None,
        };
        let destination = IpPrefix::new(address, msg.header.destination_prefix_length).ok()?;

        Some(Route {
            link_index,
            destination,
            gateway,
            metric,
        })
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use pretty_assertions::assert_eq;

        fn route(dst: &str, gw: &str) -> Route {
            Route::new(dst.parse().unwrap(), gw.parse().unwrap(), 3)
        }

        #[test]
        fn test_route_message_roundtrip() {
            let mut original = route("10.5.1.0/24", "192.168.0.1");
            original.metric = 50;
            let msg = route_message(&original, RouteProtocol::Boot, RouteScope::Universe);

            assert_eq!(msg.header.address_family, AddressFamily::Inet);
            assert_eq!(msg.header.destination_prefix_length, 24);
            assert_eq!(parse_route(&msg), Some(original));
        }

        #[test]
        fn test_route_message_ipv6() {
            let original = route("fd00:5:1::/64", "fd00::1");
            let msg = route_message(&original, RouteProtocol::Boot, RouteScope::Universe);
            assert_eq!(msg.header.address_family, AddressFamily::Inet6);
            assert_eq!(parse_route(&msg), Some(original));
        }

        #[test]
        fn test_parse_skips_other_tables_and_direct_routes() {
            let mut msg = route_message(
                &route("10.5.1.0/24", "192.168.0.1"),
                RouteProtocol::Boot,
                RouteScope::Universe,
            );
            msg.header.table = 255;
            assert_eq!(parse_route(&msg), None);

            let mut direct = route_message(
                &route("10.5.1.0/24", "192.168.0.1"),
                RouteProtocol::Kernel,
                RouteScope::Link,
            );
            direct
                .attributes
                .retain(|a| !matches!(a, RouteAttribute::Gateway(_)));
            assert_eq!(parse_route(&direct), None);
        }
    }
}

#[cfg(target_os = "linux")]
pub use linux::*;

/// Mock implementation for non-Linux platforms (development only)
#[cfg(not(target_os = "linux"))]
mod mock {
    use crate::error::Result;
    use crate::route::{Route, RouteTable};
    use parking_lot::Mutex;
    use tracing::debug;

    /// In-memory route table standing in for the kernel.
    #[derive(Debug, Default)]
    pub struct NetlinkRouteTable {
        routes: Mutex<Vec<Route>>,
    }

    impl NetlinkRouteTable {
        pub fn new() -> Result<Self> {
            Ok(Self::default())
        }
    }

    impl RouteTable for NetlinkRouteTable {
        fn add_route(&self, route: &Route) -> Result<()> {
            debug!(route = %route, "Mock route installed");
            self.routes.lock().push(route.clone());
            Ok(())
        }

        fn delete_route(&self, route: &Route) -> Result<()> {
            debug!(route = %route, "Mock route deleted");
            self.routes.lock().retain(|r| !r.matches(route));
            Ok(())
        }

        fn list_routes(&self) -> Result<Vec<Route>> {
            Ok(self.routes.lock().clone())
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub use mock::*;
