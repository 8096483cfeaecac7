use std::net::{Ipv4Addr, SocketAddrV4};

/// mDNS IPv4 multicast group (RFC 6762 §3)
pub const MDNS_GROUP_V4: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
pub const MDNS_PORT: u16 = 5353;
pub const MDNS_ENDPOINT_V4: SocketAddrV4 = SocketAddrV4::new(MDNS_GROUP_V4, MDNS_PORT);

/// Domain browsed when the caller does not name one
pub const DEFAULT_DOMAIN: &str = "local";

/// RFC 6762 §11: link-local senders use an IP TTL of 255
pub const DEFAULT_MULTICAST_TTL: u32 = 255;

/// Receive buffer size; mDNS datagrams may exceed the classic 512 byte DNS limit
pub const MAX_DATAGRAM_SIZE: usize = 9216;

pub const MAX_LABEL_LEN: usize = 63;

/// Largest browse query put on the wire: a 1500 byte Ethernet MTU less the
/// IPv4 and UDP headers. Longer known-answer lists continue in follow-up
/// packets (RFC 6762 §7.2).
pub const MAX_QUERY_SIZE: usize = 1472;

/// DNS-SD service type enumeration (RFC 6763 §9), without the domain
pub const META_QUERY_TYPE: &str = "_services._dns-sd._udp";

/// Protocol labels allowed in a DNS-SD service type (RFC 6763 §7)
pub const PROTO_TCP: &str = "_tcp";
pub const PROTO_UDP: &str = "_udp";
