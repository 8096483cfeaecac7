use std::net::IpAddr;
use std::sync::Arc;
use hickory_proto::op::{Message, MessageType, OpCode, Query as Question};
use hickory_proto::rr::rdata::{A, AAAA, PTR, TXT};
use hickory_proto::rr::{DNSClass, RData, Record, RecordType};
use shared::protocol::{MAX_QUERY_SIZE, META_QUERY_TYPE};
use shared::types::{InstanceKey, ResolvedEndpoint, ServiceType, TxtRecord};
use crate::error::{DecodeError, EncodeError};

pub use hickory_proto::rr::Name;

/// Encoded query and the transaction id it carries. A browse query whose
/// known answers overflow one packet continues in follow-up packets.
#[derive(Debug, Clone)]
pub struct Query {
    pub id: u16,
    pub packets: Vec<Vec<u8>>,
}

/// Cached PTR answer listed in a query (RFC 6762 §7.1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownAnswer {
    pub target: Name,
    pub remaining_ttl: u32,
}

/// One instance asserted by a response
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceAdvertisement {
    pub key: InstanceKey,
    /// Seconds; zero announces withdrawal ("goodbye")
    pub ttl: u32,
    /// Present when SRV data travelled with the advertisement
    pub endpoint: Option<Arc<ResolvedEndpoint>>,
}

impl ServiceAdvertisement {
    pub fn is_withdrawal(&self) -> bool {
        self.ttl == 0
    }
}

/// TXT data for an instance, whether or not its PTR or SRV came along
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeUpdate {
    pub key: InstanceKey,
    pub ttl: u32,
    pub txt: TxtRecord,
}

/// Address records for one host name
#[derive(Debug, Clone, PartialEq)]
pub struct AddressUpdate {
    /// Host name with trailing dot, as carried in SRV targets
    pub host: String,
    pub addresses: Vec<IpAddr>,
    /// Cache-flush bit set: these addresses replace any cached set
    pub flush: bool,
}

/// Answer to a service type enumeration query (RFC 6763 §9)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceTypeAdvertisement {
    pub service_type: ServiceType,
    pub domain: String,
    pub ttl: u32,
}

#[derive(Debug, Clone, Default)]
pub struct Response {
    pub id: u16,
    pub advertisements: Vec<ServiceAdvertisement>,
    pub attributes: Vec<AttributeUpdate>,
    pub addresses: Vec<AddressUpdate>,
    pub service_types: Vec<ServiceTypeAdvertisement>,
}

fn name_from<'a>(labels: impl IntoIterator<Item = &'a str>) -> Option<Name> {
    Name::from_labels(labels.into_iter().map(str::as_bytes)).ok()
}

fn domain_labels(domain: &str) -> impl Iterator<Item = &str> {
    domain.trim_end_matches('.').split('.')
}

/// `<type>.<domain>`, e.g. `_http._tcp.local.`
pub fn service_name(service_type: &ServiceType, domain: &str) -> Option<Name> {
    name_from(
        [service_type.application(), service_type.protocol().label()]
            .into_iter()
            .chain(domain_labels(domain)),
    )
}

/// `_services._dns-sd._udp.<domain>`
pub fn meta_query_name(domain: &str) -> Option<Name> {
    name_from(META_QUERY_TYPE.split('.').chain(domain_labels(domain)))
}

/// `<instance>.<type>.<domain>`
pub fn instance_name(key: &InstanceKey) -> Option<Name> {
    name_from(
        [
            key.name.as_str(),
            key.service_type.application(),
            key.service_type.protocol().label(),
        ]
        .into_iter()
        .chain(domain_labels(&key.domain)),
    )
}

fn labels(name: &Name) -> Vec<String> {
    name.iter()
        .map(|label| String::from_utf8_lossy(label).into_owned())
        .collect()
}

/// Name as text with a trailing dot; labels are not escaped
fn dotted(name: &Name) -> String {
    let mut text = labels(name).join(".");
    text.push('.');
    text
}

fn query_message(id: u16, question: Option<&Question>, answers: &[Record], truncated: bool) -> Message {
    let mut message = Message::new();
    message
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_truncated(truncated);
    if let Some(question) = question {
        message.add_query(question.clone());
    }
    message.add_answers(answers.iter().cloned());
    message
}

/// Spreads `answers` over as many packets as it takes to keep each within
/// `MAX_QUERY_SIZE`. The question rides in the first packet and every packet
/// but the last has TC set (RFC 6762 §7.2).
fn pack(id: u16, question: Question, answers: &[Record]) -> Result<Vec<Vec<u8>>, EncodeError> {
    let mut packets = Vec::new();
    let mut question = Some(question);
    let mut start = 0;

    loop {
        let mut end = start;
        let mut bytes = query_message(id, question.as_ref(), &[], false).to_vec()?;
        while end < answers.len() {
            let candidate = query_message(id, question.as_ref(), &answers[start..=end], false).to_vec()?;
            // an answer too big for a bare packet still goes out alone
            if candidate.len() > MAX_QUERY_SIZE && (end > start || question.is_some()) {
                break;
            }
            bytes = candidate;
            end += 1;
        }

        if end == answers.len() {
            packets.push(bytes);
            return Ok(packets);
        }
        packets.push(query_message(id, question.as_ref(), &answers[start..end], true).to_vec()?);
        question = None;
        start = end;
    }
}

/// PTR query for `service`, listing `known` answers the responders may skip
pub fn encode_query(service: &Name, known: &[KnownAnswer]) -> Result<Query, EncodeError> {
    let id = rand::random::<u16>();
    let answers: Vec<Record> = known
        .iter()
        .map(|answer| {
            Record::from_rdata(
                service.clone(),
                answer.remaining_ttl,
                RData::PTR(PTR(answer.target.clone())),
            )
        })
        .collect();

    let packets = pack(id, Question::query(service.clone(), RecordType::PTR), &answers)?;
    Ok(Query { id, packets })
}

/// Targeted SRV + TXT query for one instance
pub fn encode_resolve_query(instance: &Name) -> Result<Query, EncodeError> {
    let id = rand::random::<u16>();
    let mut message = query_message(id, None, &[], false);
    for query_type in [RecordType::SRV, RecordType::TXT] {
        message.add_query(Question::query(instance.clone(), query_type));
    }

    Ok(Query {
        id,
        packets: vec![message.to_vec()?],
    })
}

/// RFC 2181 §8: a TTL with the top bit set is treated as zero
fn ttl(record: &Record) -> u32 {
    match record.ttl() {
        ttl if ttl > i32::MAX as u32 => 0,
        ttl => ttl,
    }
}

/// Reads an instance key out of `<instance>.<_app>.<_proto>.<domain...>`
fn parse_instance(name: &Name) -> Option<InstanceKey> {
    let labels = labels(name);
    if labels.len() < 4 {
        return None;
    }
    let service_type = ServiceType::from_labels(&labels[1], &labels[2]).ok()?;
    Some(InstanceKey::new(
        labels[0].clone(),
        service_type,
        &labels[3..].join("."),
    ))
}

fn is_meta_query(name: &Name) -> bool {
    let labels = labels(name);
    let meta: Vec<&str> = META_QUERY_TYPE.split('.').collect();
    labels.len() > meta.len()
        && labels
            .iter()
            .zip(&meta)
            .all(|(label, expected)| label.eq_ignore_ascii_case(expected))
}

/// `<_app>.<_proto>.<domain...>` out of an enumeration answer
fn parse_service_type(name: &Name) -> Option<(ServiceType, String)> {
    let labels = labels(name);
    if labels.len() < 3 {
        return None;
    }
    let service_type = ServiceType::from_labels(&labels[0], &labels[1]).ok()?;
    Some((service_type, labels[2..].join(".").to_ascii_lowercase()))
}

/// TXT strings to attributes; strings without a key are ignored (RFC 6763 §6.4)
fn parse_txt(txt: &TXT) -> TxtRecord {
    let mut attributes = TxtRecord::new();
    for s in txt.iter() {
        let (key, value) = match s.iter().position(|&b| b == b'=') {
            Some(eq) => (&s[..eq], &s[eq + 1..]),
            None => (&s[..], &[][..]),
        };
        if key.is_empty() {
            continue;
        }
        attributes.insert(
            String::from_utf8_lossy(key).into_owned(),
            String::from_utf8_lossy(value).into_owned(),
        );
    }
    attributes
}

fn address_of(record: &Record) -> Option<IpAddr> {
    match record.data()? {
        RData::A(A(v4)) => Some(IpAddr::V4(*v4)),
        RData::AAAA(AAAA(v6)) => Some(IpAddr::V6(*v6)),
        _ => None,
    }
}

struct Collected<'a> {
    key: InstanceKey,
    ptr_ttl: Option<u32>,
    srv: Option<&'a Record>,
}

fn collected<'a, 'b>(
    found: &'b mut Vec<Collected<'a>>,
    key: InstanceKey,
) -> &'b mut Collected<'a> {
    let idx = match found.iter().position(|c| c.key == key) {
        Some(idx) => idx,
        None => {
            found.push(Collected {
                key,
                ptr_ttl: None,
                srv: None,
            });
            found.len() - 1
        }
    };
    &mut found[idx]
}

fn endpoint_from_srv(record: &Record, records: &[&Record]) -> Option<ResolvedEndpoint> {
    let Some(RData::SRV(srv)) = record.data() else {
        return None;
    };

    let txt = records
        .iter()
        .find_map(|r| match r.data() {
            Some(RData::TXT(txt)) if r.name() == record.name() => Some(parse_txt(txt)),
            _ => None,
        })
        .unwrap_or_default();

    let mut addresses: Vec<IpAddr> = Vec::new();
    for r in records.iter().filter(|r| r.name() == srv.target() && ttl(r) > 0) {
        if let Some(addr) = address_of(r) {
            if !addresses.contains(&addr) {
                addresses.push(addr);
            }
        }
    }

    Some(ResolvedEndpoint {
        target: dotted(srv.target()),
        addresses,
        port: srv.port(),
        priority: srv.priority(),
        weight: srv.weight(),
        txt,
    })
}

fn collect_address(updates: &mut Vec<AddressUpdate>, record: &Record, addr: IpAddr) {
    let host = dotted(record.name());
    let flush = record.mdns_cache_flush();
    match updates.iter_mut().find(|u| u.host.eq_ignore_ascii_case(&host)) {
        Some(update) => {
            if !update.addresses.contains(&addr) {
                update.addresses.push(addr);
            }
            update.flush |= flush;
        }
        None => updates.push(AddressUpdate {
            host,
            addresses: vec![addr],
            flush,
        }),
    }
}

/// Decodes a response datagram. Advertisements come out in order of first
/// appearance; loose TXT and address records are reported separately so
/// attribute changes announced on their own reach the cache. Unknown record
/// types are skipped; malformed framing fails the whole packet.
pub fn decode_response(bytes: &[u8]) -> Result<Response, DecodeError> {
    let message = Message::from_vec(bytes)?;
    if message.message_type() != MessageType::Response {
        return Err(DecodeError::NotResponse);
    }

    let records: Vec<&Record> = message
        .answers()
        .iter()
        .chain(message.additionals())
        .filter(|r| r.dns_class() == DNSClass::IN)
        .collect();

    let mut response = Response {
        id: message.id(),
        ..Response::default()
    };
    let mut found: Vec<Collected<'_>> = Vec::new();

    for record in &records {
        match record.data() {
            Some(RData::PTR(PTR(target))) if is_meta_query(record.name()) => {
                if let Some((service_type, domain)) = parse_service_type(target) {
                    response.service_types.push(ServiceTypeAdvertisement {
                        service_type,
                        domain,
                        ttl: ttl(record),
                    });
                }
            }
            // owner is the service type or one of its subtypes; the target
            // names the instance
            Some(RData::PTR(PTR(target)))
                if target.num_labels() > 1 && target.base_name().zone_of(record.name()) =>
            {
                if let Some(key) = parse_instance(target) {
                    collected(&mut found, key).ptr_ttl = Some(ttl(record));
                }
            }
            Some(RData::SRV(_)) => {
                if let Some(key) = parse_instance(record.name()) {
                    collected(&mut found, key).srv = Some(*record);
                }
            }
            Some(RData::TXT(txt)) if ttl(record) > 0 => {
                if let Some(key) = parse_instance(record.name()) {
                    response.attributes.push(AttributeUpdate {
                        key,
                        ttl: ttl(record),
                        txt: parse_txt(txt),
                    });
                }
            }
            Some(RData::A(_) | RData::AAAA(_)) if ttl(record) > 0 => {
                if let Some(addr) = address_of(record) {
                    collect_address(&mut response.addresses, record, addr);
                }
            }
            _ => {}
        }
    }

    response.advertisements = found
        .into_iter()
        .map(|c| {
            let ttl = c.ptr_ttl.or(c.srv.map(ttl)).unwrap_or(0);
            let endpoint = c
                .srv
                .filter(|srv| self::ttl(srv) > 0 && ttl > 0)
                .and_then(|srv| endpoint_from_srv(srv, &records))
                .map(Arc::new);
            ServiceAdvertisement {
                key: c.key,
                ttl,
                endpoint,
            }
        })
        .collect();

    Ok(response)
}
