use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use hickory_proto::op::{Message, MessageType};
use hickory_proto::rr::rdata::{A, PTR, SRV, TXT};
use hickory_proto::rr::{RData, Record, RecordType};
use shared::protocol::{MAX_QUERY_SIZE, MDNS_ENDPOINT_V4};
use shared::types::{Event, ResolutionState, SessionErrorKind};
use crate::transport::MemoryTransport;
use super::*;

fn responder() -> SocketAddr {
    "192.168.1.10:5353".parse().unwrap()
}

fn http() -> ServiceType {
    "_http._tcp".parse().unwrap()
}

fn key(name: &str) -> InstanceKey {
    InstanceKey::new(name, http(), "local")
}

fn name(labels: &[&str]) -> Name {
    Name::from_labels(labels.iter().map(|label| label.as_bytes())).unwrap()
}

fn response(answers: Vec<Record>) -> Vec<u8> {
    let mut message = Message::new();
    message
        .set_message_type(MessageType::Response)
        .set_authoritative(true);
    message.add_answers(answers);
    message.to_vec().unwrap()
}

fn ptr(service: &str, instance: &str, ttl: u32) -> Record {
    Record::from_rdata(
        name(&[service, "_tcp", "local"]),
        ttl,
        RData::PTR(PTR(name(&[instance, service, "_tcp", "local"]))),
    )
}

fn flushed(owner: Name, data: RData) -> Record {
    let mut record = Record::from_rdata(owner, 120, data);
    record.set_mdns_cache_flush(true);
    record
}

/// PTR-only announcement for `instance` under `service`
fn announcement(service: &str, instance: &str, ttl: u32) -> Vec<u8> {
    response(vec![ptr(service, instance, ttl)])
}

/// SRV + TXT + A answer for `instance`, as sent in reply to a resolve query
fn srv_answer(instance: &str, port: u16) -> Vec<u8> {
    let owner = name(&[instance, "_http", "_tcp", "local"]);
    let host = name(&["nas", "local"]);
    response(vec![
        flushed(owner.clone(), RData::SRV(SRV::new(0, 0, port, host.clone()))),
        flushed(owner, RData::TXT(TXT::new(vec!["path=/".to_string()]))),
        flushed(host, RData::A(A(Ipv4Addr::new(192, 168, 1, 10)))),
    ])
}

/// TXT record announced on its own, as a responder does after changing
/// its attributes
fn txt_announcement(instance: &str, path: &str) -> Vec<u8> {
    response(vec![flushed(
        name(&[instance, "_http", "_tcp", "local"]),
        RData::TXT(TXT::new(vec![format!("path={}", path)])),
    )])
}

struct Harness {
    transport: Arc<MemoryTransport>,
    session: Arc<DiscoverySession<MemoryTransport>>,
    events: flume::Receiver<Event>,
}

impl Harness {
    async fn listening(config: SessionConfig) -> Self {
        Self::browsing(config, http()).await
    }

    async fn browsing(config: SessionConfig, browse: impl Into<Browse>) -> Self {
        let transport = Arc::new(MemoryTransport::new());
        let session = Arc::new(DiscoverySession::new(transport.clone(), MDNS_ENDPOINT_V4, config));
        let (tx, events) = flume::unbounded();
        session.listen(browse, Arc::new(tx)).await.unwrap();
        Self {
            transport,
            session,
            events,
        }
    }

    fn inject(&self, bytes: &[u8]) {
        assert!(self.transport.inject(MDNS_ENDPOINT_V4, bytes, responder()));
    }

    async fn next_event(&self) -> Event {
        self.events.recv_async().await.unwrap()
    }

    fn drain(&self) -> Vec<Event> {
        self.events.try_iter().collect()
    }
}

/// Lets the worker drain everything already delivered to it
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_right_after_listen_is_silent() {
    let h = Harness::listening(SessionConfig::default()).await;
    assert_eq!(h.session.state(), SessionState::Listening);
    assert_eq!(h.transport.member_count(MDNS_ENDPOINT_V4), 1);

    h.session.stop().await;

    assert_eq!(h.session.state(), SessionState::Idle);
    assert_eq!(h.transport.member_count(MDNS_ENDPOINT_V4), 0);
    assert!(h.drain().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stop_while_idle_is_a_noop() {
    let transport = Arc::new(MemoryTransport::new());
    let session = DiscoverySession::new(transport, MDNS_ENDPOINT_V4, SessionConfig::default());
    session.stop().await;
    session.stop().await;
    assert_eq!(session.state(), SessionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_listen_twice_is_rejected() {
    let h = Harness::listening(SessionConfig::default()).await;
    let (tx, _rx) = flume::unbounded::<Event>();

    let err = h.session.listen(http(), Arc::new(tx)).await.unwrap_err();
    assert_eq!(err, DiscoveryError::AlreadyListening);
    assert_eq!(h.transport.member_count(MDNS_ENDPOINT_V4), 1);
}

#[tokio::test(start_paused = true)]
async fn test_listen_without_network() {
    let transport = Arc::new(MemoryTransport::new());
    transport.set_unavailable(true);
    let session = DiscoverySession::new(transport, MDNS_ENDPOINT_V4, SessionConfig::default());
    let (tx, _rx) = flume::unbounded::<Event>();

    let err = session.listen(http(), Arc::new(tx)).await.unwrap_err();
    assert!(matches!(err, DiscoveryError::NetworkUnavailable(_)));
    assert_eq!(session.state(), SessionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_restart_after_stop() {
    let h = Harness::listening(SessionConfig::default()).await;
    h.session.stop().await;

    let (tx, _rx) = flume::unbounded::<Event>();
    h.session.listen(http(), Arc::new(tx)).await.unwrap();
    assert_eq!(h.session.state(), SessionState::Listening);
    h.session.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_initial_query_goes_out_immediately() {
    let h = Harness::listening(SessionConfig::default()).await;
    h.transport.wait_for_sent(1).await;

    let (group, bytes) = h.transport.sent().remove(0);
    assert_eq!(group, MDNS_ENDPOINT_V4);
    let query = Message::from_vec(&bytes).unwrap();
    assert_eq!(query.queries()[0].query_type(), RecordType::PTR);
    assert_eq!(query.queries()[0].name(), &name(&["_http", "_tcp", "local"]));
    h.session.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_requery_lists_known_answers() {
    let h = Harness::listening(SessionConfig::default()).await;
    h.inject(&announcement("_http", "web", 120));
    assert!(matches!(h.next_event().await, Event::ServiceFound(_)));

    // second browse query at the 4s mark
    h.transport.wait_for_sent(2).await;
    let query = Message::from_vec(&h.transport.sent()[1].1).unwrap();
    assert_eq!(query.answers().len(), 1);
    assert_eq!(
        query.answers()[0].data(),
        Some(&RData::PTR(PTR(name(&["web", "_http", "_tcp", "local"]))))
    );
    h.session.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_refreshes_within_ttl_report_once() {
    let h = Harness::listening(SessionConfig::default()).await;

    for _ in 0..4 {
        h.inject(&announcement("_http", "web", 120));
        settle().await;
        tokio::time::sleep(Duration::from_secs(100)).await;
    }

    let events = h.drain();
    assert_eq!(events.len(), 1, "{:?}", events);
    assert!(matches!(&events[0], Event::ServiceFound(instance) if instance.key() == &key("web")));
    h.session.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_gap_beyond_ttl_reports_lost_then_found() {
    let h = Harness::listening(SessionConfig::default()).await;

    h.inject(&announcement("_http", "web", 2));
    assert!(matches!(h.next_event().await, Event::ServiceFound(_)));
    assert_eq!(h.next_event().await, Event::ServiceLost(key("web")));

    h.inject(&announcement("_http", "web", 2));
    assert!(matches!(h.next_event().await, Event::ServiceFound(_)));
    h.session.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_refresh_exactly_at_ttl_keeps_instance() {
    let h = Harness::listening(SessionConfig::default()).await;

    h.inject(&announcement("_http", "web", 2));
    assert!(matches!(h.next_event().await, Event::ServiceFound(_)));

    // lands on the same instant as the 2s sweep tick
    tokio::time::sleep(Duration::from_secs(2)).await;
    h.inject(&announcement("_http", "web", 2));
    settle().await;

    assert!(h.drain().is_empty());
    assert!(h.session.lookup(key("web")).await.unwrap().is_some());
    h.session.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_goodbye_reports_lost_before_deadline() {
    let h = Harness::listening(SessionConfig::default()).await;

    h.inject(&announcement("_http", "web", 120));
    assert!(matches!(h.next_event().await, Event::ServiceFound(_)));
    h.inject(&announcement("_http", "web", 0));
    assert_eq!(h.next_event().await, Event::ServiceLost(key("web")));
    assert_eq!(h.session.lookup(key("web")).await.unwrap(), None);
    h.session.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_malformed_packet_changes_nothing() {
    let h = Harness::listening(SessionConfig::default()).await;

    let bytes = announcement("_http", "web", 120);
    h.inject(&bytes[..bytes.len() - 3]);
    settle().await;

    assert!(h.drain().is_empty());
    assert!(h.session.snapshot().await.unwrap().is_empty());
    let stats = h.session.stats();
    assert_eq!(stats.datagrams, 1);
    assert_eq!(stats.malformed, 1);
    assert_eq!(h.session.state(), SessionState::Listening);
    h.session.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_other_service_types_are_ignored() {
    let h = Harness::listening(SessionConfig::default()).await;

    h.inject(&announcement("_ipp", "printer", 120));
    h.inject(&announcement("_http", "web", 120));

    match h.next_event().await {
        Event::ServiceFound(instance) => assert_eq!(instance.key(), &key("web")),
        other => panic!("unexpected event {:?}", other),
    }
    settle().await;
    assert!(h.drain().is_empty());
    h.session.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_inline_resolution_reports_found_then_resolved() {
    let h = Harness::listening(SessionConfig::default()).await;

    h.inject(&srv_answer("web", 8080));
    assert!(matches!(h.next_event().await, Event::ServiceFound(_)));
    match h.next_event().await {
        Event::ServiceResolved { key: k, endpoint } => {
            assert_eq!(k, key("web"));
            assert_eq!(endpoint.connection_string(), "192.168.1.10:8080");
            assert_eq!(endpoint.txt.get("path"), Some("/"));
        }
        other => panic!("unexpected event {:?}", other),
    }

    let endpoint = h.session.resolve(key("web")).await.unwrap();
    assert_eq!(endpoint.port, 8080);
    h.session.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_resolves_share_one_query() {
    let h = Harness::listening(SessionConfig::default()).await;
    h.transport.wait_for_sent(1).await;

    h.inject(&announcement("_http", "web", 120));
    assert!(matches!(h.next_event().await, Event::ServiceFound(_)));

    let first = tokio::spawn({
        let session = h.session.clone();
        async move { session.resolve(key("web")).await }
    });
    let second = tokio::spawn({
        let session = h.session.clone();
        async move { session.resolve(key("web")).await }
    });

    h.transport.wait_for_sent(2).await;
    settle().await;
    let sent = h.transport.sent();
    assert_eq!(sent.len(), 2);
    let query = Message::from_vec(&sent[1].1).unwrap();
    assert_eq!(query.queries()[0].query_type(), RecordType::SRV);

    let state = h.session.lookup(key("web")).await.unwrap().unwrap().state();
    assert_eq!(state, ResolutionState::Resolving);

    h.inject(&srv_answer("web", 8080));
    let a = first.await.unwrap().unwrap();
    let b = second.await.unwrap().unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(a.port, 8080);

    let instance = h.session.lookup(key("web")).await.unwrap().unwrap();
    assert_eq!(instance.state(), ResolutionState::Resolved);
    h.session.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_resolve_times_out() {
    let h = Harness::listening(SessionConfig::default()).await;
    h.inject(&announcement("_http", "web", 120));
    assert!(matches!(h.next_event().await, Event::ServiceFound(_)));

    let err = h.session.resolve(key("web")).await.unwrap_err();
    assert!(matches!(err, DiscoveryError::ResolutionTimeout { waited, .. } if waited == Duration::from_secs(3)));

    let instance = h.session.lookup(key("web")).await.unwrap().unwrap();
    assert_eq!(instance.state(), ResolutionState::Unresolved);
    assert_eq!(h.session.stats().resolve_timeouts, 1);
    assert_eq!(h.session.state(), SessionState::Listening);
    h.session.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_resolve_unknown_instance() {
    let h = Harness::listening(SessionConfig::default()).await;
    let err = h.session.resolve(key("ghost")).await.unwrap_err();
    assert!(matches!(err, DiscoveryError::InstanceNotFound(_)));
    h.session.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_resolve_while_idle() {
    let transport = Arc::new(MemoryTransport::new());
    let session = DiscoverySession::new(transport, MDNS_ENDPOINT_V4, SessionConfig::default());
    assert_eq!(session.resolve(key("web")).await, Err(DiscoveryError::NotListening));
}

#[tokio::test(start_paused = true)]
async fn test_stop_cancels_inflight_resolve() {
    let h = Harness::listening(SessionConfig::default()).await;
    h.transport.wait_for_sent(1).await;
    h.inject(&announcement("_http", "web", 120));
    assert!(matches!(h.next_event().await, Event::ServiceFound(_)));

    let pending = tokio::spawn({
        let session = h.session.clone();
        async move { session.resolve(key("web")).await }
    });
    h.transport.wait_for_sent(2).await;

    h.session.stop().await;
    assert_eq!(pending.await.unwrap(), Err(DiscoveryError::Cancelled));
    assert!(h.drain().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_auto_resolve_queries_on_found() {
    let config = SessionConfig {
        auto_resolve: true,
        ..SessionConfig::default()
    };
    let h = Harness::listening(config).await;
    h.transport.wait_for_sent(1).await;

    h.inject(&announcement("_http", "web", 120));
    assert!(matches!(h.next_event().await, Event::ServiceFound(_)));
    h.transport.wait_for_sent(2).await;
    let query = Message::from_vec(&h.transport.sent()[1].1).unwrap();
    assert_eq!(query.queries()[0].name(), &name(&["web", "_http", "_tcp", "local"]));

    h.inject(&srv_answer("web", 80));
    assert!(matches!(h.next_event().await, Event::ServiceResolved { .. }));
    h.session.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_transport_failure_ends_session() {
    let h = Harness::listening(SessionConfig::default()).await;
    let mut state = h.session.watch_state();

    assert!(h.transport.fail(MDNS_ENDPOINT_V4, "interface down"));
    match h.next_event().await {
        Event::SessionError { kind, detail } => {
            assert_eq!(kind, SessionErrorKind::ReceiveFailed);
            assert!(detail.contains("interface down"));
        }
        other => panic!("unexpected event {:?}", other),
    }

    state.wait_for(|s| *s == SessionState::Idle).await.unwrap();
    assert_eq!(h.transport.member_count(MDNS_ENDPOINT_V4), 0);
    assert_eq!(h.session.resolve(key("web")).await, Err(DiscoveryError::NotListening));

    // the caller may listen again
    let (tx, _rx) = flume::unbounded::<Event>();
    h.session.listen(http(), Arc::new(tx)).await.unwrap();
    assert_eq!(h.transport.member_count(MDNS_ENDPOINT_V4), 1);
    h.session.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_snapshot_orders_by_name() {
    let h = Harness::listening(SessionConfig::default()).await;
    h.inject(&announcement("_http", "zeta", 120));
    h.inject(&announcement("_http", "alpha", 120));
    settle().await;

    let names: Vec<String> = h
        .session
        .snapshot()
        .await
        .unwrap()
        .iter()
        .map(|instance| instance.key().name.clone())
        .collect();
    assert_eq!(names, vec!["alpha", "zeta"]);
    h.session.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_txt_announced_alone_updates_endpoint() {
    let h = Harness::listening(SessionConfig::default()).await;
    h.inject(&srv_answer("web", 8080));
    assert!(matches!(h.next_event().await, Event::ServiceFound(_)));
    assert!(matches!(h.next_event().await, Event::ServiceResolved { .. }));

    h.inject(&txt_announcement("web", "/v2"));
    match h.next_event().await {
        Event::ServiceUpdated(instance) => {
            assert_eq!(instance.key(), &key("web"));
            let endpoint = instance.endpoint().unwrap();
            assert_eq!(endpoint.txt.get("path"), Some("/v2"));
            assert_eq!(endpoint.port, 8080);
        }
        other => panic!("unexpected event {:?}", other),
    }

    let cached = h.session.lookup(key("web")).await.unwrap().unwrap();
    assert_eq!(cached.endpoint().unwrap().txt.get("path"), Some("/v2"));

    // the same attributes again change nothing
    h.inject(&txt_announcement("web", "/v2"));
    settle().await;
    assert!(h.drain().is_empty());
    h.session.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_address_announced_alone_updates_endpoint() {
    let h = Harness::listening(SessionConfig::default()).await;
    h.inject(&srv_answer("web", 8080));
    assert!(matches!(h.next_event().await, Event::ServiceFound(_)));
    assert!(matches!(h.next_event().await, Event::ServiceResolved { .. }));

    h.inject(&response(vec![flushed(
        name(&["nas", "local"]),
        RData::A(A(Ipv4Addr::new(192, 168, 1, 99))),
    )]));
    match h.next_event().await {
        Event::ServiceUpdated(instance) => {
            assert_eq!(instance.endpoint().unwrap().connection_string(), "192.168.1.99:8080");
        }
        other => panic!("unexpected event {:?}", other),
    }
    h.session.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_passive_mode_sends_no_browse_queries() {
    let config = SessionConfig {
        active_queries: false,
        ..SessionConfig::default()
    };
    let h = Harness::listening(config).await;

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(h.transport.sent().is_empty());

    // unsolicited announcements still count
    h.inject(&announcement("_http", "web", 120));
    assert!(matches!(h.next_event().await, Event::ServiceFound(_)));

    // an explicit resolve still asks
    let pending = tokio::spawn({
        let session = h.session.clone();
        async move { session.resolve(key("web")).await }
    });
    h.transport.wait_for_sent(1).await;
    let query = Message::from_vec(&h.transport.sent()[0].1).unwrap();
    assert_eq!(query.queries()[0].query_type(), RecordType::SRV);

    h.inject(&srv_answer("web", 80));
    assert_eq!(pending.await.unwrap().unwrap().port, 80);
    h.session.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_type_enumeration_reports_types() {
    let h = Harness::browsing(SessionConfig::default(), Browse::ServiceTypes).await;
    h.transport.wait_for_sent(1).await;

    let query = Message::from_vec(&h.transport.sent()[0].1).unwrap();
    assert_eq!(query.queries()[0].query_type(), RecordType::PTR);
    assert_eq!(query.queries()[0].name(), &name(&["_services", "_dns-sd", "_udp", "local"]));

    let meta = name(&["_services", "_dns-sd", "_udp", "local"]);
    let enumerated = |service: &str, ttl: u32| {
        Record::from_rdata(meta.clone(), ttl, RData::PTR(PTR(name(&[service, "_tcp", "local"]))))
    };
    h.inject(&response(vec![
        enumerated("_http", 4500),
        enumerated("_ipp", 4500),
        ptr("_http", "web", 120),
    ]));

    let ipp: ServiceType = "_ipp._tcp".parse().unwrap();
    assert_eq!(
        h.next_event().await,
        Event::ServiceTypeFound {
            service_type: http(),
            domain: "local".to_string()
        }
    );
    assert_eq!(
        h.next_event().await,
        Event::ServiceTypeFound {
            service_type: ipp.clone(),
            domain: "local".to_string()
        }
    );

    // repeats are quiet; instances are not this session's business
    h.inject(&response(vec![enumerated("_http", 4500)]));
    settle().await;
    assert!(h.drain().is_empty());
    assert!(h.session.snapshot().await.unwrap().is_empty());

    h.inject(&response(vec![enumerated("_ipp", 0)]));
    assert_eq!(
        h.next_event().await,
        Event::ServiceTypeLost {
            service_type: ipp,
            domain: "local".to_string()
        }
    );
    h.session.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_large_cache_splits_browse_query() {
    let h = Harness::listening(SessionConfig::default()).await;
    h.transport.wait_for_sent(1).await;

    for batch in 0..7 {
        let records = (0..100)
            .map(|i| ptr("_http", &format!("instance {}-{:03}", batch, i), 120))
            .collect();
        h.inject(&response(records));
    }
    settle().await;
    assert_eq!(h.drain().len(), 700);

    // next browse query at the 4s mark
    h.transport.wait_for_sent(2).await;
    settle().await;
    let sent = h.transport.sent();
    let packets = &sent[1..];
    assert!(packets.len() > 1);

    let mut answers = 0;
    for (i, (_, bytes)) in packets.iter().enumerate() {
        assert!(bytes.len() <= MAX_QUERY_SIZE);
        let message = Message::from_vec(bytes).unwrap();
        assert_eq!(message.truncated(), i + 1 < packets.len());
        answers += message.answers().len();
    }
    assert_eq!(answers, 700);
    assert_eq!(h.session.state(), SessionState::Listening);
    assert_eq!(h.session.stats().queries_sent, 2);
    h.session.stop().await;
}

#[test]
fn test_browse_parsing() {
    assert_eq!(
        Browse::parse_qualified("_services._dns-sd._udp").unwrap(),
        (Browse::ServiceTypes, None)
    );
    assert_eq!(
        Browse::parse_qualified("_Services._dns-sd._udp.Example.org.").unwrap(),
        (Browse::ServiceTypes, Some("example.org".to_string()))
    );
    assert_eq!(
        Browse::parse_qualified("_http._tcp").unwrap(),
        (Browse::Instances(http()), None)
    );
    assert!(Browse::parse_qualified("_services._dns-sd._udp..local").is_err());
    assert_eq!(Browse::ServiceTypes.to_string(), "_services._dns-sd._udp");
}
