//! Shared test infrastructure for query and lifecycle integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{DNSClass, Name, RData, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinDecoder, BinEncoder};
use hickory_server::authority::{MessageRequest, MessageResponse};
use hickory_server::proto::rr::Record;
use hickory_server::proto::xfer::Protocol;
use hickory_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};
use tokio::sync::watch;

use consul_dns::config::{Config, ConsulConfig, TelemetryConfig};
use consul_dns::{DnsError, HealthSnapshot, HealthSource};

// --- Constants ---

pub const ZONE: &str = "z";

// --- TestResponseHandler ---

/// Captures the serialized DNS response for inspection in tests.
///
/// The response is serialized via `MessageResponse::destructive_emit()` and
/// stored as raw wire-format bytes, which are parsed back with
/// `Message::from_vec()`.
#[derive(Clone)]
pub struct TestResponseHandler {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl TestResponseHandler {
    pub fn new() -> Self {
        Self {
            buf: Arc::new(Mutex::new(Vec::with_capacity(512))),
        }
    }

    /// Parse the captured wire bytes into a `Message` for assertions.
    pub fn into_message(self) -> Message {
        let buf = self.buf.lock().unwrap();
        assert!(!buf.is_empty(), "no response was captured");
        Message::from_vec(&buf).expect("failed to parse captured DNS response")
    }
}

#[async_trait]
impl ResponseHandler for TestResponseHandler {
    async fn send_response<'a>(
        &mut self,
        response: MessageResponse<
            '_,
            'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
        >,
    ) -> io::Result<ResponseInfo> {
        let mut buf = self.buf.lock().unwrap();
        buf.clear();
        let mut encoder = BinEncoder::new(&mut *buf);
        encoder.set_max_size(u16::MAX);
        let info = response
            .destructive_emit(&mut encoder)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(info)
    }
}

// --- Query/Request construction ---

/// Build a query message with one question per `(name, type)` pair.
pub fn build_query_message(questions: &[(&str, RecordType)], id: u16) -> Message {
    let mut msg = Message::new();
    msg.set_id(id);
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(true);
    for (name, record_type) in questions {
        let mut query = Query::new();
        query.set_name(Name::from_ascii(name).unwrap());
        query.set_query_type(*record_type);
        query.set_query_class(DNSClass::IN);
        msg.add_query(query);
    }
    msg
}

/// Build wire-format bytes for a single-question DNS query.
pub fn build_query_bytes(name: &str, record_type: RecordType, id: u16) -> Vec<u8> {
    build_query_message(&[(name, record_type)], id)
        .to_vec()
        .unwrap()
}

/// Parse wire bytes into a MessageRequest.
pub fn parse_message_request(bytes: &[u8]) -> MessageRequest {
    let mut decoder = BinDecoder::new(bytes);
    MessageRequest::read(&mut decoder).expect("failed to parse MessageRequest")
}

/// Build a full `Request` from a query message.
pub fn build_request(msg: &Message) -> Request {
    let bytes = msg.to_vec().unwrap();
    let src: SocketAddr = "10.9.9.9:12345".parse().unwrap();
    Request::new(parse_message_request(&bytes), src, Protocol::Udp)
}

// --- Response helpers ---

/// Run a query message through `handler` and return the parsed response.
pub async fn execute<H: RequestHandler>(handler: &H, msg: &Message) -> Message {
    let request = build_request(msg);
    let response = TestResponseHandler::new();
    handler.handle_request(&request, response.clone()).await;
    response.into_message()
}

/// Run a single-question query through `handler`.
pub async fn execute_query<H: RequestHandler>(
    handler: &H,
    name: &str,
    record_type: RecordType,
    id: u16,
) -> Message {
    execute(handler, &build_query_message(&[(name, record_type)], id)).await
}

/// Extract A addresses from a response.
pub fn extract_a_ips(msg: &Message) -> Vec<Ipv4Addr> {
    msg.answers()
        .iter()
        .filter_map(|r| match r.data() {
            RData::A(a) => Some(Ipv4Addr::from(*a)),
            _ => None,
        })
        .collect()
}

/// Assert response code.
pub fn assert_response_code(msg: &Message, expected: ResponseCode) {
    assert_eq!(
        msg.response_code(),
        expected,
        "expected {:?}, got {:?}",
        expected,
        msg.response_code()
    );
}

/// Assert an authoritative answer carrying exactly `expected`.
pub fn assert_a_response(msg: &Message, expected: &str) {
    assert_response_code(msg, ResponseCode::NoError);
    assert!(msg.authoritative(), "answer must be authoritative");
    assert_eq!(extract_a_ips(msg), vec![expected.parse::<Ipv4Addr>().unwrap()]);
    assert_eq!(msg.answers()[0].ttl(), 0);
}

// --- Config builder ---

pub fn test_config(services: &[&str]) -> Config {
    Config {
        bind: "127.0.0.1:0".to_string(),
        metrics_listen: "127.0.0.1:0".to_string(),
        zone: ZONE.to_string(),
        services: services.iter().map(|s| s.to_string()).collect(),
        consul: ConsulConfig {
            min_interval_ms: 10,
            ..ConsulConfig::default()
        },
        telemetry: TelemetryConfig::default(),
    }
}

// --- Health source ---

/// Health source whose per-service answers are set by the test.
///
/// Each fetch returns the current addresses for the service; with an index
/// it waits for the next `set` (like a Consul blocking query).
#[derive(Clone)]
pub struct FakeRegistry {
    state: Arc<watch::Sender<(u64, HashMap<String, Vec<String>>)>>,
}

impl FakeRegistry {
    pub fn new() -> Self {
        let (state, _) = watch::channel((1, HashMap::new()));
        Self {
            state: Arc::new(state),
        }
    }

    /// Replace the healthy addresses of `service`.
    pub fn set(&self, service: &str, addresses: &[&str]) {
        self.state.send_modify(|(index, services)| {
            *index += 1;
            services.insert(
                service.to_string(),
                addresses.iter().map(|a| a.to_string()).collect(),
            );
        });
    }
}

#[async_trait]
impl HealthSource for FakeRegistry {
    async fn fetch(&self, service: &str, index: Option<u64>) -> Result<HealthSnapshot, DnsError> {
        let mut rx = self.state.subscribe();
        if let Some(index) = index {
            // Sender lives in self, so this never errors.
            let _ = rx.wait_for(|(current, _)| *current > index).await;
        }

        let state = rx.borrow();
        Ok(HealthSnapshot {
            addresses: state.1.get(service).cloned().unwrap_or_default(),
            index: Some(state.0),
        })
    }
}
