//! Query handling: answers A questions from the record table.

use async_trait::async_trait;
use hickory_proto::op::{Header, LowerQuery, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{DNSClass, RData, Record, RecordType};
use hickory_server::authority::MessageResponseBuilder;
use hickory_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};
use std::net::Ipv4Addr;
use tracing::{debug, error, trace, warn};

use crate::metrics::{Metrics, QueryResult, Timer};
use crate::state::RecordStore;

/// Answer records are never cacheable: every lookup must come back here.
pub const ANSWER_TTL: u32 = 0;

/// Outcome of answering a request, before it is encoded.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    /// Response code to send.
    pub response_code: ResponseCode,
    /// Whether the AA flag is set.
    pub authoritative: bool,
    /// At most one address record.
    pub answer: Option<Record>,
}

impl Reply {
    fn empty(response_code: ResponseCode, authoritative: bool) -> Self {
        Self {
            response_code,
            authoritative,
            answer: None,
        }
    }
}

/// Request handler serving the published address of each service.
#[derive(Debug, Clone)]
pub struct QueryResponder {
    store: RecordStore,
    metrics: Metrics,
}

impl QueryResponder {
    /// Create a responder reading from `store` and reporting to `metrics`.
    pub fn new(store: RecordStore, metrics: Metrics) -> Self {
        Self { store, metrics }
    }

    /// Build the reply for a request's questions. Only the first question is
    /// considered.
    pub fn answer(&self, queries: &[LowerQuery]) -> Reply {
        let timer = Timer::start();

        let Some(query) = queries.first() else {
            debug!("request without a question");
            self.metrics
                .record_query("NONE", QueryResult::Error, timer.elapsed());
            return Reply::empty(ResponseCode::FormErr, false);
        };

        let rtype = query.query_type();
        let rtype_str = rtype.to_string();

        if rtype != RecordType::A {
            trace!(name = %query.name(), rtype = ?rtype, "Unsupported record type");
            self.metrics
                .record_query(&rtype_str, QueryResult::Unsupported, timer.elapsed());
            return Reply::empty(ResponseCode::NoError, false);
        }

        let mut domain = query.name().to_string();
        if !domain.ends_with('.') {
            domain.push('.');
        }

        let Some(address) = self.store.lookup(&domain) else {
            debug!(name = %domain, "A lookup: no record");
            self.metrics
                .record_query(&rtype_str, QueryResult::NxDomain, timer.elapsed());
            return Reply::empty(ResponseCode::NXDomain, true);
        };

        let ip: Ipv4Addr = match address.parse() {
            Ok(ip) => ip,
            Err(_) => {
                warn!(name = %domain, address = %address, "published address is not IPv4");
                self.metrics
                    .record_query(&rtype_str, QueryResult::Error, timer.elapsed());
                return Reply::empty(ResponseCode::ServFail, true);
            }
        };

        let mut record = Record::from_rdata(
            query.original().name().clone(),
            ANSWER_TTL,
            RData::A(A::from(ip)),
        );
        record.set_dns_class(DNSClass::IN);

        debug!(name = %domain, address = %address, "A lookup: returning record");
        self.metrics.record_served(&domain, &address);
        self.metrics
            .record_query(&rtype_str, QueryResult::Success, timer.elapsed());

        Reply {
            response_code: ResponseCode::NoError,
            authoritative: true,
            answer: Some(record),
        }
    }
}

#[async_trait]
impl RequestHandler for QueryResponder {
    async fn handle_request<R: ResponseHandler>(
        &self,
        request: &Request,
        mut response_handle: R,
    ) -> ResponseInfo {
        let reply = self.answer(request.queries());

        let mut header = Header::response_from_request(request.header());
        header.set_authoritative(reply.authoritative);
        header.set_response_code(reply.response_code);

        let response = MessageResponseBuilder::from_message_request(request).build(
            header,
            reply.answer.iter(),
            std::iter::empty(),
            std::iter::empty(),
            std::iter::empty(),
        );

        match response_handle.send_response(response).await {
            Ok(info) => info,
            Err(e) => {
                error!(src = %request.src(), "failed to send response: {}", e);
                let mut header = Header::new();
                header.set_response_code(ResponseCode::ServFail);
                header.into()
            }
        }
    }
}
