//! Allow-list table and the responder that turns a query into an A answer

use crate::codec::{FLAG_QR, FLAG_TC, RCODE_MASK};
use crate::types::{Name, Query, RecordClass, RecordType, ResourceRecord, Response};
use std::collections::HashMap;
use std::net::Ipv4Addr;

pub const ANSWER_TTL: u32 = 300;
pub const DEFAULT_SINKHOLE: Ipv4Addr = Ipv4Addr::UNSPECIFIED;

/// Domain → address allow-list. Built once per configuration generation and
/// only ever read afterwards.
///
/// Keys are lower-cased label sequences, so a single wire label that happens
/// to contain a dot never matches a multi-label entry.
#[derive(Debug, Clone)]
pub struct PolicyTable {
    entries: HashMap<Vec<Vec<u8>>, Ipv4Addr>,
    sinkhole: Ipv4Addr,
}

impl Default for PolicyTable {
    fn default() -> Self { Self::new(DEFAULT_SINKHOLE) }
}

impl PolicyTable {
    pub fn new(sinkhole: Ipv4Addr) -> Self {
        Self { entries: HashMap::new(), sinkhole }
    }

    pub fn insert(&mut self, domain: &str, addr: Ipv4Addr) -> Option<Ipv4Addr> {
        self.entries.insert(Name::from_ascii(domain).to_lowercase().labels, addr)
    }

    pub fn lookup(&self, name: &Name) -> Ipv4Addr {
        self.entries.get(&name.to_lowercase().labels).copied().unwrap_or(self.sinkhole)
    }

    pub fn sinkhole(&self) -> Ipv4Addr { self.sinkhole }

    pub fn len(&self) -> usize { self.entries.len() }

    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    /// Entries in name order, for startup logging.
    pub fn entries(&self) -> Vec<(String, Ipv4Addr)> {
        let mut out: Vec<_> = self.entries.iter()
            .map(|(labels, addr)| (Name { labels: labels.clone() }.to_string(), *addr))
            .collect();
        out.sort_unstable();
        out
    }
}

/// Builds the single-answer response for the first question. Returns `None`
/// when there is nothing to answer; the caller drops the datagram.
///
/// Every question type gets an A answer, AAAA and CNAME included.
pub fn resolve(query: &Query, table: &PolicyTable) -> Option<Response> {
    let question = query.questions.first()?;
    let name = question.name.to_lowercase();
    let addr = table.lookup(&name);

    Some(Response {
        id: query.id,
        flags: (query.flags | FLAG_QR) & !(FLAG_TC | RCODE_MASK),
        questions: query.questions.clone(),
        answers: vec![ResourceRecord {
            name,
            rtype: RecordType::A,
            rclass: RecordClass::IN,
            ttl: ANSWER_TTL,
            addr,
        }],
    })
}
