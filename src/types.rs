//! Basic types for the sinkhole resolver

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType { A, NS, CNAME, SOA, PTR, MX, TXT, AAAA, SRV, ANY, Unknown(u16) }

impl RecordType {
    pub fn from_u16(value: u16) -> Self {
        match value {
            1 => Self::A,
            2 => Self::NS,
            5 => Self::CNAME,
            6 => Self::SOA,
            12 => Self::PTR,
            15 => Self::MX,
            16 => Self::TXT,
            28 => Self::AAAA,
            33 => Self::SRV,
            255 => Self::ANY,
            n => Self::Unknown(n),
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            Self::A => 1,
            Self::NS => 2,
            Self::CNAME => 5,
            Self::SOA => 6,
            Self::PTR => 12,
            Self::MX => 15,
            Self::TXT => 16,
            Self::AAAA => 28,
            Self::SRV => 33,
            Self::ANY => 255,
            Self::Unknown(n) => n,
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(n) => write!(f, "TYPE{}", n),
            other => write!(f, "{:?}", other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordClass { IN, CH, HS, Unknown(u16) }

impl RecordClass {
    pub fn from_u16(value: u16) -> Self {
        match value {
            1 => Self::IN,
            3 => Self::CH,
            4 => Self::HS,
            n => Self::Unknown(n),
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            Self::IN => 1,
            Self::CH => 3,
            Self::HS => 4,
            Self::Unknown(n) => n,
        }
    }
}

/// A domain name as a sequence of raw labels, kept exactly as received so the
/// question section can be echoed back unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Name {
    pub labels: Vec<Vec<u8>>,
}

impl Name {
    /// Splits a dotted name from configuration into labels.
    pub fn from_ascii(name: &str) -> Self {
        let labels = name
            .trim_end_matches('.')
            .split('.')
            .filter(|l| !l.is_empty())
            .map(|l| l.as_bytes().to_vec())
            .collect();
        Self { labels }
    }

    /// Lower-cased dotted form used for policy matching and answer names.
    pub fn to_lowercase_string(&self) -> String {
        self.to_string().to_ascii_lowercase()
    }

    pub fn to_lowercase(&self) -> Self {
        Self { labels: self.labels.iter().map(|l| l.to_ascii_lowercase()).collect() }
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, label) in self.labels.iter().enumerate() {
            if i > 0 { f.write_str(".")?; }
            f.write_str(&String::from_utf8_lossy(label))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question { pub name: Name, pub qtype: RecordType, pub qclass: RecordClass }

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub id: u16,
    pub flags: u16,
    pub questions: Vec<Question>,
}

/// An A record. Other record types are never produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRecord {
    pub name: Name,
    pub rtype: RecordType,
    pub rclass: RecordClass,
    pub ttl: u32,
    pub addr: Ipv4Addr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub id: u16,
    pub flags: u16,
    pub questions: Vec<Question>,
    pub answers: Vec<ResourceRecord>,
}

/// Per-datagram context threaded through a zone's plugin chain.
#[derive(Debug, Clone, Default)]
pub struct DnsMessage {
    pub raw_query: Vec<u8>,
    pub query: Option<Query>,
    pub response: Option<Response>,
    pub halt_chain: bool,

    pub client_addr: Option<SocketAddr>,
    pub server_port: Option<u16>,
    pub answered_by: String,
}

impl DnsMessage {
    pub fn new(raw_query: Vec<u8>, query: Query, client_addr: SocketAddr, server_port: u16) -> Self {
        Self {
            raw_query,
            query: Some(query),
            client_addr: Some(client_addr),
            server_port: Some(server_port),
            ..Default::default()
        }
    }
}
