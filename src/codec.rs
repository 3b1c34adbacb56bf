//! RFC 1035 wire format: query decoding and A-record response encoding

use crate::types::{Name, Query, Question, RecordClass, RecordType, Response};
use thiserror::Error;

pub const HEADER_LEN: usize = 12;
pub const FLAG_QR: u16 = 0x8000;
pub const FLAG_TC: u16 = 0x0200;
pub const RCODE_MASK: u16 = 0x000F;
pub const MAX_UDP_PAYLOAD: usize = 512;

const MAX_NAME_LEN: usize = 255;
const MAX_POINTER_HOPS: usize = 16;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("message is {0} bytes, shorter than the 12-byte header")]
    ShortHeader(usize),

    #[error("label at offset {0} runs past the end of the message")]
    LabelOverrun(usize),

    #[error("question ending at offset {0} is missing its type/class")]
    TruncatedQuestion(usize),

    #[error("reserved label type {0:#04x}")]
    BadLabelType(u8),

    #[error("compression pointer loop at offset {0}")]
    PointerLoop(usize),

    #[error("name exceeds 255 octets")]
    NameTooLong,

    #[error("message carries no questions")]
    EmptyQuestionSection,

    #[error("message carries {0} questions, only one is answered")]
    MultipleQuestions(u16),
}

impl CodecError {
    /// Everything except an empty question section is corrupt or non-DNS traffic.
    pub fn is_malformed(&self) -> bool {
        !matches!(self, CodecError::EmptyQuestionSection)
    }
}

/// Decodes the header and the single question of a query. Answer, authority
/// and additional sections are never forwarded and are left unparsed.
pub fn decode(buf: &[u8]) -> Result<Query, CodecError> {
    read_query(buf).map(|(query, _)| query)
}

fn read_query(buf: &[u8]) -> Result<(Query, usize), CodecError> {
    if buf.len() < HEADER_LEN {
        return Err(CodecError::ShortHeader(buf.len()));
    }

    let id = read_u16(buf, 0);
    let flags = read_u16(buf, 2);
    let qdcount = read_u16(buf, 4);
    match qdcount {
        0 => return Err(CodecError::EmptyQuestionSection),
        1 => {}
        n => return Err(CodecError::MultipleQuestions(n)),
    }

    let (name, next) = read_name(buf, HEADER_LEN)?;
    if next + 4 > buf.len() {
        return Err(CodecError::TruncatedQuestion(next));
    }
    let question = Question {
        name,
        qtype: RecordType::from_u16(read_u16(buf, next)),
        qclass: RecordClass::from_u16(read_u16(buf, next + 2)),
    };

    Ok((Query { id, flags, questions: vec![question] }, next + 4))
}

/// Reads a possibly-compressed name starting at `start`. Returns the name and
/// the offset just past it in the original byte stream.
fn read_name(buf: &[u8], start: usize) -> Result<(Name, usize), CodecError> {
    let mut labels = Vec::new();
    let mut pos = start;
    let mut resume_at = None;
    let mut hops = 0;
    let mut wire_len = 1;

    loop {
        let len_byte = *buf.get(pos).ok_or(CodecError::LabelOverrun(pos))?;
        match len_byte & 0xC0 {
            0x00 => {
                let len = usize::from(len_byte);
                if len == 0 {
                    pos += 1;
                    break;
                }
                let label = buf.get(pos + 1..pos + 1 + len).ok_or(CodecError::LabelOverrun(pos))?;
                wire_len += len + 1;
                if wire_len > MAX_NAME_LEN {
                    return Err(CodecError::NameTooLong);
                }
                labels.push(label.to_vec());
                pos += 1 + len;
            }
            0xC0 => {
                let low = *buf.get(pos + 1).ok_or(CodecError::LabelOverrun(pos))?;
                hops += 1;
                if hops > MAX_POINTER_HOPS {
                    return Err(CodecError::PointerLoop(pos));
                }
                resume_at.get_or_insert(pos + 2);
                pos = (usize::from(len_byte & 0x3F) << 8) | usize::from(low);
            }
            _ => return Err(CodecError::BadLabelType(len_byte)),
        }
    }

    Ok((Name { labels }, resume_at.unwrap_or(pos)))
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([buf[at], buf[at + 1]])
}

/// Serializes a response. Names are written uncompressed, so a question that
/// arrived with a compression pointer is echoed in its expanded form. The QR
/// bit is always set regardless of what `flags` carries.
///
/// A reply that would exceed [`MAX_UDP_PAYLOAD`] loses its whole answer
/// section and gets TC set; records are never cut in half.
pub fn encode(response: &Response) -> Vec<u8> {
    let mut out = Vec::with_capacity(MAX_UDP_PAYLOAD);
    out.extend_from_slice(&response.id.to_be_bytes());
    out.extend_from_slice(&(response.flags | FLAG_QR).to_be_bytes());
    out.extend_from_slice(&(response.questions.len() as u16).to_be_bytes());
    out.extend_from_slice(&(response.answers.len() as u16).to_be_bytes());
    out.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);

    for q in &response.questions {
        write_name(&mut out, &q.name);
        out.extend_from_slice(&q.qtype.to_u16().to_be_bytes());
        out.extend_from_slice(&q.qclass.to_u16().to_be_bytes());
    }
    let question_end = out.len();

    for rr in &response.answers {
        write_name(&mut out, &rr.name);
        out.extend_from_slice(&rr.rtype.to_u16().to_be_bytes());
        out.extend_from_slice(&rr.rclass.to_u16().to_be_bytes());
        out.extend_from_slice(&rr.ttl.to_be_bytes());
        out.extend_from_slice(&4u16.to_be_bytes());
        out.extend_from_slice(&rr.addr.octets());
    }

    if out.len() > MAX_UDP_PAYLOAD {
        out.truncate(question_end);
        out[2] |= (FLAG_TC >> 8) as u8;
        out[6..8].copy_from_slice(&0u16.to_be_bytes());
    }

    out
}

// Labels come from `read_name`, so each is at most 63 octets.
fn write_name(out: &mut Vec<u8>, name: &Name) {
    for label in &name.labels {
        out.push(label.len() as u8);
        out.extend_from_slice(label);
    }
    out.push(0);
}

/// Decodes an encoded response, including its A answers. Only the test suite
/// needs to read our own output back.
#[cfg(test)]
pub(crate) fn decode_response(buf: &[u8]) -> Result<Response, CodecError> {
    use crate::types::ResourceRecord;
    use std::net::Ipv4Addr;

    let (query, mut pos) = read_query(buf)?;
    let ancount = read_u16(buf, 6);
    let mut answers = Vec::new();
    for _ in 0..ancount {
        let (name, next) = read_name(buf, pos)?;
        if next + 10 > buf.len() {
            return Err(CodecError::TruncatedQuestion(next));
        }
        let rdlen = usize::from(read_u16(buf, next + 8));
        let rdata = buf.get(next + 10..next + 10 + rdlen).ok_or(CodecError::LabelOverrun(next))?;
        if rdlen == 4 {
            answers.push(ResourceRecord {
                name,
                rtype: RecordType::from_u16(read_u16(buf, next)),
                rclass: RecordClass::from_u16(read_u16(buf, next + 2)),
                ttl: u32::from_be_bytes([buf[next + 4], buf[next + 5], buf[next + 6], buf[next + 7]]),
                addr: Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]),
            });
        }
        pos = next + 10 + rdlen;
    }
    Ok(Response { id: query.id, flags: query.flags, questions: query.questions, answers })
}

#[cfg(test)]
pub(crate) fn build_query(id: u16, names: &[(&str, u16)]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&id.to_be_bytes());
    buf.extend_from_slice(&[0x01, 0x00]);
    buf.extend_from_slice(&(names.len() as u16).to_be_bytes());
    buf.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
    for (name, qtype) in names {
        write_name(&mut buf, &Name::from_ascii(name));
        buf.extend_from_slice(&qtype.to_be_bytes());
        buf.extend_from_slice(&1u16.to_be_bytes());
    }
    buf
}
