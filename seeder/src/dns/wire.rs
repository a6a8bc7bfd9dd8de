//! The slice of the DNS wire format the responder needs (RFC 1035).
//!
//! Only the first question of a query is read. Responses echo that question
//! and point every answer's name back at it.

use std::fmt;
use std::net::Ipv4Addr;

/// Largest datagram read or written, no EDNS.
pub const MAX_DATAGRAM_SIZE: usize = 512;
pub const HEADER_LEN: usize = 12;
/// Longest encoded name, length octets included.
pub const MAX_NAME_LEN: usize = 255;
pub const TYPE_A: u16 = 1;
pub const CLASS_IN: u16 = 1;

const FLAG_QR: u16 = 0x8000;
const FLAG_AA: u16 = 0x0400;
const FLAG_TC: u16 = 0x0200;
const FLAG_RD: u16 = 0x0100;
const OPCODE_SHIFT: u16 = 11;
const OPCODE_MASK: u8 = 0x0f;
/// Compression pointer to the question name, which always starts right
/// after the header.
const QUESTION_NAME_POINTER: u16 = 0xc000 | HEADER_LEN as u16;
/// Encoded size of one A record with a compressed name.
const A_RECORD_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseCode {
    NoError = 0,
    FormatError = 1,
    ServerFailure = 2,
    /// NXDOMAIN.
    NameError = 3,
    NotImplemented = 4,
    Refused = 5,
}

/// Why a datagram was not a query we can answer. These are dropped silently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    Truncated,
    /// The QR bit is set.
    NotAQuery,
    NoQuestion,
    /// Compression pointers are not valid in the first question.
    CompressedName,
    NameTooLong,
    InvalidLabel,
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::Truncated => write!(f, "datagram is truncated"),
            WireError::NotAQuery => write!(f, "datagram is a response"),
            WireError::NoQuestion => write!(f, "query has no question"),
            WireError::CompressedName => write!(f, "question name is compressed"),
            WireError::NameTooLong => write!(f, "question name exceeds {MAX_NAME_LEN} octets"),
            WireError::InvalidLabel => write!(f, "question name has an invalid label"),
        }
    }
}

impl std::error::Error for WireError {}

/// A parsed DNS query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub id: u16,
    pub opcode: u8,
    pub recursion_desired: bool,
    /// Lowercase, dot separated, without a trailing dot.
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
    /// The question section exactly as received.
    question: Vec<u8>,
}

fn read_u16(datagram: &[u8], at: usize) -> Result<u16, WireError> {
    datagram
        .get(at..at + 2)
        .map(|bytes| u16::from_be_bytes([bytes[0], bytes[1]]))
        .ok_or(WireError::Truncated)
}

/// Parses the header and first question of `datagram`.
pub fn parse_query(datagram: &[u8]) -> Result<Query, WireError> {
    if datagram.len() < HEADER_LEN {
        return Err(WireError::Truncated);
    }
    let id = read_u16(datagram, 0)?;
    let flags = read_u16(datagram, 2)?;
    if flags & FLAG_QR != 0 {
        return Err(WireError::NotAQuery);
    }
    if read_u16(datagram, 4)? == 0 {
        return Err(WireError::NoQuestion);
    }

    let mut labels: Vec<String> = Vec::new();
    let mut position = HEADER_LEN;
    let mut encoded_len = 0;
    loop {
        let len = *datagram.get(position).ok_or(WireError::Truncated)? as usize;
        position += 1;
        encoded_len += 1;
        if len == 0 {
            break;
        }
        if len & 0xc0 != 0 {
            return Err(WireError::CompressedName);
        }
        encoded_len += len;
        if encoded_len > MAX_NAME_LEN {
            return Err(WireError::NameTooLong);
        }
        let label = datagram
            .get(position..position + len)
            .ok_or(WireError::Truncated)?;
        let label = std::str::from_utf8(label).map_err(|_| WireError::InvalidLabel)?;
        if label.contains('.') {
            return Err(WireError::InvalidLabel);
        }
        labels.push(label.to_ascii_lowercase());
        position += len;
    }
    let qtype = read_u16(datagram, position)?;
    let qclass = read_u16(datagram, position + 2)?;

    Ok(Query {
        id,
        opcode: ((flags >> OPCODE_SHIFT) as u8) & OPCODE_MASK,
        recursion_desired: flags & FLAG_RD != 0,
        name: labels.join("."),
        qtype,
        qclass,
        question: datagram[HEADER_LEN..position + 4].to_vec(),
    })
}

/// Builds an authoritative response to `query`.
///
/// `answers` become A records and should be empty unless `rcode` is
/// [`ResponseCode::NoError`]. Answers that would push the response past
/// [`MAX_DATAGRAM_SIZE`] are left out and the TC bit is set.
pub fn encode_response(
    query: &Query,
    rcode: ResponseCode,
    answers: &[Ipv4Addr],
    ttl: u32,
) -> Vec<u8> {
    let room = MAX_DATAGRAM_SIZE.saturating_sub(HEADER_LEN + query.question.len()) / A_RECORD_LEN;
    let mut flags = FLAG_QR | FLAG_AA | (u16::from(query.opcode) << OPCODE_SHIFT) | rcode as u16;
    if query.recursion_desired {
        flags |= FLAG_RD;
    }
    if answers.len() > room {
        flags |= FLAG_TC;
    }
    let answers = &answers[..answers.len().min(room)];

    let mut response =
        Vec::with_capacity(HEADER_LEN + query.question.len() + answers.len() * A_RECORD_LEN);
    response.extend_from_slice(&query.id.to_be_bytes());
    response.extend_from_slice(&flags.to_be_bytes());
    response.extend_from_slice(&1u16.to_be_bytes());
    response.extend_from_slice(&(answers.len() as u16).to_be_bytes());
    response.extend_from_slice(&0u16.to_be_bytes());
    response.extend_from_slice(&0u16.to_be_bytes());
    response.extend_from_slice(&query.question);

    for ip in answers {
        response.extend_from_slice(&QUESTION_NAME_POINTER.to_be_bytes());
        response.extend_from_slice(&TYPE_A.to_be_bytes());
        response.extend_from_slice(&CLASS_IN.to_be_bytes());
        response.extend_from_slice(&ttl.to_be_bytes());
        response.extend_from_slice(&4u16.to_be_bytes());
        response.extend_from_slice(&ip.octets());
    }
    response
}
