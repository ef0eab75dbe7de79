/*! Constants and models for FCGI wire records.

Pure encode/decode, no I/O. Everything on the wire is network byte order and
no alignment beyond the fixed 8 byte header may be assumed.

```
use bytes::{Bytes, BytesMut};
use fcgi_engine::fastcgi::*;
let mut buf = BytesMut::new();
Header::new(RecordType::Stdout, 1, 2).write_into(&mut buf);
let pair = NameValuePair::new(
    Bytes::from_static(b"REQUEST_METHOD"),
    Bytes::from_static(b"GET"));
pair.write_into(&mut buf);
```
*/
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// Number of bytes in a Header.
///
/// Future versions of the protocol will not reduce this number.
pub const HEADER_LEN: usize = 8;

/// version component of Header
pub const VERSION_1: u8 = 1;

/// Maximum content length per record.
///
/// Larger payloads span multiple records of the same type and are
/// concatenated again by the consumer.
pub const MAX_CONTENT_LEN: usize = 0xffff;

/// Request id of management records (`GetValues` / `GetValuesResult`).
pub const MGMT_REQUEST_ID: u16 = 0;

/// Names for GET_VALUES / GET_VALUES_RESULT records.
///
/// The maximum number of concurrent transport connections this application will accept, e.g. "1" or "10".
pub const MAX_CONNS: &[u8] = b"FCGI_MAX_CONNS";

/// Names for GET_VALUES / GET_VALUES_RESULT records.
///
/// The maximum number of concurrent requests this application will accept, e.g. "1" or "50".
pub const MAX_REQS: &[u8] = b"FCGI_MAX_REQS";

/// Names for GET_VALUES / GET_VALUES_RESULT records.
///
/// "1" if this application multiplexes connections (i.e. handles concurrent requests over each connection), "0" otherwise.
pub const MPXS_CONNS: &[u8] = b"FCGI_MPXS_CONNS";

/// type component of Header.
///
/// A request id becomes active when `BeginRequest` arrives for it and
/// inactive once the application has sent `EndRequest` for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    /// The Web server starts a request
    BeginRequest,
    /// The Web server aborts a request, e.g. because the HTTP client
    /// closed its transport connection
    AbortRequest,
    /// The application terminates a request
    EndRequest,
    /// Name-value pairs from the Web server to the application
    Params,
    /// Byte stream: request body
    Stdin,
    /// Byte stream: response body
    Stdout,
    /// Byte stream: diagnostics
    Stderr,
    /// Byte stream: extra file data for the Filter role
    Data,
    /// The Web server queries management variables
    GetValues,
    /// The application answers a `GetValues`
    GetValuesResult,
    /// The application received a management record it does not implement
    UnknownType,
    /// Any numeric value outside the known set
    Invalid(u8),
}

impl RecordType {
    pub fn from_u8(t: u8) -> RecordType {
        match t {
            1 => RecordType::BeginRequest,
            2 => RecordType::AbortRequest,
            3 => RecordType::EndRequest,
            4 => RecordType::Params,
            5 => RecordType::Stdin,
            6 => RecordType::Stdout,
            7 => RecordType::Stderr,
            8 => RecordType::Data,
            9 => RecordType::GetValues,
            10 => RecordType::GetValuesResult,
            11 => RecordType::UnknownType,
            t => RecordType::Invalid(t),
        }
    }
    pub fn to_u8(self) -> u8 {
        match self {
            RecordType::BeginRequest => 1,
            RecordType::AbortRequest => 2,
            RecordType::EndRequest => 3,
            RecordType::Params => 4,
            RecordType::Stdin => 5,
            RecordType::Stdout => 6,
            RecordType::Stderr => 7,
            RecordType::Data => 8,
            RecordType::GetValues => 9,
            RecordType::GetValuesResult => 10,
            RecordType::UnknownType => 11,
            RecordType::Invalid(t) => t,
        }
    }
}

/// role component of BeginRequestBody
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// emulated CGI/1.1 program
    Responder,
    /// authorized/unauthorized decision
    Authorizer,
    /// extra stream of data from a file
    Filter,
}

impl Role {
    /// Unknown role values decode to `None`; the request state machine
    /// rejects them with `ProtocolStatus::UnknownRole`, not this layer.
    pub fn from_u16(role: u16) -> Option<Role> {
        match role {
            1 => Some(Role::Responder),
            2 => Some(Role::Authorizer),
            3 => Some(Role::Filter),
            _ => None,
        }
    }
    pub fn to_u16(self) -> u16 {
        match self {
            Role::Responder => 1,
            Role::Authorizer => 2,
            Role::Filter => 3,
        }
    }
}

/// protocol_status component of EndRequestBody
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolStatus {
    /// Normal end of request
    RequestComplete,
    /// Application is designed to process one request at a time per connection
    CantMultiplexConnections,
    /// The application runs out of some resource, e.g. worker slots
    Overloaded,
    /// Web server has specified a role that is unknown to the application
    UnknownRole,
}

impl ProtocolStatus {
    pub fn to_u8(self) -> u8 {
        match self {
            ProtocolStatus::RequestComplete => 0,
            ProtocolStatus::CantMultiplexConnections => 1,
            ProtocolStatus::Overloaded => 2,
            ProtocolStatus::UnknownRole => 3,
        }
    }
    pub fn from_u8(status: u8) -> Option<ProtocolStatus> {
        match status {
            0 => Some(ProtocolStatus::RequestComplete),
            1 => Some(ProtocolStatus::CantMultiplexConnections),
            2 => Some(ProtocolStatus::Overloaded),
            3 => Some(ProtocolStatus::UnknownRole),
            _ => None,
        }
    }
}

/// FCGI record header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub rtype: RecordType,
    pub request_id: u16,
    pub content_length: u16,
    /// zero bytes after the body, align record to a multiple of 8
    pub padding_length: u8,
}

impl Header {
    /// New header with the padding needed to round the record to 8 bytes.
    pub fn new(rtype: RecordType, request_id: u16, len: u16) -> Header {
        let mut pad: u8 = (len % 8) as u8;
        if pad != 0 {
            pad = 8 - pad;
        }
        Header {
            version: VERSION_1,
            rtype,
            request_id,
            content_length: len,
            padding_length: pad,
        }
    }

    pub fn write_into(&self, data: &mut BytesMut) {
        data.put_u8(self.version);
        data.put_u8(self.rtype.to_u8());
        data.put_u16(self.request_id);
        data.put_u16(self.content_length);
        data.put_u8(self.padding_length);
        data.put_u8(0); // reserved
    }

    /// Decode the fixed 8 byte header. Does not validate the version,
    /// the transceiver decides whether a connection dies over it.
    pub fn parse(data: &[u8]) -> Result<Header, ProtocolError> {
        if data.len() < HEADER_LEN {
            return Err(ProtocolError::Truncated);
        }
        let mut data = &data[..HEADER_LEN];
        let h = Header {
            version: data.get_u8(),
            rtype: RecordType::from_u8(data.get_u8()),
            request_id: data.get_u16(),
            content_length: data.get_u16(),
            padding_length: data.get_u8(),
        };
        // 1 reserved byte left unread
        Ok(h)
    }

    /// body + padding bytes following this header on the wire
    pub fn body_len(&self) -> usize {
        self.content_length as usize + self.padding_length as usize
    }
}

/// Body of a `BeginRequest` record
#[derive(Debug, Clone, Copy)]
pub struct BeginRequestBody {
    role: u16,
    flags: u8,
}

impl BeginRequestBody {
    /// Mask for flags component of BeginRequestBody
    pub const KEEP_CONN: u8 = 1;

    /// Number of bytes in the body.
    pub const LEN: usize = 8;

    pub fn new(role: Role, flags: u8) -> BeginRequestBody {
        BeginRequestBody {
            role: role.to_u16(),
            flags,
        }
    }

    pub fn parse(data: &[u8]) -> Result<BeginRequestBody, ProtocolError> {
        if data.len() < Self::LEN {
            return Err(ProtocolError::Truncated);
        }
        let mut data = &data[..Self::LEN];
        let b = BeginRequestBody {
            role: data.get_u16(),
            flags: data.get_u8(),
        };
        // 5 reserved bytes
        Ok(b)
    }

    pub fn write_into(&self, data: &mut BytesMut) {
        data.put_u16(self.role);
        data.put_u8(self.flags);
        data.put_slice(&[0; 5]); // reserved
    }

    /// Raw role value as sent by the peer.
    pub fn raw_role(&self) -> u16 {
        self.role
    }

    /// `None` for role values outside the known set.
    pub fn role(&self) -> Option<Role> {
        Role::from_u16(self.role)
    }

    /// The peer may reuse the connection after this request ends.
    pub fn keep_conn(&self) -> bool {
        self.flags & Self::KEEP_CONN != 0
    }
}

/// Body of an `EndRequest` record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndRequestBody {
    pub app_status: i32,
    pub protocol_status: u8,
}

impl EndRequestBody {
    /// Number of bytes in the body.
    pub const LEN: usize = 8;

    pub fn encode(app_status: i32, status: ProtocolStatus) -> [u8; 8] {
        let mut body = [0u8; 8];
        body[..4].copy_from_slice(&app_status.to_be_bytes());
        body[4] = status.to_u8();
        // 3 reserved bytes
        body
    }

    pub fn parse(data: &[u8]) -> Result<EndRequestBody, ProtocolError> {
        if data.len() < Self::LEN {
            return Err(ProtocolError::Truncated);
        }
        let mut data = &data[..Self::LEN];
        let b = EndRequestBody {
            app_status: data.get_i32(),
            protocol_status: data.get_u8(),
        };
        Ok(b)
    }
}

/// Body of an `UnknownType` record, echoing the offending type value
#[derive(Debug, Clone, Copy)]
pub struct UnknownTypeBody;

impl UnknownTypeBody {
    /// Number of bytes in the body.
    pub const LEN: usize = 8;

    pub fn encode(rtype: u8) -> [u8; 8] {
        let mut body = [0u8; 8];
        body[0] = rtype;
        // 7 reserved bytes
        body
    }
}

/// One name-value pair, used by Params, GetValues and GetValuesResult.
pub struct NameValuePair {
    pub name: Bytes,
    pub value: Bytes,
}

impl NameValuePair {
    pub fn new(name: Bytes, value: Bytes) -> NameValuePair {
        NameValuePair { name, value }
    }

    /// Decode one pair from the front of `data`.
    ///
    /// Returns the pair and the number of bytes it occupied, or `None` if
    /// `data` ends inside the pair and more bytes are needed. `None` is
    /// also the answer when a 4 byte length field itself is cut short:
    /// a first byte with the high bit set promises three more length bytes
    /// which may sit in the next Params record. `data` is never consumed.
    pub fn parse(data: &Bytes) -> Option<(NameValuePair, usize)> {
        let mut pos: usize = 0;
        let name_len = Self::param_length(data, &mut pos)?;
        let value_len = Self::param_length(data, &mut pos)?;
        if data.len() < pos + name_len + value_len {
            return None;
        }
        let name = data.slice(pos..pos + name_len);
        pos += name_len;
        let value = data.slice(pos..pos + value_len);
        pos += value_len;
        Some((NameValuePair { name, value }, pos))
    }

    /// 1-or-4-byte length: high bit of the first byte selects the long
    /// form and is masked off the decoded value.
    fn param_length(data: &Bytes, pos: &mut usize) -> Option<usize> {
        let first = *data.get(*pos)?;
        if first >> 7 == 1 {
            if data.len() < *pos + 4 {
                return None;
            }
            let len = (data.slice(*pos..*pos + 4).get_u32() & 0x7FFF_FFFF) as usize;
            *pos += 4;
            Some(len)
        } else {
            *pos += 1;
            Some(first as usize)
        }
    }

    /// Bytes this pair occupies on the wire.
    pub fn wire_len(&self) -> usize {
        let ln = self.name.len();
        let lv = self.value.len();
        let mut lf: usize = ln + lv + 2;
        if ln > 0x7f {
            lf += 3;
        }
        if lv > 0x7f {
            lf += 3;
        }
        lf
    }

    /// Append the encoded pair to `data`.
    ///
    /// # Panics
    /// If name or value is bigger than 0x7fffffff bytes
    pub fn write_into(&self, data: &mut BytesMut) {
        for len in [self.name.len(), self.value.len()] {
            if len > 0x7f {
                assert!(len <= 0x7fff_ffff);
                data.put_u32(len as u32 | 0x8000_0000);
            } else {
                data.put_u8(len as u8);
            }
        }
        data.put_slice(&self.name);
        data.put_slice(&self.value);
    }
}

impl std::fmt::Debug for NameValuePair {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?} = {:?}", self.name, self.value)
    }
}
