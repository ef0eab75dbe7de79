/*! Bridges a non-blocking socket and whole-record semantics.

One `Transceiver` per connection. Inbound bytes accumulate until whole
records can be cut out of them; outbound records queue up as a list of
buffers that a socket writer drains in slices, surviving short writes.

Both directions are pure byte shuffling, no I/O happens here. The
connection driver owns the socket and moves bytes in and out.
*/
use std::collections::VecDeque;

use bytes::{Buf, Bytes, BytesMut};
use log::trace;

use crate::error::ProtocolError;
use crate::fastcgi::{
    EndRequestBody, Header, NameValuePair, ProtocolStatus, RecordType, UnknownTypeBody,
    HEADER_LEN, MAX_CONTENT_LEN, MGMT_REQUEST_ID, VERSION_1,
};

const ZEROES: [u8; 8] = [0; 8];

/// How much spare capacity to keep ready for the next socket read.
const READ_CHUNK: usize = 8 * 1024;

/// Per-connection record framing buffer.
pub struct Transceiver {
    /// inbound accumulation, prefix space is reclaimed as records are cut
    rbuf: BytesMut,
    /// outbound queue of framed record fragments
    wbuf: VecDeque<Bytes>,
}

impl Transceiver {
    pub fn new() -> Transceiver {
        Transceiver {
            rbuf: BytesMut::with_capacity(READ_CHUNK),
            wbuf: VecDeque::new(),
        }
    }

    /// Append inbound bytes. Copies; `read_buf` avoids the copy for sockets.
    pub fn feed(&mut self, data: &[u8]) {
        self.rbuf.extend_from_slice(data);
    }

    /// The accumulation buffer, for `AsyncReadExt::read_buf`.
    pub fn read_buf(&mut self) -> &mut BytesMut {
        self.rbuf.reserve(READ_CHUNK);
        &mut self.rbuf
    }

    /// Cut the next whole record out of the accumulation buffer.
    ///
    /// `Ok(None)` means a partial record remains buffered until more bytes
    /// arrive; this never discards anything and restarts at any byte split.
    /// Padding is dropped here, the returned body is `content_length` long.
    pub fn next_record(&mut self) -> Result<Option<(Header, Bytes)>, ProtocolError> {
        if self.rbuf.len() < HEADER_LEN {
            return Ok(None);
        }
        let header = Header::parse(&self.rbuf[..HEADER_LEN])?;
        if header.version != VERSION_1 {
            return Err(ProtocolError::BadVersion(header.version));
        }
        if self.rbuf.len() < HEADER_LEN + header.body_len() {
            return Ok(None);
        }
        self.rbuf.advance(HEADER_LEN);
        let body = self.rbuf.split_to(header.content_length as usize).freeze();
        self.rbuf.advance(header.padding_length as usize);
        trace!(
            "record type {:?} id {} len {}",
            header.rtype,
            header.request_id,
            header.content_length
        );
        Ok(Some((header, body)))
    }

    /// Frame header + body + zero padding into the outbound queue.
    ///
    /// `body` must be exactly `header.content_length` bytes.
    pub fn enqueue(&mut self, header: Header, body: Bytes) {
        debug_assert_eq!(header.content_length as usize, body.len());
        let pad = header.padding_length as usize;
        let mut head = BytesMut::with_capacity(HEADER_LEN);
        header.write_into(&mut head);
        self.wbuf.push_back(head.freeze());
        if !body.is_empty() {
            self.wbuf.push_back(body);
        }
        if pad > 0 {
            self.wbuf.push_back(Bytes::from_static(&ZEROES[..pad]));
        }
    }

    /// Queue a stream payload, split into records of at most 65535 bytes.
    ///
    /// An empty payload queues nothing; the end-of-stream marker is a
    /// separate, explicit call.
    pub fn enqueue_stream(&mut self, rtype: RecordType, request_id: u16, mut data: Bytes) {
        while data.has_remaining() {
            let len = data.remaining().min(MAX_CONTENT_LEN);
            let chunk = data.split_to(len);
            self.enqueue(Header::new(rtype, request_id, len as u16), chunk);
        }
    }

    /// Queue the zero-length record that terminates a stream.
    pub fn enqueue_stream_end(&mut self, rtype: RecordType, request_id: u16) {
        self.enqueue(Header::new(rtype, request_id, 0), Bytes::new());
    }

    pub fn enqueue_end_request(&mut self, request_id: u16, app_status: i32, status: ProtocolStatus) {
        let body = EndRequestBody::encode(app_status, status);
        self.enqueue(
            Header::new(RecordType::EndRequest, request_id, EndRequestBody::LEN as u16),
            Bytes::copy_from_slice(&body),
        );
    }

    pub fn enqueue_unknown_type(&mut self, rtype: u8) {
        let body = UnknownTypeBody::encode(rtype);
        self.enqueue(
            Header::new(RecordType::UnknownType, MGMT_REQUEST_ID, UnknownTypeBody::LEN as u16),
            Bytes::copy_from_slice(&body),
        );
    }

    /// Queue a `GetValuesResult` management reply.
    ///
    /// The three recognized variables always fit one record.
    pub fn enqueue_get_values_result(&mut self, pairs: &[NameValuePair]) {
        let mut body = BytesMut::new();
        for pair in pairs {
            pair.write_into(&mut body);
        }
        debug_assert!(body.len() <= MAX_CONTENT_LEN);
        self.enqueue(
            Header::new(RecordType::GetValuesResult, MGMT_REQUEST_ID, body.len() as u16),
            body.freeze(),
        );
    }

    /// Queue record bytes a worker already framed.
    pub fn enqueue_raw(&mut self, framed: Bytes) {
        if !framed.is_empty() {
            self.wbuf.push_back(framed);
        }
    }

    pub fn has_output(&self) -> bool {
        !self.wbuf.is_empty()
    }

    /// Next contiguous slice ready for the socket, at most `max` bytes.
    ///
    /// The slice stays queued until `advance` consumes it, so a short
    /// write loses nothing.
    pub fn drain(&self, max: usize) -> &[u8] {
        match self.wbuf.front() {
            Some(chunk) => &chunk[..chunk.len().min(max)],
            None => &[],
        }
    }

    /// Consume `n` written bytes from the front of the outbound queue.
    pub fn advance(&mut self, mut n: usize) {
        while n > 0 {
            let front = match self.wbuf.front_mut() {
                Some(front) => front,
                None => return,
            };
            let rem = front.remaining();
            if rem > n {
                front.advance(n);
                return;
            }
            n -= rem;
            self.wbuf.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stdin_record(request_id: u16, payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        let h = Header::new(RecordType::Stdin, request_id, payload.len() as u16);
        let pad = h.padding_length as usize;
        h.write_into(&mut buf);
        buf.extend_from_slice(payload);
        buf.extend_from_slice(&ZEROES[..pad]);
        buf
    }

    #[test]
    fn whole_record() {
        let mut t = Transceiver::new();
        t.feed(&stdin_record(1, b"hello"));
        let (h, body) = t.next_record().unwrap().unwrap();
        assert_eq!(h.rtype, RecordType::Stdin);
        assert_eq!(h.request_id, 1);
        assert_eq!(&body[..], b"hello");
        assert!(t.next_record().unwrap().is_none());
    }

    #[test]
    fn restartable_at_every_split() {
        let mut wire = stdin_record(1, b"hello");
        wire.extend_from_slice(&stdin_record(2, b"world!!!"));
        for split in 0..wire.len() {
            let mut t = Transceiver::new();
            t.feed(&wire[..split]);
            let mut got = Vec::new();
            while let Some(r) = t.next_record().unwrap() {
                got.push(r);
            }
            t.feed(&wire[split..]);
            while let Some(r) = t.next_record().unwrap() {
                got.push(r);
            }
            assert_eq!(got.len(), 2, "split at {}", split);
            assert_eq!(&got[0].1[..], b"hello");
            assert_eq!(got[1].0.request_id, 2);
            assert_eq!(&got[1].1[..], b"world!!!");
        }
    }

    #[test]
    fn bad_version_is_fatal() {
        let mut t = Transceiver::new();
        t.feed(b"\x02\x05\0\x01\0\0\0\0");
        assert_eq!(t.next_record(), Err(ProtocolError::BadVersion(2)));
    }

    #[test]
    fn output_is_padded_to_multiple_of_8() {
        let mut t = Transceiver::new();
        t.enqueue_stream(RecordType::Stdout, 1, Bytes::from_static(b"OK"));
        let mut out = Vec::new();
        while t.has_output() {
            let chunk = t.drain(usize::MAX).to_vec();
            t.advance(chunk.len());
            out.extend_from_slice(&chunk);
        }
        assert_eq!(&out[..], b"\x01\x06\0\x01\0\x02\x06\0OK\0\0\0\0\0\0");
    }

    #[test]
    fn short_writes_lose_nothing() {
        let mut t = Transceiver::new();
        t.enqueue_end_request(1, 0, ProtocolStatus::RequestComplete);
        let mut out = Vec::new();
        loop {
            let chunk = t.drain(3).to_vec();
            if chunk.is_empty() {
                break;
            }
            // pretend the socket only took one byte
            out.push(chunk[0]);
            t.advance(1);
        }
        assert_eq!(&out[..], b"\x01\x03\0\x01\0\x08\0\0\0\0\0\0\0\0\0\0");
    }

    #[test]
    fn oversized_stream_spans_records() {
        let mut t = Transceiver::new();
        let payload = Bytes::from(vec![b'x'; MAX_CONTENT_LEN + 10]);
        t.enqueue_stream(RecordType::Stdout, 1, payload);
        t.enqueue_stream_end(RecordType::Stdout, 1);

        // loop the framed bytes back through a reader
        let mut rx = Transceiver::new();
        while t.has_output() {
            let chunk = t.drain(usize::MAX).to_vec();
            t.advance(chunk.len());
            rx.feed(&chunk);
        }
        let (h1, b1) = rx.next_record().unwrap().unwrap();
        assert_eq!(h1.content_length as usize, MAX_CONTENT_LEN);
        assert_eq!(b1.len(), MAX_CONTENT_LEN);
        let (h2, b2) = rx.next_record().unwrap().unwrap();
        assert_eq!(h2.content_length, 10);
        assert_eq!(&b2[..], b"xxxxxxxxxx");
        let (h3, b3) = rx.next_record().unwrap().unwrap();
        assert_eq!(h3.content_length, 0);
        assert!(b3.is_empty());
        assert!(rx.next_record().unwrap().is_none());
    }

    #[test]
    fn empty_stream_payload_queues_nothing() {
        let mut t = Transceiver::new();
        t.enqueue_stream(RecordType::Stdout, 1, Bytes::new());
        assert!(!t.has_output());
    }

    #[test]
    fn get_values_result_framing() {
        let mut t = Transceiver::new();
        let pairs = [NameValuePair::new(
            Bytes::from_static(crate::fastcgi::MAX_CONNS),
            Bytes::from_static(b"8"),
        )];
        t.enqueue_get_values_result(&pairs);
        let mut rx = Transceiver::new();
        while t.has_output() {
            let chunk = t.drain(usize::MAX).to_vec();
            t.advance(chunk.len());
            rx.feed(&chunk);
        }
        let (h, body) = rx.next_record().unwrap().unwrap();
        assert_eq!(h.rtype, RecordType::GetValuesResult);
        assert_eq!(h.request_id, MGMT_REQUEST_ID);
        let (pair, used) = NameValuePair::parse(&body).unwrap();
        assert_eq!(used, body.len());
        assert_eq!(&pair.name[..], crate::fastcgi::MAX_CONNS);
        assert_eq!(&pair.value[..], b"8");
    }
}
