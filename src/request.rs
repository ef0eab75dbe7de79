/*! Per-request state machine and the application dispatch boundary.

A request lives as a [`PendingRequest`] owned by its connection task while
records accumulate. Once all streams its role needs are terminated, the
accumulated input is frozen into an [`FcgiRequest`] and handed to a worker
thread; from then on the connection task and the worker communicate only
through owned [`Message`] envelopes over the connection's queue. Ownership,
not a lock, keeps the two sides apart.
*/
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use log::{debug, error, trace, warn};
use tokio::sync::{mpsc, Semaphore};

use crate::fastcgi::{Header, NameValuePair, RecordType, Role, MAX_CONTENT_LEN};

/// Composite identity of a logical request: request id plus the handle of
/// the connection it arrived on, packed into one integer. Two requests with
/// the same numeric id on different connections compare unequal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FullId(u32);

impl FullId {
    pub fn new(request_id: u16, conn: u16) -> FullId {
        FullId((conn as u32) << 16 | request_id as u32)
    }
    pub fn request_id(self) -> u16 {
        (self.0 & 0xffff) as u16
    }
    pub fn conn(self) -> u16 {
        (self.0 >> 16) as u16
    }
    pub fn packed(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for FullId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "#{}/{}", self.conn(), self.request_id())
    }
}

/// Envelope passed between a worker and the connection task that owns the
/// socket. `kind == PROTOCOL` carries framed FastCGI records and is consumed
/// internally; any other kind is opaque application data.
#[derive(Debug)]
pub struct Message {
    pub kind: u16,
    pub data: Bytes,
}

impl Message {
    /// Framed FastCGI record bytes, consumed by the connection task.
    pub const PROTOCOL: u16 = 0;
    /// Completion signal from a worker: 4 byte app status + done flag.
    pub const COMPLETE: u16 = 1;

    pub fn protocol(data: Bytes) -> Message {
        Message {
            kind: Self::PROTOCOL,
            data,
        }
    }

    pub fn complete(app_status: i32, done: bool) -> Message {
        let mut data = BytesMut::with_capacity(5);
        data.extend_from_slice(&app_status.to_be_bytes());
        data.extend_from_slice(&[done as u8]);
        Message {
            kind: Self::COMPLETE,
            data: data.freeze(),
        }
    }

    pub fn is_protocol(&self) -> bool {
        self.kind == Self::PROTOCOL
    }

    /// Decode a `COMPLETE` payload.
    pub fn as_complete(&self) -> Option<(i32, bool)> {
        if self.kind != Self::COMPLETE || self.data.len() < 5 {
            return None;
        }
        let mut data = self.data.clone();
        let status = data.get_i32();
        Some((status, data.get_u8() != 0))
    }
}

/// Queue item: which request a message belongs to.
pub(crate) type TaggedMessage = (FullId, Message);

/// Lifecycle of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestState {
    /// records accumulate, no application code runs
    Accumulating,
    /// all required streams terminated, dispatch pending
    Ready,
    /// the callback runs on a worker thread
    Processing,
    /// output queued, retired once the flush completes
    Responding,
}

/// Per-(connection, request id) accumulation state.
///
/// Mutated only by the connection task as records for its id arrive.
pub(crate) struct PendingRequest {
    pub(crate) id: FullId,
    pub(crate) role: Role,
    pub(crate) keep_conn: bool,
    pub(crate) state: RequestState,
    env: HashMap<Bytes, Bytes>,
    /// tail of a name-value pair split across Params records
    params_buf: BytesMut,
    stdin: BytesMut,
    data: BytesMut,
    pub(crate) params_done: bool,
    pub(crate) stdin_done: bool,
    pub(crate) data_done: bool,
    /// observable by a running callback; set by AbortRequest
    pub(crate) aborted: Arc<AtomicBool>,
    /// a non-empty Stdout record went out, so a close record must follow
    pub(crate) produced_stdout: bool,
    pub(crate) produced_stderr: bool,
}

impl PendingRequest {
    pub(crate) fn new(id: FullId, role: Role, keep_conn: bool) -> PendingRequest {
        PendingRequest {
            id,
            role,
            keep_conn,
            state: RequestState::Accumulating,
            env: HashMap::new(),
            params_buf: BytesMut::new(),
            stdin: BytesMut::new(),
            data: BytesMut::new(),
            params_done: false,
            stdin_done: false,
            data_done: false,
            aborted: Arc::new(AtomicBool::new(false)),
            produced_stdout: false,
            produced_stderr: false,
        }
    }

    /// Append one Params record payload and absorb every whole name-value
    /// pair. A pair cut short by the record boundary stays buffered for the
    /// next payload. Duplicate names: last write wins.
    pub(crate) fn append_params(&mut self, payload: Bytes) {
        if self.params_done {
            warn!("{} Params after end of stream", self.id);
            return;
        }
        self.params_buf.extend_from_slice(&payload);
        let buf = self.params_buf.split().freeze();
        let mut pos = 0;
        while let Some((pair, used)) = NameValuePair::parse(&buf.slice(pos..)) {
            trace!("{} param {:?}", self.id, pair);
            self.env.insert(pair.name, pair.value);
            pos += used;
        }
        // partial tail, if any, waits for the next record
        self.params_buf.extend_from_slice(&buf.slice(pos..));
    }

    pub(crate) fn append_stdin(&mut self, payload: Bytes) {
        if self.stdin_done {
            warn!("{} Stdin after end of stream", self.id);
            return;
        }
        self.stdin.extend_from_slice(&payload);
    }

    pub(crate) fn append_data(&mut self, payload: Bytes) {
        if self.data_done {
            warn!("{} Data after end of stream", self.id);
            return;
        }
        self.data.extend_from_slice(&payload);
    }

    /// All streams the role requires have seen their end-of-stream marker.
    /// This is the only completion signal the protocol has.
    pub(crate) fn is_ready(&self) -> bool {
        self.params_done
            && self.stdin_done
            && (self.role != Role::Filter || self.data_done)
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Relaxed)
    }

    pub(crate) fn abort(&mut self) {
        self.aborted.store(true, Ordering::Relaxed);
    }

    /// Freeze the accumulated input into the owned snapshot handed to a
    /// worker thread. A pair still sitting in the spill buffer means the
    /// peer closed Params mid-pair; it is dropped with a warning.
    pub(crate) fn into_context(&mut self, queue: mpsc::Sender<TaggedMessage>) -> FcgiRequest {
        debug_assert_eq!(self.state, RequestState::Ready);
        if !self.params_buf.is_empty() {
            warn!(
                "{} Params stream ended inside a pair, {} bytes dropped",
                self.id,
                self.params_buf.len()
            );
            self.params_buf.clear();
        }
        self.state = RequestState::Processing;
        FcgiRequest {
            id: self.id,
            role: self.role,
            env: std::mem::take(&mut self.env),
            stdin: self.stdin.split().freeze(),
            data: self.data.split().freeze(),
            stdout: OutputSink {
                id: self.id,
                rtype: RecordType::Stdout,
                queue: queue.clone(),
                aborted: Arc::clone(&self.aborted),
            },
            stderr: OutputSink {
                id: self.id,
                rtype: RecordType::Stderr,
                queue,
                aborted: Arc::clone(&self.aborted),
            },
            aborted: Arc::clone(&self.aborted),
            app_status: 0,
        }
    }
}

/// Streams callback output back to the connection task, one framed record
/// batch per write. Writes after an abort are silently discarded.
pub struct OutputSink {
    id: FullId,
    rtype: RecordType,
    queue: mpsc::Sender<TaggedMessage>,
    aborted: Arc<AtomicBool>,
}

impl OutputSink {
    /// Frame `buf` into records of at most 65535 bytes each.
    fn frame(&self, buf: &[u8]) -> Bytes {
        let mut framed = BytesMut::with_capacity(buf.len() + 16);
        for chunk in buf.chunks(MAX_CONTENT_LEN) {
            let header = Header::new(self.rtype, self.id.request_id(), chunk.len() as u16);
            let pad = header.padding_length as usize;
            header.write_into(&mut framed);
            framed.extend_from_slice(chunk);
            framed.extend_from_slice(&[0u8; 8][..pad]);
        }
        framed.freeze()
    }
}

/// Blocking writes, only valid on a worker thread.
impl io::Write for OutputSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() || self.aborted.load(Ordering::Relaxed) {
            return Ok(buf.len());
        }
        let framed = self.frame(buf);
        self.queue
            .blocking_send((self.id, Message::protocol(framed)))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "connection closed"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// The finalized request as the application callback sees it.
///
/// Owned by the worker thread during `Processing`; the connection task keeps
/// no reference to any of this data.
pub struct FcgiRequest {
    id: FullId,
    role: Role,
    env: HashMap<Bytes, Bytes>,
    stdin: Bytes,
    data: Bytes,
    stdout: OutputSink,
    stderr: OutputSink,
    aborted: Arc<AtomicBool>,
    app_status: i32,
}

impl FcgiRequest {
    pub fn id(&self) -> FullId {
        self.id
    }
    pub fn role(&self) -> Role {
        self.role
    }
    /// The environment from the Params stream.
    pub fn env(&self) -> &HashMap<Bytes, Bytes> {
        &self.env
    }
    /// One variable, e.g. `REQUEST_METHOD`.
    pub fn param(&self, name: &[u8]) -> Option<&Bytes> {
        self.env.get(name)
    }
    /// Concatenated request body.
    pub fn stdin(&self) -> &Bytes {
        &self.stdin
    }
    /// Concatenated extra data stream (Filter role).
    pub fn data(&self) -> &Bytes {
        &self.data
    }
    /// Response body sink. Written bytes are framed and queued right away,
    /// nothing buffers up in the worker.
    pub fn stdout(&mut self) -> &mut OutputSink {
        &mut self.stdout
    }
    /// Diagnostics sink.
    pub fn stderr(&mut self) -> &mut OutputSink {
        &mut self.stderr
    }
    /// Abort check for long running callbacks. Output written after this
    /// turns true is discarded, but checking early saves the work.
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Relaxed)
    }
    /// Exit status reported in `EndRequest`. Defaults to 0.
    pub fn set_app_status(&mut self, status: i32) {
        self.app_status = status;
    }
    pub fn app_status(&self) -> i32 {
        self.app_status
    }
}

/// Application logic invoked once per completed request.
///
/// Selected at configuration time by handing the implementing value to the
/// [`Manager`](crate::Manager).
pub trait Application: Send + Sync + 'static {
    /// Produce the response for `req`, writing to its stdout/stderr sinks.
    ///
    /// Return `true` when the response is complete. Returning `false` yields
    /// cooperatively: the engine re-invokes the callback when next
    /// scheduled, with all previously written output preserved.
    fn respond(&self, req: &mut FcgiRequest) -> bool;

    /// Roles this application implements. A `BeginRequest` for any other
    /// role is answered with `ProtocolStatus::UnknownRole`.
    fn supports(&self, role: Role) -> bool {
        role == Role::Responder
    }

    /// App status reported when a request is aborted by the web server.
    fn abort_status(&self) -> i32 {
        1
    }
}

/// App status reported when a callback panics.
const FAULT_APP_STATUS: i32 = 1;

/// Run the callback for one request off the connection task.
///
/// Holds a worker pool permit for the whole request and re-invokes the
/// callback until it reports completion or the request is aborted. A panic
/// is caught at the join boundary and reported as a non-zero app status;
/// the connection is not torn down over it.
pub(crate) fn dispatch<A: Application>(
    mut ctx: FcgiRequest,
    app: Arc<A>,
    permits: Arc<Semaphore>,
    queue: mpsc::Sender<TaggedMessage>,
) {
    tokio::spawn(async move {
        let _permit = match permits.acquire_owned().await {
            Ok(p) => p,
            Err(_) => return, // pool closed during shutdown
        };
        let id = ctx.id();
        debug!("{} dispatched", id);
        let completion = loop {
            let worker_app = Arc::clone(&app);
            let joined = tokio::task::spawn_blocking(move || {
                let done = worker_app.respond(&mut ctx);
                (done, ctx)
            })
            .await;
            match joined {
                Ok((true, done_ctx)) => {
                    break Message::complete(done_ctx.app_status(), true);
                }
                Ok((false, again_ctx)) => {
                    ctx = again_ctx;
                    if ctx.is_aborted() {
                        break Message::complete(app.abort_status(), true);
                    }
                    // cooperative yield, run again when next scheduled
                    tokio::task::yield_now().await;
                }
                Err(e) => {
                    error!("{} callback fault: {}", id, e);
                    break Message::complete(FAULT_APP_STATUS, true);
                }
            }
        };
        if queue.send((id, completion)).await.is_err() {
            debug!("{} connection gone before completion", id);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(role: Role) -> PendingRequest {
        PendingRequest::new(FullId::new(1, 0), role, false)
    }

    #[test]
    fn full_id_matches_packed_representation() {
        for (rid, conn) in [(0u16, 0u16), (1, 0), (0, 1), (7, 3), (0xffff, 0xffff)] {
            let id = FullId::new(rid, conn);
            assert_eq!(id.request_id(), rid);
            assert_eq!(id.conn(), conn);
            assert_eq!(id.packed(), (conn as u32) << 16 | rid as u32);
        }
        // ordering and equality follow the packed value
        let a = FullId::new(2, 1);
        let b = FullId::new(1, 2);
        assert!(a < b);
        assert_eq!(a.packed() < b.packed(), a < b);
        assert_ne!(FullId::new(1, 1), FullId::new(1, 2));
        assert_eq!(FullId::new(5, 9), FullId::new(5, 9));
    }

    #[test]
    fn complete_message_round_trip() {
        let m = Message::complete(-7, true);
        assert!(!m.is_protocol());
        assert_eq!(m.as_complete(), Some((-7, true)));
        assert_eq!(Message::protocol(Bytes::new()).as_complete(), None);
    }

    #[test]
    fn params_pair_split_across_records() {
        let pair = NameValuePair::new(
            Bytes::from(vec![b'n'; 150]),
            Bytes::from(vec![b'v'; 150]),
        );
        let mut wire = BytesMut::new();
        pair.write_into(&mut wire);
        let wire = wire.freeze();

        // every split point, including inside the 4 byte length fields
        for split in 1..wire.len() {
            let mut req = pending(Role::Responder);
            req.append_params(wire.slice(..split));
            assert!(req.env.is_empty(), "split at {}", split);
            req.append_params(wire.slice(split..));
            assert_eq!(req.env.len(), 1, "split at {}", split);
        }
    }

    #[test]
    fn params_last_write_wins() {
        let mut wire = BytesMut::new();
        NameValuePair::new(Bytes::from_static(b"X"), Bytes::from_static(b"1")).write_into(&mut wire);
        NameValuePair::new(Bytes::from_static(b"X"), Bytes::from_static(b"2")).write_into(&mut wire);
        let mut req = pending(Role::Responder);
        req.append_params(wire.freeze());
        assert_eq!(req.env.get(&b"X"[..]).unwrap(), &Bytes::from_static(b"2"));
    }

    #[test]
    fn readiness_per_role() {
        let mut req = pending(Role::Responder);
        assert!(!req.is_ready());
        req.params_done = true;
        assert!(!req.is_ready());
        req.stdin_done = true;
        assert!(req.is_ready());

        let mut req = pending(Role::Filter);
        req.params_done = true;
        req.stdin_done = true;
        assert!(!req.is_ready());
        req.data_done = true;
        assert!(req.is_ready());
    }

    #[test]
    fn context_snapshot_owns_input() {
        let (tx, _rx) = mpsc::channel(4);
        let mut req = pending(Role::Responder);
        let mut wire = BytesMut::new();
        NameValuePair::new(
            Bytes::from_static(b"REQUEST_METHOD"),
            Bytes::from_static(b"GET"),
        )
        .write_into(&mut wire);
        req.append_params(wire.freeze());
        req.append_stdin(Bytes::from_static(b"body"));
        req.params_done = true;
        req.stdin_done = true;
        req.state = RequestState::Ready;

        let ctx = req.into_context(tx);
        assert_eq!(req.state, RequestState::Processing);
        assert_eq!(
            ctx.param(b"REQUEST_METHOD"),
            Some(&Bytes::from_static(b"GET"))
        );
        assert_eq!(&ctx.stdin()[..], b"body");
        assert!(ctx.data().is_empty());
        assert!(!ctx.is_aborted());
        // accumulation buffers were moved out, not shared
        assert!(req.env.is_empty());
        assert!(req.stdin.is_empty());
    }

    #[test]
    fn sink_frames_and_suppresses_after_abort() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut req = pending(Role::Responder);
        req.params_done = true;
        req.stdin_done = true;
        req.state = RequestState::Ready;
        let mut ctx = req.into_context(tx);

        let framed = ctx.stdout().frame(b"OK");
        let h = Header::parse(&framed[..8]).unwrap();
        assert_eq!(h.rtype, RecordType::Stdout);
        assert_eq!(h.content_length, 2);
        assert_eq!(&framed[8..10], b"OK");
        assert_eq!(framed.len(), 16); // padded to a multiple of 8

        req.abort();
        assert!(ctx.is_aborted());
        // suppressed writes still report success to the callback
        use std::io::Write;
        assert_eq!(ctx.stdout().write(b"late").unwrap(), 4);
        assert!(rx.try_recv().is_err());
    }
}
