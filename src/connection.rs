/*! One accepted connection from a web server.

Multiple requests can be multiplexed on it. The driver task owns the socket
and the [`Transceiver`]; it alternates between reading records, consuming
worker messages and flushing queued output. State machine:
`Active -> Draining -> Closed` (accepting happens in the manager).

A protocol violation or hard socket error tears down this connection and
discards its in-flight requests; other connections never notice.
*/
use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, info, trace, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, Semaphore};

use crate::error::{Error, ProtocolError, Result};
use crate::fastcgi::{BeginRequestBody, Header, NameValuePair, ProtocolStatus, RecordType};
use crate::manager::ServerConfig;
use crate::request::{
    dispatch, Application, FullId, Message, PendingRequest, RequestState, TaggedMessage,
};
use crate::stream::Stream;
use crate::transceiver::Transceiver;

/// Socket write granularity; short writes below this are the socket's call.
const WRITE_CHUNK: usize = 16 * 1024;

/// Worker message queue depth per connection. Writers block (backpressure)
/// when the reactor side falls behind.
const QUEUE_DEPTH: usize = 32;

pub(crate) struct Connection<A> {
    handle: u16,
    stream: Stream,
    transceiver: Transceiver,
    /// request id -> state; `FullId` adds the connection handle back in
    requests: HashMap<u16, PendingRequest>,
    queue_rx: mpsc::Receiver<TaggedMessage>,
    queue_tx: mpsc::Sender<TaggedMessage>,
    app: Arc<A>,
    config: Arc<ServerConfig>,
    workers: Arc<Semaphore>,
    /// no further requests expected; flush and close
    draining: bool,
}

impl<A: Application> Connection<A> {
    pub(crate) fn new(
        handle: u16,
        stream: Stream,
        app: Arc<A>,
        config: Arc<ServerConfig>,
        workers: Arc<Semaphore>,
    ) -> Connection<A> {
        let (queue_tx, queue_rx) = mpsc::channel(QUEUE_DEPTH);
        Connection {
            handle,
            stream,
            transceiver: Transceiver::new(),
            requests: HashMap::new(),
            queue_rx,
            queue_tx,
            app,
            config,
            workers,
            draining: false,
        }
    }

    /// Read, demultiplex and respond until the connection winds down.
    pub(crate) async fn drive(mut self) -> Result<()> {
        loop {
            self.flush().await?;
            self.retire_flushed();
            if self.draining && self.requests.is_empty() && !self.transceiver.has_output() {
                debug!("con #{} drained, closing", self.handle);
                self.stream.shutdown().await.ok();
                return Ok(());
            }
            tokio::select! {
                read = self.stream.read_buf(self.transceiver.read_buf()) => {
                    if read? == 0 {
                        // peer closed; in-flight requests are discarded
                        info!("con #{} closed by peer", self.handle);
                        return Ok(());
                    }
                    self.process_records()?;
                }
                msg = self.queue_rx.recv() => {
                    if let Some((id, msg)) = msg {
                        self.handle_message(id, msg);
                    }
                }
            }
        }
    }

    /// Drain every whole record the transceiver has buffered.
    fn process_records(&mut self) -> Result<()> {
        while let Some((header, body)) = self.transceiver.next_record()? {
            self.dispatch_record(header, body)?;
        }
        Ok(())
    }

    fn dispatch_record(&mut self, header: Header, body: Bytes) -> std::result::Result<(), ProtocolError> {
        match header.rtype {
            RecordType::BeginRequest => self.begin_request(header.request_id, &body)?,
            RecordType::AbortRequest => self.abort_request(header.request_id),
            RecordType::Params => self.stream_payload(header.request_id, RecordType::Params, body),
            RecordType::Stdin => self.stream_payload(header.request_id, RecordType::Stdin, body),
            RecordType::Data => self.stream_payload(header.request_id, RecordType::Data, body),
            RecordType::GetValues => self.get_values(&body),
            other => {
                // a server never receives these; echo per protocol
                warn!("con #{} unrecognized record type {}", self.handle, other.to_u8());
                self.transceiver.enqueue_unknown_type(other.to_u8());
            }
        }
        Ok(())
    }

    fn begin_request(&mut self, rid: u16, body: &Bytes) -> std::result::Result<(), ProtocolError> {
        let begin = BeginRequestBody::parse(body)?;
        if self.requests.contains_key(&rid) {
            warn!("con #{} duplicate BeginRequest for id {}", self.handle, rid);
            return Ok(());
        }
        let role = begin.role().filter(|r| self.app.supports(*r));
        let role = match role {
            Some(role) => role,
            None => {
                info!(
                    "con #{} id {} unsupported role {}",
                    self.handle,
                    rid,
                    begin.raw_role()
                );
                self.transceiver
                    .enqueue_end_request(rid, 0, ProtocolStatus::UnknownRole);
                return Ok(());
            }
        };
        if !self.config.mpxs_conns && !self.requests.is_empty() {
            info!("con #{} id {} refused, no multiplexing", self.handle, rid);
            self.transceiver
                .enqueue_end_request(rid, 0, ProtocolStatus::CantMultiplexConnections);
            return Ok(());
        }
        if self.requests.len() >= self.config.max_reqs_per_conn {
            info!("con #{} id {} refused, overloaded", self.handle, rid);
            self.transceiver
                .enqueue_end_request(rid, 0, ProtocolStatus::Overloaded);
            return Ok(());
        }
        let id = FullId::new(rid, self.handle);
        debug!("{} begins as {:?}, keep_conn {}", id, role, begin.keep_conn());
        self.requests
            .insert(rid, PendingRequest::new(id, role, begin.keep_conn()));
        Ok(())
    }

    /// Append a stream payload; a zero-length record is the stream's only
    /// end-of-stream signal. Records for ids without a `BeginRequest` are
    /// dropped.
    fn stream_payload(&mut self, rid: u16, rtype: RecordType, body: Bytes) {
        let req = match self.requests.get_mut(&rid) {
            Some(req) if req.state == RequestState::Accumulating => req,
            Some(_) => {
                trace!("con #{} late {:?} for id {}", self.handle, rtype, rid);
                return;
            }
            None => {
                debug!("con #{} {:?} for inactive id {}", self.handle, rtype, rid);
                return;
            }
        };
        match (rtype, body.is_empty()) {
            (RecordType::Params, true) => req.params_done = true,
            (RecordType::Params, false) => req.append_params(body),
            (RecordType::Stdin, true) => req.stdin_done = true,
            (RecordType::Stdin, false) => req.append_stdin(body),
            (RecordType::Data, true) => req.data_done = true,
            (RecordType::Data, false) => req.append_data(body),
            _ => unreachable!("caller filters stream types"),
        }
        if req.is_ready() {
            req.state = RequestState::Ready;
            debug!("{} ready", req.id);
            let ctx = req.into_context(self.queue_tx.clone());
            dispatch(
                ctx,
                Arc::clone(&self.app),
                Arc::clone(&self.workers),
                self.queue_tx.clone(),
            );
        }
    }

    fn abort_request(&mut self, rid: u16) {
        let req = match self.requests.get_mut(&rid) {
            Some(req) => req,
            None => {
                debug!("con #{} abort for inactive id {}", self.handle, rid);
                return;
            }
        };
        info!("{} aborted by peer", req.id);
        req.abort();
        match req.state {
            RequestState::Accumulating | RequestState::Ready => {
                // nothing dispatched yet, answer right away
                req.state = RequestState::Responding;
                let status = self.app.abort_status();
                self.transceiver
                    .enqueue_end_request(rid, status, ProtocolStatus::RequestComplete);
            }
            // mid-callback: output is suppressed from here on and the
            // EndRequest follows the completion message
            RequestState::Processing => {}
            RequestState::Responding => {}
        }
    }

    /// Answer `GetValues` with the subset of requested names we recognize.
    fn get_values(&mut self, body: &Bytes) {
        let mut pairs = Vec::new();
        let mut pos = 0;
        while let Some((pair, used)) = NameValuePair::parse(&body.slice(pos..)) {
            pos += used;
            let value = match &pair.name[..] {
                crate::fastcgi::MAX_CONNS => self.config.max_conns.to_string(),
                crate::fastcgi::MAX_REQS => self.config.max_reqs_per_conn.to_string(),
                crate::fastcgi::MPXS_CONNS => {
                    if self.config.mpxs_conns { "1" } else { "0" }.to_string()
                }
                _ => continue,
            };
            pairs.push(NameValuePair::new(pair.name, Bytes::from(value)));
        }
        debug!("con #{} GetValues answered with {} pairs", self.handle, pairs.len());
        self.transceiver.enqueue_get_values_result(&pairs);
    }

    /// A message from the worker side of the dispatch boundary.
    fn handle_message(&mut self, id: FullId, msg: Message) {
        let rid = id.request_id();
        let req = match self.requests.get_mut(&rid) {
            Some(req) => req,
            None => {
                debug!("{} message after teardown", id);
                return;
            }
        };
        if msg.is_protocol() {
            if req.is_aborted() {
                trace!("{} output suppressed", id);
                return;
            }
            // remember which streams saw content, their close records
            // follow at completion
            if let Ok(h) = Header::parse(&msg.data) {
                match h.rtype {
                    RecordType::Stdout => req.produced_stdout = true,
                    RecordType::Stderr => req.produced_stderr = true,
                    _ => {}
                }
            }
            self.transceiver.enqueue_raw(msg.data);
        } else if let Some((app_status, done)) = msg.as_complete() {
            debug_assert!(done);
            if req.state != RequestState::Processing {
                return;
            }
            let status = if req.is_aborted() {
                self.app.abort_status()
            } else {
                app_status
            };
            req.state = RequestState::Responding;
            debug!("{} complete, app status {}", id, status);
            if req.produced_stdout {
                self.transceiver.enqueue_stream_end(RecordType::Stdout, rid);
            }
            if req.produced_stderr {
                self.transceiver.enqueue_stream_end(RecordType::Stderr, rid);
            }
            self.transceiver
                .enqueue_end_request(rid, status, ProtocolStatus::RequestComplete);
        } else {
            warn!("{} unknown message kind {}", id, msg.kind);
        }
    }

    /// Retire requests whose `EndRequest` has left the outbound queue.
    fn retire_flushed(&mut self) {
        if self.transceiver.has_output() {
            return;
        }
        let before = self.requests.len();
        let mut drain_after = false;
        self.requests.retain(|_, req| {
            if req.state == RequestState::Responding {
                drain_after |= !req.keep_conn;
                false
            } else {
                true
            }
        });
        if self.requests.len() != before {
            trace!("con #{} retired {} request(s)", self.handle, before - self.requests.len());
        }
        if drain_after {
            self.draining = true;
        }
    }

    /// Opportunistically write queued output; short writes leave the rest
    /// queued for the next pass.
    async fn flush(&mut self) -> Result<()> {
        while self.transceiver.has_output() {
            let written = self
                .stream
                .write(self.transceiver.drain(WRITE_CHUNK))
                .await?;
            if written == 0 {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "socket closed mid-record",
                )));
            }
            self.transceiver.advance(written);
        }
        Ok(())
    }
}
