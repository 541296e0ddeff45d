use std::{
    collections::VecDeque,
    fs::File,
    io, mem,
    path::Path,
    sync::Arc,
    time::Instant,
};

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, trace};

use crate::{
    engine::ResetDirections,
    error::Error,
    event::{SessionEvent, StreamEvent},
    socket::Socket,
    stats::StreamStats,
    CloseCode, Dir, SessionHandle, Side, StreamHandle, StreamId,
};

pub mod headers;

use headers::{Header, HeadersKind, PseudoRules};

/// A RESET_STREAM received from the peer
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ResetInfo {
    /// Application error code
    pub code: u64,
    /// Final size of the stream
    pub final_size: u64,
}

/// Lifecycle of a [`Stream`]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StreamPhase {
    /// Requested before the handshake completed; no id has been allocated
    Pending,
    /// Both halves usable
    Open,
    /// One half is finished
    HalfClosed(Half),
    /// Both halves are finished; waiting for the engine to release the stream
    Closed,
    /// Gone
    Destroyed,
}

/// One direction of a stream
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Half {
    /// The receiving half
    Read,
    /// The sending half
    Write,
}

/// Errors returned by [`Stream::read`]
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum ReadError {
    /// No data is buffered yet; wait for [`StreamEvent::Readable`]
    #[error("blocked")]
    Blocked,
    /// This stream never carries data towards us
    #[error("stream is not readable")]
    NotReadable,
    /// The stream has been destroyed
    #[error("stream has been destroyed")]
    Destroyed,
}

/// A file to pipe into a stream
#[derive(Debug)]
pub enum FileSource {
    /// The stream takes ownership; the file is closed once the transfer finishes
    Owned(File),
    /// The caller keeps the file open; the stream only releases its reference
    Shared(Arc<File>),
}

/// Which part of a file [`Stream::send_fd`] sends
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct SendFileOptions {
    /// Where to start reading; the current position when unset
    pub offset: Option<u64>,
    /// How many bytes to send; up to the end of the file when unset
    pub length: Option<u64>,
}

#[derive(Debug)]
pub(crate) struct StreamInner {
    pub(crate) id: Option<StreamId>,
    pub(crate) dir: Dir,
    initiator: Side,
    readable: bool,
    writable: bool,

    recv: VecDeque<Bytes>,
    recv_buffered: usize,
    fin_received: bool,
    end_emitted: bool,
    user_paused: bool,
    /// Whether the engine has been told to stop delivering data
    read_stopped: bool,

    pending_writes: Vec<Bytes>,
    write_buffered: usize,
    need_drain: bool,
    end_requested: bool,

    pending_abort: Option<CloseCode>,
    aborted: bool,
    reset: Option<ResetInfo>,

    /// Our reference to a file being piped by the engine
    file: Option<Arc<File>>,
    pending_file: Option<(Arc<File>, SendFileOptions)>,
    hwm: usize,
    stats: StreamStats,
}

impl StreamInner {
    /// A stream we requested; its id arrives later
    pub(crate) fn local(side: Side, dir: Dir, hwm: usize, now: Instant) -> Self {
        Self::new(None, side, dir, hwm, now)
    }

    /// A stream the peer opened
    pub(crate) fn remote(id: StreamId, hwm: usize, now: Instant) -> Self {
        Self::new(Some(id), id.initiator(), id.dir(), hwm, now)
    }

    fn new(id: Option<StreamId>, initiator: Side, dir: Dir, hwm: usize, now: Instant) -> Self {
        // A unidirectional stream only ever carries data away from its initiator
        let local = id.is_none();
        let (readable, writable) = match dir {
            Dir::Bi => (true, true),
            Dir::Uni => (!local, local),
        };
        Self {
            id,
            dir,
            initiator,
            readable,
            writable,
            recv: VecDeque::new(),
            recv_buffered: 0,
            fin_received: false,
            end_emitted: false,
            user_paused: false,
            read_stopped: false,
            pending_writes: Vec::new(),
            write_buffered: 0,
            need_drain: false,
            end_requested: false,
            pending_abort: None,
            aborted: false,
            reset: None,
            file: None,
            pending_file: None,
            hwm,
            stats: StreamStats::new(now),
        }
    }

    /// Whether `End` is due; marks it emitted and closes the receiving half
    fn take_end(&mut self) -> bool {
        if !self.fin_received || !self.recv.is_empty() || self.end_emitted {
            return false;
        }
        self.end_emitted = true;
        self.readable = false;
        true
    }

    fn piping(&self) -> bool {
        self.file.is_some() || self.pending_file.is_some()
    }
}

impl Socket {
    /// Access a stream
    pub fn stream(&mut self, handle: StreamHandle) -> Stream<'_> {
        Stream {
            socket: self,
            handle,
        }
    }

    /// Bind a stream to the id the engine allocated and run whatever was queued on it
    pub(crate) fn attach_stream(&mut self, handle: StreamHandle, id: StreamId) {
        let Some(session) = self.sessions.get_mut(&handle.session) else {
            return;
        };
        let Some(connection) = session.connection else {
            return;
        };
        let Some(stream) = session.streams.get_mut(&handle.key) else {
            return;
        };
        debug_assert_eq!(id.dir(), stream.dir);
        debug_assert_eq!(id.initiator(), session.side);
        stream.id = Some(id);
        session.ids.insert(id, handle.key);
        match id.dir() {
            Dir::Bi => session.stats.bidi_stream_count += 1,
            Dir::Uni => session.stats.uni_stream_count += 1,
        }
        session.stats.streams_out_count += 1;
        trace!(session = ?handle.session, stream = %id, "stream ready");
        self.tasks.stream(handle, StreamEvent::Ready);

        let writes = mem::take(&mut stream.pending_writes);
        let abort = stream.pending_abort.take();
        let file = stream.pending_file.take();
        let end = stream.end_requested;
        for data in writes {
            stream.stats.bytes_sent += data.len() as u64;
            if let Err(e) = self.engine.write_stream(connection, id, data) {
                self.destroy_stream(handle, Some(e.into()));
                return;
            }
        }
        if let Some(code) = abort {
            self.abort_stream(handle, code);
            return;
        }
        self.update_reading(handle);
        if let Some((file, options)) = file {
            // A failed send has already destroyed the stream with the engine's error
            if let Err(error) = self.start_file(handle, file, options) {
                trace!(stream = ?handle, %error, "deferred file send failed");
            }
        } else if end {
            self.shutdown_stream(handle);
        }
    }

    /// Register a stream the peer opened
    pub(crate) fn accept_stream(&mut self, handle: SessionHandle, id: StreamId) {
        let Some(session) = self.sessions.get_mut(&handle) else {
            return;
        };
        let Some(connection) = session.connection else {
            return;
        };
        if session.closing || session.destroyed || id.initiator() == session.side {
            debug!(session = ?handle, stream = %id, "refusing peer stream");
            self.engine.destroy_stream(connection, id);
            return;
        }
        if session.ids.contains_key(&id) {
            return;
        }
        let stream = StreamInner::remote(id, session.stream_hwm, Instant::now());
        let key = session.insert_stream(stream);
        session.ids.insert(id, key);
        match id.dir() {
            Dir::Bi => session.stats.bidi_stream_count += 1,
            Dir::Uni => session.stats.uni_stream_count += 1,
        }
        session.stats.streams_in_count += 1;
        let stream = StreamHandle {
            session: handle,
            key,
        };
        trace!(session = ?handle, stream = %id, "peer opened stream");
        self.tasks.session(handle, SessionEvent::Stream(stream));
    }

    pub(crate) fn stream_data(&mut self, handle: StreamHandle, data: Bytes, fin: bool) {
        let Some(stream) = self.stream_inner(handle) else {
            return;
        };
        if !stream.readable || stream.aborted {
            trace!(len = data.len(), "dropping data for a closed receiving half");
            return;
        }
        stream.stats.bytes_received += data.len() as u64;
        let was_empty = stream.recv.is_empty();
        if !data.is_empty() {
            stream.recv_buffered += data.len();
            stream.recv.push_back(data);
        }
        if fin {
            stream.fin_received = true;
            stream.stats.final_size = Some(stream.stats.bytes_received);
        }
        let readable = was_empty && !stream.recv.is_empty();
        let end = stream.take_end();

        if readable {
            self.tasks.stream(handle, StreamEvent::Readable);
        }
        if end {
            self.tasks.stream(handle, StreamEvent::End);
        }
        self.update_reading(handle);
    }

    pub(crate) fn stream_acked(&mut self, handle: StreamHandle, bytes: u64) {
        let Some(stream) = self.stream_inner(handle) else {
            return;
        };
        stream.stats.bytes_acked += bytes;
        stream.write_buffered = stream
            .write_buffered
            .saturating_sub(usize::try_from(bytes).unwrap_or(usize::MAX));
        if stream.need_drain && stream.write_buffered < stream.hwm {
            stream.need_drain = false;
            self.tasks.stream(handle, StreamEvent::Drain);
        }
    }

    /// The peer reset its sending half; whatever was buffered stays readable
    pub(crate) fn stream_reset(&mut self, handle: StreamHandle, code: u64, final_size: u64) {
        let Some(stream) = self.stream_inner(handle) else {
            return;
        };
        if stream.reset.is_some() {
            return;
        }
        let info = ResetInfo { code, final_size };
        stream.reset = Some(info);
        stream.fin_received = true;
        stream.stats.final_size = Some(final_size);
        let end = stream.take_end();
        trace!(code, final_size, "stream reset by peer");
        self.tasks.stream(handle, StreamEvent::Reset(info));
        if end {
            self.tasks.stream(handle, StreamEvent::End);
        }
    }

    /// Abruptly close both halves
    ///
    /// Deferred until the stream has an id. `Abort` is only reported when a half was still open.
    pub(crate) fn abort_stream(&mut self, handle: StreamHandle, code: CloseCode) {
        let Some(session) = self.sessions.get_mut(&handle.session) else {
            return;
        };
        let connection = session.connection;
        let Some(stream) = session.streams.get_mut(&handle.key) else {
            return;
        };
        if stream.aborted {
            return;
        }
        let Some(id) = stream.id else {
            stream.pending_abort = Some(code);
            return;
        };
        stream.aborted = true;
        let was_active = stream.readable || stream.writable;
        let directions = ResetDirections {
            reset: stream.writable,
            stop_sending: stream.readable && !stream.fin_received,
        };
        stream.readable = false;
        stream.writable = false;
        stream.recv.clear();
        stream.recv_buffered = 0;
        stream.pending_writes.clear();
        trace!(stream = %id, %code, "aborting stream");

        if let Some(connection) = connection {
            if directions.reset || directions.stop_sending {
                self.engine.reset_stream(connection, id, code, directions);
            }
        }
        if was_active {
            self.tasks.stream(handle, StreamEvent::Abort { code });
        }
    }

    /// Remove a stream and queue its `Error` (if any) and `Close` notifications
    pub(crate) fn destroy_stream(&mut self, handle: StreamHandle, error: Option<Error>) {
        let Some(session) = self.sessions.get_mut(&handle.session) else {
            return;
        };
        let Some(mut stream) = session.streams.remove(&handle.key) else {
            return;
        };
        if let Some(id) = stream.id {
            session.ids.remove(&id);
            if let Some(connection) = session.connection {
                self.engine.destroy_stream(connection, id);
            }
        }
        stream.file = None;
        stream.pending_file = None;
        stream.stats.destroyed_at = Some(Instant::now());
        trace!(session = ?handle.session, stream = ?stream.id, ?error, "stream destroyed");

        if let Some(error) = error {
            self.tasks.stream(handle, StreamEvent::Error(error));
        }
        self.tasks.stream(
            handle,
            StreamEvent::Close {
                stats: stream.stats,
            },
        );
        self.maybe_destroy_session(handle.session);
    }

    pub(crate) fn stream_file_done(&mut self, handle: StreamHandle, result: io::Result<()>) {
        let Some(stream) = self.stream_inner(handle) else {
            return;
        };
        // Dropping our reference closes an owned file once the engine has released its own
        stream.file = None;
        match result {
            Ok(()) => {
                stream.end_requested = true;
                self.shutdown_stream(handle);
            }
            Err(e) => self.destroy_stream(handle, Some(Error::File(Arc::new(e)))),
        }
    }

    /// Send FIN once, after everything already written
    fn shutdown_stream(&mut self, handle: StreamHandle) {
        let Some(session) = self.sessions.get_mut(&handle.session) else {
            return;
        };
        let Some(connection) = session.connection else {
            return;
        };
        let Some(stream) = session.streams.get_mut(&handle.key) else {
            return;
        };
        let Some(id) = stream.id else {
            return;
        };
        if !stream.writable {
            return;
        }
        stream.writable = false;
        match self.engine.shutdown_stream(connection, id) {
            Ok(()) => self.tasks.stream(handle, StreamEvent::Finish),
            Err(e) => self.destroy_stream(handle, Some(e.into())),
        }
    }

    fn start_file(
        &mut self,
        handle: StreamHandle,
        file: Arc<File>,
        options: SendFileOptions,
    ) -> Result<(), Error> {
        let session = self
            .sessions
            .get_mut(&handle.session)
            .ok_or(Error::destroyed("Stream", "send_fd"))?;
        let connection = session
            .connection
            .ok_or(Error::InvalidState("session has no connection"))?;
        let stream = session
            .streams
            .get_mut(&handle.key)
            .ok_or(Error::destroyed("Stream", "send_fd"))?;
        let id = stream.id.ok_or(Error::InvalidState("stream is not ready"))?;
        stream.file = Some(file.clone());
        let result = self
            .engine
            .send_file(connection, id, file, options.offset, options.length);
        if let Err(e) = result {
            let error = Error::from(e);
            self.destroy_stream(handle, Some(error.clone()));
            return Err(error);
        }
        Ok(())
    }

    /// Tell the engine to stop or resume delivering data to match the consumer
    fn update_reading(&mut self, handle: StreamHandle) {
        let Some(session) = self.sessions.get_mut(&handle.session) else {
            return;
        };
        let Some(connection) = session.connection else {
            return;
        };
        let Some(stream) = session.streams.get_mut(&handle.key) else {
            return;
        };
        let Some(id) = stream.id else {
            return;
        };
        let stop = stream.user_paused || stream.recv_buffered >= stream.hwm;
        if !stream.readable || stop == stream.read_stopped {
            return;
        }
        stream.read_stopped = stop;
        match stop {
            true => self.engine.read_stop(connection, id),
            false => self.engine.read_start(connection, id),
        }
    }

    fn stream_inner(&mut self, handle: StreamHandle) -> Option<&mut StreamInner> {
        self.sessions
            .get_mut(&handle.session)?
            .streams
            .get_mut(&handle.key)
    }
}

/// A stream within a [`Session`](crate::Session)
///
/// Obtained from [`Socket::stream`]. Operations on a destroyed stream fail with
/// [`Error::Destroyed`].
#[derive(Debug)]
pub struct Stream<'a> {
    socket: &'a mut Socket,
    handle: StreamHandle,
}

impl Stream<'_> {
    /// The stream's handle
    pub fn handle(&self) -> StreamHandle {
        self.handle
    }

    /// The owning session
    pub fn session(&self) -> SessionHandle {
        self.handle.session
    }

    /// The id allocated by the engine; `None` while pending
    pub fn id(&self) -> Option<StreamId> {
        self.inner()?.id
    }

    /// Write data, queueing it if the stream is still pending
    ///
    /// Returns whether the amount of unacknowledged data is still below the high-water mark. If
    /// not, [`StreamEvent::Drain`] fires once enough has been acknowledged.
    pub fn write(&mut self, data: impl Into<Bytes>) -> Result<bool, Error> {
        let session = self
            .socket
            .sessions
            .get_mut(&self.handle.session)
            .ok_or(Error::destroyed("Stream", "write"))?;
        let connection = session.connection;
        let stream = session
            .streams
            .get_mut(&self.handle.key)
            .ok_or(Error::destroyed("Stream", "write"))?;
        if !stream.writable || stream.end_requested {
            return Err(Error::InvalidState("stream is not writable"));
        }
        if stream.piping() {
            return Err(Error::InvalidState("a file is being sent on this stream"));
        }

        let data = data.into();
        stream.write_buffered += data.len();
        let below = stream.write_buffered < stream.hwm;
        if !below {
            stream.need_drain = true;
        }
        match (stream.id, connection) {
            (Some(id), Some(connection)) => {
                stream.stats.bytes_sent += data.len() as u64;
                if let Err(e) = self.socket.engine.write_stream(connection, id, data) {
                    let error = Error::from(e);
                    self.socket.destroy_stream(self.handle, Some(error.clone()));
                    return Err(error);
                }
            }
            _ => stream.pending_writes.push(data),
        }
        Ok(below)
    }

    /// Finish the sending half
    ///
    /// The FIN goes out exactly once, after everything already written. Calling this again has no
    /// effect.
    pub fn end(&mut self) -> Result<(), Error> {
        let stream = self.inner_mut("end")?;
        if !stream.writable || stream.end_requested {
            return Ok(());
        }
        stream.end_requested = true;
        if stream.id.is_none() || stream.piping() {
            return Ok(());
        }
        self.socket.shutdown_stream(self.handle);
        Ok(())
    }

    /// Take up to `max` bytes of received data
    ///
    /// `Ok(None)` means all data has been read.
    pub fn read(&mut self, max: usize) -> Result<Option<Bytes>, ReadError> {
        let stream = self
            .socket
            .stream_inner(self.handle)
            .ok_or(ReadError::Destroyed)?;
        let Some(mut chunk) = stream.recv.pop_front() else {
            if stream.take_end() {
                self.socket.tasks.stream(self.handle, StreamEvent::End);
                return Ok(None);
            }
            return match stream.readable {
                true => Err(ReadError::Blocked),
                false if stream.end_emitted || stream.aborted => Ok(None),
                false => Err(ReadError::NotReadable),
            };
        };
        if chunk.len() > max {
            stream.recv.push_front(chunk.split_off(max));
        }
        stream.recv_buffered -= chunk.len();
        if stream.take_end() {
            self.socket.tasks.stream(self.handle, StreamEvent::End);
        }
        self.socket.update_reading(self.handle);
        Ok(Some(chunk))
    }

    /// Stop the engine from delivering more data until [`resume`](Self::resume)
    pub fn pause(&mut self) -> Result<(), Error> {
        self.inner_mut("pause")?.user_paused = true;
        self.socket.update_reading(self.handle);
        Ok(())
    }

    /// Undo [`pause`](Self::pause)
    pub fn resume(&mut self) -> Result<(), Error> {
        self.inner_mut("resume")?.user_paused = false;
        self.socket.update_reading(self.handle);
        Ok(())
    }

    /// Abruptly close the stream with an application error code
    ///
    /// Sends RESET_STREAM and/or STOP_SENDING for whichever halves are still open. The stream is
    /// destroyed once the engine releases it.
    pub fn close(&mut self, code: u64) -> Result<(), Error> {
        self.inner_mut("close")?;
        self.socket
            .abort_stream(self.handle, CloseCode::application(code));
        Ok(())
    }

    /// Destroy the stream immediately
    pub fn destroy(&mut self, error: Option<Error>) {
        let code = error
            .as_ref()
            .and_then(Error::close_code)
            .unwrap_or(CloseCode::NO_ERROR);
        self.socket.abort_stream(self.handle, code);
        self.socket.destroy_stream(self.handle, error);
    }

    /// Pipe a file into the stream, bypassing [`write`](Self::write)
    ///
    /// The sending half is finished once the whole range has been sent. A failed transfer
    /// destroys the stream with [`Error::File`].
    pub fn send_fd(&mut self, file: FileSource, options: SendFileOptions) -> Result<(), Error> {
        let stream = self.inner_mut("send_fd")?;
        if !stream.writable || stream.end_requested {
            return Err(Error::InvalidState("stream is not writable"));
        }
        if stream.piping() {
            return Err(Error::InvalidState("a file is already being sent on this stream"));
        }
        let file = match file {
            FileSource::Owned(file) => Arc::new(file),
            FileSource::Shared(file) => file,
        };
        if stream.id.is_none() {
            stream.pending_file = Some((file, options));
            return Ok(());
        }
        self.socket.start_file(self.handle, file, options)
    }

    /// Open `path` and pipe it into the stream
    pub fn send_file(
        &mut self,
        path: impl AsRef<Path>,
        options: SendFileOptions,
    ) -> Result<(), Error> {
        self.inner_mut("send_file")?;
        let file = File::open(path).map_err(|e| Error::File(Arc::new(e)))?;
        self.send_fd(FileSource::Owned(file), options)
    }

    /// Send 1xx response headers
    pub fn submit_informational_headers(&mut self, headers: &[Header]) -> Result<(), Error> {
        self.submit_headers(HeadersKind::Informational, headers, false)
    }

    /// Send the request or response head
    ///
    /// With `terminal`, the sending half is finished along with the headers.
    pub fn submit_initial_headers(
        &mut self,
        headers: &[Header],
        terminal: bool,
    ) -> Result<(), Error> {
        self.submit_headers(HeadersKind::Initial, headers, terminal)
    }

    /// Send trailers
    pub fn submit_trailing_headers(&mut self, headers: &[Header]) -> Result<(), Error> {
        self.submit_headers(HeadersKind::Trailing, headers, false)
    }

    fn submit_headers(
        &mut self,
        kind: HeadersKind,
        headers: &[Header],
        terminal: bool,
    ) -> Result<(), Error> {
        let session = self
            .socket
            .sessions
            .get_mut(&self.handle.session)
            .ok_or(Error::destroyed("Stream", "submit_headers"))?;
        let side = session.side;
        let connection = session.connection;
        let stream = session
            .streams
            .get_mut(&self.handle.key)
            .ok_or(Error::destroyed("Stream", "submit_headers"))?;
        let id = stream
            .id
            .ok_or(Error::InvalidState("stream is not ready"))?;
        if !stream.writable {
            return Err(Error::InvalidState("stream is not writable"));
        }
        let rules = match kind {
            HeadersKind::Trailing => PseudoRules::Trailer,
            _ if stream.initiator == side => PseudoRules::Request,
            _ => PseudoRules::Response,
        };
        let headers = headers::validate(headers, rules)?;
        let connection = connection.ok_or(Error::InvalidState("session has no connection"))?;
        self.socket
            .engine
            .submit_headers(connection, id, kind, &headers, terminal)?;
        if terminal {
            stream.writable = false;
            stream.end_requested = true;
            self.socket.tasks.stream(self.handle, StreamEvent::Finish);
        }
        Ok(())
    }

    /// Whether the stream is still waiting for its id
    pub fn is_pending(&self) -> bool {
        self.inner().is_some_and(|s| s.id.is_none())
    }

    /// Whether the receiving half is open
    pub fn is_readable(&self) -> bool {
        self.inner().is_some_and(|s| s.readable)
    }

    /// Whether the sending half accepts writes
    pub fn is_writable(&self) -> bool {
        self.inner()
            .is_some_and(|s| s.writable && !s.end_requested)
    }

    /// Whether data flows only from the initiator
    pub fn is_unidirectional(&self) -> bool {
        self.inner().is_some_and(|s| s.dir == Dir::Uni)
    }

    /// Whether data flows both ways
    pub fn is_bidirectional(&self) -> bool {
        self.inner().is_some_and(|s| s.dir == Dir::Bi)
    }

    /// Whether the server opened the stream
    pub fn is_server_initiated(&self) -> bool {
        self.inner().is_some_and(|s| s.initiator.is_server())
    }

    /// Whether the client opened the stream
    pub fn is_client_initiated(&self) -> bool {
        self.inner().is_some_and(|s| s.initiator.is_client())
    }

    /// The peer's RESET_STREAM, if one arrived
    pub fn reset_received(&self) -> Option<ResetInfo> {
        self.inner()?.reset
    }

    /// Whether the stream was abruptly closed
    pub fn is_aborted(&self) -> bool {
        self.inner().is_some_and(|s| s.aborted)
    }

    /// Bytes written but not yet acknowledged
    pub fn buffered(&self) -> usize {
        self.inner().map_or(0, |s| s.write_buffered)
    }

    /// Buffering threshold for both halves
    pub fn high_water_mark(&self) -> Option<usize> {
        Some(self.inner()?.hwm)
    }

    /// Lifecycle phase
    pub fn phase(&self) -> StreamPhase {
        let Some(stream) = self.inner() else {
            return StreamPhase::Destroyed;
        };
        if stream.id.is_none() {
            return StreamPhase::Pending;
        }
        match (stream.readable, stream.writable && !stream.end_requested) {
            (true, true) => StreamPhase::Open,
            (false, true) => StreamPhase::HalfClosed(Half::Read),
            (true, false) => StreamPhase::HalfClosed(Half::Write),
            (false, false) => StreamPhase::Closed,
        }
    }

    /// Statistics
    pub fn stats(&self) -> Option<StreamStats> {
        Some(self.inner()?.stats)
    }

    fn inner(&self) -> Option<&StreamInner> {
        self.socket
            .sessions
            .get(&self.handle.session)?
            .streams
            .get(&self.handle.key)
    }

    fn inner_mut(&mut self, op: &'static str) -> Result<&mut StreamInner, Error> {
        self.socket
            .stream_inner(self.handle)
            .ok_or(Error::destroyed("Stream", op))
    }
}
