//! The read-dispatch-write loop of a single FastCGI connection.

use std::io;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};

use event_listener::Event;
use futures_util::future::{self, Either};
use futures_util::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::macros::trace;
use crate::management;
use crate::protocol::{self as fcgi, FrameHead, Limits, Message, RecordHeader, RequestRecord, ResponseRecord};
use crate::request::{Host, RequestState, Step};
use crate::{Config, ExitStatus};


/// Errors that end a FastCGI connection.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Reading from or writing to the connection failed.
    #[error("FastCGI connection I/O failed")]
    Io(#[from] io::Error),
    /// The client violated the FastCGI framing rules.
    #[error("FastCGI framing violated")]
    Protocol(#[from] fcgi::Error),
}


/// Reads the next message sent by a FastCGI client.
///
/// Returns `Ok(None)` if the stream ends cleanly before the first header byte.
///
/// # Errors
/// Fails on I/O errors, truncated records and any error from
/// [`RequestRecord::decode`].
pub async fn read_message<R>(input: &mut R) -> Result<Option<Message<RequestRecord>>, Error>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut head = [0; RecordHeader::LEN];
    match read_full(input, &mut head).await? {
        0 => return Ok(None),
        RecordHeader::LEN => (),
        n => return Err(fcgi::Error::TruncatedHeader(n).into()),
    }
    let head = FrameHead::from_bytes(head)?;

    let mut body = vec![0; head.body_len()];
    let actual = read_full(input, &mut body).await?;
    if actual < body.len() {
        return Err(fcgi::Error::TruncatedBody { expected: body.len(), actual }.into());
    }
    body.truncate(head.content_length.into());

    let record = RequestRecord::decode(&head, body)?;
    Ok(Some(Message { request_id: head.request_id, record }))
}

/// Fills as much of `buf` as possible, stopping early only at EOF.
async fn read_full<R>(input: &mut R, buf: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]).await {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => (),
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Writes a single record for `request_id` and flushes it to the client.
///
/// `buf` is scratch space for the encoded record.
///
/// # Errors
/// Fails on I/O errors and any error from [`ResponseRecord::encode`].
pub async fn write_message<W>(
    output: &mut W,
    request_id: u16,
    record: &ResponseRecord,
    buf: &mut Vec<u8>,
) -> Result<(), Error>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    buf.clear();
    record.encode(request_id, buf)?;
    output.write_all(buf).await?;
    output.flush().await?;
    Ok(())
}


/// A signal telling connections to stop after their current message.
#[derive(Debug, Default)]
pub struct Shutdown {
    triggered: AtomicBool,
    event: Event,
}

impl Shutdown {
    /// Creates an untriggered [`Shutdown`] signal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Triggers the signal and wakes all waiting connections.
    pub fn trigger(&self) {
        if !self.triggered.swap(true, Ordering::AcqRel) {
            self.event.notify(usize::MAX);
        }
    }

    /// Tests whether the signal was triggered.
    #[inline]
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::Acquire)
    }

    /// Waits until the signal is triggered.
    pub async fn wait(&self) {
        while !self.is_triggered() {
            let listener = self.event.listen();
            // The signal may have fired before the listener was registered
            if self.is_triggered() {
                break;
            }
            listener.await;
        }
    }
}


/// A single FastCGI connection, multiplexing any number of requests.
///
/// Records are processed strictly in order. Once a script starts, its
/// output is forwarded until its `EndRequest` before the next record
/// is read.
#[derive(Debug)]
pub struct Connection<R, W> {
    input: BufReader<R>,
    output: W,
    host: Host,
    limits: Limits,
    /// Indexed by request ID - 1.
    requests: Vec<Option<RequestState>>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin, W: AsyncWrite + Unpin> Connection<R, W> {
    /// Creates a [`Connection`] over a read and a write half.
    pub fn new(input: R, output: W, host: Host, config: &Config) -> Self {
        Self {
            input: BufReader::with_capacity(fcgi::MAX_STREAM_PAYLOAD + RecordHeader::LEN, input),
            output,
            host,
            limits: config.limits(),
            requests: Vec::new(),
            buf: Vec::with_capacity(fcgi::MAX_STREAM_PAYLOAD + RecordHeader::LEN),
        }
    }

    /// Processes messages until the client closes the connection, a request
    /// asks to close it, or `shutdown` is triggered.
    ///
    /// # Errors
    /// Fails on any I/O or framing error. The connection must be dropped
    /// afterwards.
    pub async fn run(mut self, shutdown: &Shutdown) -> Result<(), Error> {
        loop {
            let next = if shutdown.is_triggered() {
                None
            } else {
                let read = pin!(read_message(&mut self.input));
                let stop = pin!(shutdown.wait());
                match future::select(read, stop).await {
                    Either::Left((msg, _)) => Some(msg?),
                    Either::Right(((), _)) => None,
                }
            };
            let Some(msg) = next else {
                tracing::debug!(active = self.active(), "connection stopped by shutdown");
                return Ok(());
            };

            let Some(msg) = msg else {
                tracing::debug!(active = self.active(), "connection closed by client");
                return Ok(());
            };
            if !self.handle(msg).await? {
                tracing::debug!("connection closed after last request");
                return self.output.close().await.map_err(Error::from);
            }
        }
    }

    fn active(&self) -> usize {
        self.requests.iter().flatten().count()
    }

    /// Handles a single message, returning whether to keep the connection.
    async fn handle(&mut self, msg: Message<RequestRecord>) -> Result<bool, Error> {
        let management = msg.is_management();
        let Message { request_id, record } = msg;
        trace!(request_id, rtype = record.type_code(), "record received");

        if management || matches!(record, RequestRecord::Unrecognized(_)) {
            if let Some(resp) = management::handle(record, &self.limits) {
                self.write(fcgi::FCGI_NULL_REQUEST_ID, &resp).await?;
            }
            return Ok(true);
        }

        let slot = usize::from(request_id - 1);
        let step = match record {
            RequestRecord::BeginRequest(begin) => {
                self.begin(request_id, begin).await?;
                return Ok(true);
            },
            RequestRecord::BeginUnknownRole(role) => {
                tracing::warn!(request_id, role, "request with unknown role rejected");
                self.write(request_id, &ExitStatus::UnknownRole.to_record()).await?;
                return Ok(true);
            },
            record => match self.requests.get_mut(slot) {
                Some(Some(req)) => req.handle(record, &self.host),
                _ => {
                    tracing::warn!(request_id, ?record, "record for inactive request ignored");
                    return Ok(true);
                },
            },
        };

        match step {
            Step::Pending => return Ok(true),
            Step::Respond(end) => self.write(request_id, &end).await?,
            Step::Execute(mut exec) => {
                while let Some(rec) = exec.next().await {
                    self.write(request_id, &rec).await?;
                }
            },
        }
        Ok(self.end(request_id))
    }

    async fn begin(&mut self, request_id: u16, begin: fcgi::body::BeginRequest) -> Result<(), Error> {
        let slot = usize::from(request_id - 1);
        if let Some(prev) = self.requests.get_mut(slot).and_then(Option::take) {
            tracing::warn!(request_id, dispatched = prev.is_dispatched(), "BeginRequest for active request, previous state discarded");
        }

        let active = self.active();
        if active >= self.limits.max_reqs {
            tracing::warn!(request_id, active, "request rejected, connection overloaded");
            return self.write(request_id, &ExitStatus::Overloaded.to_record()).await;
        }

        tracing::debug!(request_id, role = ?begin.role, keep_conn = begin.keep_conn(), "request started");
        if self.requests.len() <= slot {
            self.requests.resize_with(slot + 1, || None);
        }
        self.requests[slot] = Some(RequestState::new(request_id, begin));
        Ok(())
    }

    /// Clears the slot of a completed request, returning whether to keep
    /// the connection. Only the flags of that request count.
    fn end(&mut self, request_id: u16) -> bool {
        let slot = usize::from(request_id - 1);
        let Some(req) = self.requests.get_mut(slot).and_then(Option::take) else {
            return true;
        };
        tracing::debug!(request_id, "request completed");
        req.keep_conn() || self.requests.iter().any(Option::is_some)
    }

    async fn write(&mut self, request_id: u16, record: &ResponseRecord) -> Result<(), Error> {
        trace!(request_id, rtype = ?record.rtype(), "record sent");
        write_message(&mut self.output, request_id, record, &mut self.buf).await
    }
}
