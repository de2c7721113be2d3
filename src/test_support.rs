use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::engine::{ScriptContext, ScriptEngine, ScriptError};
use crate::protocol::{self as fcgi, Message, RequestRecord, ResponseRecord};
use crate::request::{Host, Params};


pub(crate) fn encode_params(pairs: &[(&[u8], &[u8])]) -> Vec<u8> {
    let mut out = Vec::new();
    fcgi::nv::encode(pairs.iter().copied(), &mut out).expect("test parameters should fit into VarInts");
    out
}

pub(crate) fn params(pairs: &[(&[u8], &[u8])]) -> Params {
    Params::parse(&encode_params(pairs))
}

/// Creates an empty, writable file and returns its canonical path.
pub(crate) fn script_file(dir: &Path, name: &str) -> io::Result<PathBuf> {
    let path = dir.join(name);
    std::fs::write(&path, "")?;
    path.canonicalize()
}


pub(crate) fn script_context(params: Params, stdin: &[u8]) -> (ScriptContext, mpsc::Receiver<ResponseRecord>) {
    let (tx, rx) = mpsc::channel(64);
    let ctx = ScriptContext::new(params, stdin.to_vec(), Vec::new(), Arc::default(), std::env::temp_dir(), tx);
    (ctx, rx)
}

/// Collects all records sent so far without waiting.
pub(crate) fn drain(rx: &mut mpsc::Receiver<ResponseRecord>) -> Vec<ResponseRecord> {
    let mut recs = Vec::new();
    while let Ok(r) = rx.try_recv() {
        recs.push(r);
    }
    recs
}


type Behavior = fn(&Path, &mut ScriptContext) -> Result<(), ScriptError>;

pub(crate) struct MockEngine {
    pub(crate) calls: AtomicUsize,
    behavior: Behavior,
}

impl ScriptEngine for MockEngine {
    fn execute(&self, script: &Path, ctx: &mut ScriptContext) -> Result<(), ScriptError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.behavior)(script, ctx)
    }
}

pub(crate) fn mock_host(behavior: Behavior) -> (Host, Arc<MockEngine>) {
    let engine = Arc::new(MockEngine { calls: AtomicUsize::new(0), behavior });
    (Host::with_caches(engine.clone(), Arc::default()), engine)
}


pub(crate) fn begin_body(keep_conn: bool) -> fcgi::body::BeginRequest {
    let flags = if keep_conn { fcgi::RequestFlags::KeepConn } else { fcgi::RequestFlags::empty() };
    fcgi::body::BeginRequest { role: fcgi::Role::Responder, flags }
}

/// Builds the byte stream a FastCGI client would send.
#[derive(Debug, Default)]
pub(crate) struct Client {
    pub(crate) buf: Vec<u8>,
}

impl Client {
    pub(crate) fn send(&mut self, request_id: u16, record: &RequestRecord) -> &mut Self {
        record.encode(request_id, &mut self.buf).expect("test records should fit into a frame");
        self
    }

    pub(crate) fn begin(&mut self, request_id: u16, keep_conn: bool) -> &mut Self {
        self.send(request_id, &RequestRecord::BeginRequest(begin_body(keep_conn)))
    }

    /// Sends `pairs` in a single record, followed by the end of the stream.
    pub(crate) fn params(&mut self, request_id: u16, pairs: &[(&[u8], &[u8])]) -> &mut Self {
        self.send(request_id, &RequestRecord::Params(encode_params(pairs)))
            .send(request_id, &RequestRecord::Params(Vec::new()))
    }

    pub(crate) fn stdin(&mut self, request_id: u16, data: &[u8]) -> &mut Self {
        if !data.is_empty() {
            self.send(request_id, &RequestRecord::Stdin(data.to_vec()));
        }
        self.send(request_id, &RequestRecord::Stdin(Vec::new()))
    }

    /// A complete request for `script` with an empty body.
    pub(crate) fn request(&mut self, request_id: u16, keep_conn: bool, script: &Path) -> &mut Self {
        let filename = script.as_os_str().as_encoded_bytes();
        self.begin(request_id, keep_conn)
            .params(request_id, &[(b"SCRIPT_FILENAME", filename)])
            .stdin(request_id, b"")
    }

    pub(crate) fn get_values(&mut self, names: &[&[u8]]) -> &mut Self {
        let pairs: Vec<(&[u8], &[u8])> = names.iter().map(|&n| (n, &b""[..])).collect();
        self.send(fcgi::FCGI_NULL_REQUEST_ID, &RequestRecord::GetValues(encode_params(&pairs)))
    }
}

/// Decodes everything an application wrote, as a FastCGI client would.
pub(crate) fn decode_responses(mut input: &[u8]) -> Vec<Message<ResponseRecord>> {
    let mut msgs = Vec::new();
    while let Some((msg, used)) = Message::<ResponseRecord>::decode(input).expect("valid response stream") {
        msgs.push(msg);
        input = &input[used..];
    }
    msgs
}


/// Yields its input in randomly sized pieces of 1 to 64 bytes.
#[derive(Debug)]
pub(crate) struct ChunkedReader<'a>(pub(crate) &'a [u8]);

impl futures_util::io::AsyncRead for ChunkedReader<'_> {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        _: &mut std::task::Context,
        buf: &mut [u8],
    ) -> std::task::Poll<io::Result<usize>> {
        let data = self.0;
        let n = buf.len().min(data.len()).min(fastrand::usize(1..=64));
        buf[..n].copy_from_slice(&data[..n]);
        self.0 = &data[n..];
        std::task::Poll::Ready(Ok(n))
    }
}
