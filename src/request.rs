//! Assembly of single FastCGI requests and the dispatch of their scripts.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use compact_str::CompactString;
use smallvec::SmallVec;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::cache::CacheRegistry;
use crate::engine::{ScriptContext, ScriptEngine};
use crate::macros::trace;
use crate::protocol::{self as fcgi, RequestRecord, ResponseRecord};
use crate::{app_status, ExitStatus};


/// Inline capacity for single parameter values.
const INLINE_BYTES: usize = 32;
type SmallBytes = SmallVec<[u8; INLINE_BYTES]>;

/// The number of output records buffered between a script and its connection.
const OUTPUT_QUEUE: usize = 16;


/// The parameters (CGI/1.1 environment) of a request.
///
/// Names are decoded lossily as UTF-8 and compared case-sensitively.
/// A name sent more than once keeps all of its values in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params {
    map: HashMap<CompactString, SmallVec<[SmallBytes; 1]>>,
}

impl Params {
    /// Decodes a complete, concatenated `Params` stream.
    ///
    /// An incomplete trailing name-value pair is logged and dropped.
    #[must_use]
    pub fn parse(encoded: &[u8]) -> Self {
        let mut nvit = fcgi::nv::NVIter::new(encoded);
        let params = (&mut nvit).collect();
        let remaining = nvit.into_inner().len();
        if remaining != 0 {
            tracing::warn!(bytes = remaining, "Params stream ends with incomplete name-value pair");
        }
        params
    }

    /// Returns the first value of `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.map.get(name).and_then(|v| v.first()).map(|v| &v[..])
    }

    /// Returns the value of `name` if it was sent exactly once.
    #[must_use]
    pub fn single(&self, name: &str) -> Option<&[u8]> {
        match self.map.get(name).map(|v| &v[..]) {
            Some([v]) => Some(v),
            _ => None,
        }
    }

    /// Returns the value of `name` if it was sent exactly once and is
    /// valid UTF-8.
    #[must_use]
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.single(name).and_then(|v| std::str::from_utf8(v).ok())
    }

    /// Returns an iterator over all values of `name`.
    pub fn get_all(&self, name: &str) -> impl Iterator<Item = &[u8]> + '_ {
        self.map.get(name).into_iter().flatten().map(|v| &v[..])
    }

    /// Tests whether `name` was sent at all.
    #[inline]
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    /// Returns the number of distinct names.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Tests whether no parameters were sent.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Returns an iterator over all name-value pairs in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> + '_ {
        self.map.iter()
            .flat_map(|(n, vals)| vals.iter().map(move |v| (n.as_str(), &v[..])))
    }
}

impl<'a> FromIterator<(&'a [u8], &'a [u8])> for Params {
    fn from_iter<I: IntoIterator<Item = (&'a [u8], &'a [u8])>>(iter: I) -> Self {
        let mut map: HashMap<_, SmallVec<[SmallBytes; 1]>> = HashMap::new();
        for (name, val) in iter {
            let name = CompactString::from_utf8_lossy(name);
            map.entry(name).or_default().push(SmallBytes::from_slice(val));
        }
        Self { map }
    }
}


/// Finds the script file a request refers to.
///
/// `SCRIPT_FILENAME` is used if it names an existing file. Otherwise
/// `DOCUMENT_ROOT` and `SCRIPT_NAME` are concatenated as strings. Each
/// parameter must have been sent exactly once. The result is canonical.
#[must_use]
pub fn resolve_script(params: &Params) -> Option<PathBuf> {
    let filename = params.get_str("SCRIPT_FILENAME");
    let root = params.get_str("DOCUMENT_ROOT");
    let name = params.get_str("SCRIPT_NAME");

    let found = if let Some(f) = filename.map(Path::new).filter(|p| p.is_file()) {
        tracing::debug!(script = %f.display(), "script resolved via SCRIPT_FILENAME");
        f.to_path_buf()
    } else if let Some(p) = root.zip(name).map(|(r, n)| PathBuf::from(format!("{r}{n}"))).filter(|p| p.is_file()) {
        tracing::debug!(script = %p.display(), "script resolved via DOCUMENT_ROOT and SCRIPT_NAME");
        p
    } else {
        tracing::warn!(?filename, ?root, ?name, "script could not be resolved");
        return None;
    };

    match found.canonicalize() {
        Ok(p) => Some(p),
        Err(e) => {
            let error: &dyn std::error::Error = &e;
            tracing::warn!(script = %found.display(), error, "script path could not be canonicalized");
            None
        },
    }
}


/// The services shared by all requests of a server.
#[derive(Clone)]
pub struct Host {
    engine: Arc<dyn ScriptEngine>,
    caches: Arc<CacheRegistry>,
}

impl Host {
    /// Creates a [`Host`] running scripts with `engine` and an empty cache.
    pub fn new(engine: impl ScriptEngine) -> Self {
        Self::with_caches(Arc::new(engine), Arc::default())
    }

    /// Creates a [`Host`] from its parts.
    #[must_use]
    pub fn with_caches(engine: Arc<dyn ScriptEngine>, caches: Arc<CacheRegistry>) -> Self {
        Self { engine, caches }
    }

    /// Returns the cache partitions of all scripts.
    #[inline]
    #[must_use]
    pub fn caches(&self) -> &Arc<CacheRegistry> {
        &self.caches
    }
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Host")
            .field("caches", &self.caches)
            .finish_non_exhaustive()
    }
}


#[derive(Debug, Default)]
struct InputStream {
    buffer: Vec<u8>,
    started: bool,
    done: bool,
}

impl InputStream {
    fn push(&mut self, data: Vec<u8>) {
        self.started = true;
        if self.done {
            trace!("input stream already closed, record ignored");
        } else if data.is_empty() {
            self.done = true;
        } else {
            self.buffer.extend_from_slice(&data);
        }
    }
}

#[derive(Debug)]
enum ParamsStream {
    Reading(Vec<u8>),
    Done(Params),
}

#[derive(Debug)]
struct Collecting {
    params: ParamsStream,
    stdin: InputStream,
    data: InputStream,
}

impl Collecting {
    /// A request is ready once its parameters and stdin are complete, and
    /// its data stream is either complete or was never started.
    fn is_ready(&self) -> bool {
        matches!(self.params, ParamsStream::Done(_))
            && self.stdin.done
            && (!self.data.started || self.data.done)
    }
}

#[derive(Debug)]
enum State {
    Collecting(Collecting),
    Dispatched,
    Completed,
}


/// What the connection has to do after feeding a record to a request.
#[derive(Debug)]
#[must_use]
pub enum Step {
    /// Nothing to send yet.
    Pending,
    /// The request ends immediately with this `EndRequest` record.
    Respond(ResponseRecord),
    /// The script was started. Its output must be forwarded until the
    /// [`Execution`] is exhausted.
    Execute(Execution),
}


/// The state of a single FastCGI request while it is being assembled.
#[derive(Debug)]
pub struct RequestState {
    request_id: u16,
    keep_conn: bool,
    state: State,
}

impl RequestState {
    /// Creates the state for a request started by `begin`.
    #[must_use]
    pub fn new(request_id: u16, begin: fcgi::body::BeginRequest) -> Self {
        let collecting = Collecting {
            params: ParamsStream::Reading(Vec::new()),
            stdin: InputStream::default(),
            data: InputStream::default(),
        };
        Self { request_id, keep_conn: begin.keep_conn(), state: State::Collecting(collecting) }
    }

    /// Returns the ID of this request.
    #[inline]
    #[must_use]
    pub fn request_id(&self) -> u16 {
        self.request_id
    }

    /// Tests whether the client wants to keep the connection after this request.
    #[inline]
    #[must_use]
    pub fn keep_conn(&self) -> bool {
        self.keep_conn
    }

    /// Tests whether the script was started or the request was ended.
    #[inline]
    #[must_use]
    pub fn is_dispatched(&self) -> bool {
        !matches!(self.state, State::Collecting(_))
    }

    /// Feeds the next record of this request into the state machine.
    ///
    /// The script is started as soon as all input is complete, so this
    /// must run inside a tokio runtime.
    pub fn handle(&mut self, record: RequestRecord, host: &Host) -> Step {
        let request_id = self.request_id;
        let State::Collecting(c) = &mut self.state else {
            trace!(request_id, ?record, "record for dispatched request ignored");
            return Step::Pending;
        };

        match record {
            RequestRecord::Params(data) => match &mut c.params {
                ParamsStream::Reading(buf) if data.is_empty() => {
                    let params = Params::parse(buf);
                    trace!(request_id, count = params.len(), "params complete");
                    c.params = ParamsStream::Done(params);
                },
                ParamsStream::Reading(buf) => buf.extend_from_slice(&data),
                ParamsStream::Done(_) => {
                    tracing::warn!(request_id, "Params record after end of Params stream ignored");
                },
            },
            RequestRecord::Stdin(data) => c.stdin.push(data),
            RequestRecord::Data(data) => c.data.push(data),
            RequestRecord::AbortRequest => {
                tracing::debug!(request_id, "request aborted before its script started");
                self.state = State::Completed;
                return Step::Respond(ExitStatus::Complete(app_status::ABORTED).to_record());
            },
            r => {
                tracing::warn!(request_id, record = ?r, "unexpected record for active request ignored");
                return Step::Pending;
            },
        }

        if !c.is_ready() {
            return Step::Pending;
        }
        replace_with::replace_with_or_abort_and_return(&mut self.state, |state| match state {
            State::Collecting(c) => dispatch(request_id, c, host),
            s => (Step::Pending, s),
        })
    }
}

fn dispatch(request_id: u16, input: Collecting, host: &Host) -> (Step, State) {
    let params = match input.params {
        ParamsStream::Done(p) => p,
        reading => return (Step::Pending, State::Collecting(Collecting { params: reading, ..input })),
    };
    let Some(script) = resolve_script(&params) else {
        let end = ExitStatus::Complete(app_status::SCRIPT_NOT_FOUND).to_record();
        return (Step::Respond(end), State::Completed);
    };

    let working_dir = script.parent().map(Path::to_path_buf).unwrap_or_default();
    let cache = host.caches.partition(&script);
    let (tx, rx) = mpsc::channel(OUTPUT_QUEUE);
    let ctx = ScriptContext::new(params, input.stdin.buffer, input.data.buffer, cache, working_dir, tx);

    let engine = host.engine.clone();
    let span = tracing::debug_span!("script", request_id, script = %script.display());
    let task = tokio::task::spawn_blocking(move || {
        let _enter = span.enter();
        run_script(&*engine, &script, ctx);
    });
    (Step::Execute(Execution::new(rx, task)), State::Dispatched)
}

fn run_script(engine: &dyn ScriptEngine, script: &Path, mut ctx: ScriptContext) {
    tracing::debug!("script started");
    let res = panic::catch_unwind(AssertUnwindSafe(|| engine.execute(script, &mut ctx)));
    let status = match res {
        Ok(Ok(())) => app_status::SUCCESS,
        Ok(Err(e)) => {
            let error: &dyn std::error::Error = &e;
            tracing::error!(error, "script failed");
            e.app_status()
        },
        Err(_) => {
            tracing::error!("script engine panicked");
            app_status::ENGINE_FAILED
        },
    };
    tracing::debug!(app_status = status, "script finished");
    ctx.finish(status);
}


/// The output of a running script, as a sequence of response records.
///
/// The sequence always ends with an `EndRequest` record. If the script's
/// worker ends without sending one, the response is completed with
/// [`app_status::ENGINE_FAILED`].
#[derive(Debug)]
pub struct Execution {
    output: mpsc::Receiver<ResponseRecord>,
    task: Option<JoinHandle<()>>,
    wrote_stdout: bool,
    stdout_closed: bool,
    fallback: VecDeque<ResponseRecord>,
    done: bool,
}

impl Execution {
    fn new(output: mpsc::Receiver<ResponseRecord>, task: JoinHandle<()>) -> Self {
        Self {
            output,
            task: Some(task),
            wrote_stdout: false,
            stdout_closed: false,
            fallback: VecDeque::new(),
            done: false,
        }
    }

    /// Returns the next record to send, or [`None`] after the `EndRequest`.
    pub async fn next(&mut self) -> Option<ResponseRecord> {
        if let Some(rec) = self.fallback.pop_front() {
            return Some(rec);
        }
        if self.done {
            return None;
        }

        match self.output.recv().await {
            Some(rec) => {
                match &rec {
                    ResponseRecord::Stdout(b) if b.is_empty() => self.stdout_closed = true,
                    ResponseRecord::Stdout(_) => self.wrote_stdout = true,
                    ResponseRecord::EndRequest(_) => self.done = true,
                    _ => (),
                }
                Some(rec)
            },
            None => {
                self.done = true;
                if let Some(task) = self.task.take() {
                    if let Err(e) = task.await {
                        let error: &dyn std::error::Error = &e;
                        tracing::error!(error, "script worker failed");
                    }
                }
                tracing::error!("script ended without completing its response");
                if !self.wrote_stdout {
                    self.fallback.push_back(ResponseRecord::Stdout(crate::cgi::response::FAILURE_HEADERS.to_vec()));
                }
                if !self.stdout_closed {
                    self.fallback.push_back(ResponseRecord::Stdout(Vec::new()));
                }
                self.fallback.push_back(ExitStatus::Complete(app_status::ENGINE_FAILED).to_record());
                self.fallback.pop_front()
            },
        }
    }
}
