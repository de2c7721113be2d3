use std::ffi::OsStr;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;

use compact_str::CompactString;
use tokio::sync::mpsc;

use crate::app_status;
use crate::cache::ScriptCache;
use crate::cgi::{self, Headers};
use crate::protocol::{ResponseRecord, MAX_STREAM_PAYLOAD};
use crate::request::Params;


/// The outcome of a script that did not complete successfully.
#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    /// The script ran, but reported a failure.
    #[error("script failed: {0}")]
    Failed(CompactString),
    /// The script could not be run, or the engine failed while running it.
    #[error("script engine failed")]
    Engine(#[from] io::Error),
}

impl ScriptError {
    /// Returns the `app_status` reported to the FastCGI client.
    #[must_use]
    pub fn app_status(&self) -> u32 {
        match self {
            Self::Failed(_) => app_status::SCRIPT_FAILED,
            Self::Engine(_) => app_status::ENGINE_FAILED,
        }
    }
}


/// Runs the script resolved for a request.
///
/// [`ScriptEngine::execute`] is called on a blocking worker thread, so it
/// may block freely. Output written through the [`ScriptContext`] is
/// forwarded to the FastCGI client while the script is still running.
pub trait ScriptEngine: Send + Sync + 'static {
    /// Executes the script at `script`, a canonical path to an existing file.
    ///
    /// # Errors
    /// Returns [`ScriptError::Failed`] if the script itself failed, or
    /// [`ScriptError::Engine`] if it could not be run. Output written before
    /// the failure is still delivered.
    fn execute(&self, script: &Path, ctx: &mut ScriptContext) -> Result<(), ScriptError>;
}

impl<E: ScriptEngine + ?Sized> ScriptEngine for Arc<E> {
    #[inline]
    fn execute(&self, script: &Path, ctx: &mut ScriptContext) -> Result<(), ScriptError> {
        (**self).execute(script, ctx)
    }
}


/// Everything a script can observe and produce during a single request.
///
/// The response headers may be changed until the first call to
/// `ScriptContext::write_output`, which sends them ahead of the body.
/// Later changes are logged and have no effect.
#[derive(Debug)]
pub struct ScriptContext {
    params: Params,
    stdin: io::Cursor<Vec<u8>>,
    data: io::Cursor<Vec<u8>>,
    headers: Headers,
    cache: Arc<ScriptCache>,
    working_dir: PathBuf,
    output: mpsc::Sender<ResponseRecord>,
    headers_sent: bool,
    wrote_error: bool,
}

impl ScriptContext {
    pub(crate) fn new(
        params: Params,
        stdin: Vec<u8>,
        data: Vec<u8>,
        cache: Arc<ScriptCache>,
        working_dir: PathBuf,
        output: mpsc::Sender<ResponseRecord>,
    ) -> Self {
        Self {
            params,
            stdin: io::Cursor::new(stdin),
            data: io::Cursor::new(data),
            headers: Headers::new(),
            cache,
            working_dir,
            output,
            headers_sent: false,
            wrote_error: false,
        }
    }

    /// Returns the request parameters (the CGI/1.1 environment).
    #[inline]
    #[must_use]
    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Returns the single UTF-8 value of the parameter `name`, if any.
    #[inline]
    #[must_use]
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get_str(name)
    }

    /// Returns the request body as a buffered reader.
    #[inline]
    pub fn stdin(&mut self) -> &mut impl BufRead {
        &mut self.stdin
    }

    /// Returns the filter data stream as a buffered reader. It is empty
    /// unless the client sent `Data` records.
    #[inline]
    pub fn data(&mut self) -> &mut impl BufRead {
        &mut self.data
    }

    /// Reads the next line of the request body without its line terminator.
    ///
    /// Returns [`None`] at the end of the body. Invalid UTF-8 is replaced.
    pub fn read_input_line(&mut self) -> Option<String> {
        let mut line = Vec::new();
        match self.stdin.read_until(b'\n', &mut line) {
            Ok(0) | Err(_) => return None,
            Ok(_) => (),
        }
        if line.last() == Some(&b'\n') {
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    /// Returns the response headers.
    #[inline]
    #[must_use]
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns all values of the response header `name`.
    #[inline]
    #[must_use]
    pub fn header(&self, name: &str) -> &[CompactString] {
        self.headers.get(name)
    }

    /// Replaces the values of the response header `name`.
    pub fn set_header<I, V>(&mut self, name: &str, values: I)
    where
        I: IntoIterator<Item = V>,
        V: Into<CompactString>,
    {
        self.warn_if_sent(name);
        self.headers.set(name, values);
    }

    /// Appends a value to the response header `name`.
    pub fn add_header(&mut self, name: &str, value: impl Into<CompactString>) {
        self.warn_if_sent(name);
        self.headers.add(name, value);
    }

    /// Sets the HTTP status of the response.
    pub fn set_status(&mut self, status: http::StatusCode) {
        self.warn_if_sent("Status");
        self.headers.set_status(status);
    }

    fn warn_if_sent(&self, name: &str) {
        if self.headers_sent {
            tracing::error!(header = name, "response header changed after headers were sent");
        }
    }

    /// Tests whether the response headers were sent already.
    #[inline]
    #[must_use]
    pub fn headers_sent(&self) -> bool {
        self.headers_sent
    }

    /// Returns the cache partition shared by all requests for this script.
    #[inline]
    #[must_use]
    pub fn cache(&self) -> &ScriptCache {
        &self.cache
    }

    /// Returns the directory containing the script.
    #[inline]
    #[must_use]
    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Resolves `name` against the script's directory. Absolute paths are
    /// returned as they are. `.` components are dropped and `..` components
    /// remove their predecessor.
    #[must_use]
    pub fn path(&self, name: impl AsRef<Path>) -> PathBuf {
        let name = name.as_ref();
        let joined = if name.is_absolute() { name.to_path_buf() } else { self.working_dir.join(name) };

        let mut out = PathBuf::new();
        for c in joined.components() {
            match c {
                Component::CurDir => (),
                Component::ParentDir => {
                    out.pop();
                },
                c => out.push(c),
            }
        }
        out
    }

    /// Writes `buf` to the response body, sending the response headers
    /// first if this is the first write. An empty `buf` only sends the
    /// headers.
    ///
    /// # Errors
    /// Fails with [`io::ErrorKind::BrokenPipe`] if the FastCGI connection
    /// is gone.
    pub fn write_output(&mut self, buf: &[u8]) -> io::Result<()> {
        if self.headers_sent {
            return self.send_chunks(buf, ResponseRecord::Stdout);
        }
        let mut head = Vec::with_capacity(buf.len() + 64);
        self.headers.write_block(&mut head);
        head.extend_from_slice(buf);
        self.headers_sent = true;
        self.send_chunks(&head, ResponseRecord::Stdout)
    }

    /// Writes `buf` to the diagnostic stream. Empty writes are ignored.
    ///
    /// # Errors
    /// Fails with [`io::ErrorKind::BrokenPipe`] if the FastCGI connection
    /// is gone.
    pub fn write_error(&mut self, buf: &[u8]) -> io::Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        self.wrote_error = true;
        self.send_chunks(buf, ResponseRecord::Stderr)
    }

    /// Returns an [`io::Write`] adapter over `ScriptContext::write_output`.
    #[inline]
    pub fn stdout(&mut self) -> Output<'_> {
        Output { ctx: self, stderr: false }
    }

    /// Returns an [`io::Write`] adapter over `ScriptContext::write_error`.
    #[inline]
    pub fn stderr(&mut self) -> Output<'_> {
        Output { ctx: self, stderr: true }
    }

    fn send_chunks(&self, buf: &[u8], wrap: fn(Vec<u8>) -> ResponseRecord) -> io::Result<()> {
        for chunk in buf.chunks(MAX_STREAM_PAYLOAD) {
            self.send(wrap(chunk.to_vec()))?;
        }
        Ok(())
    }

    fn send(&self, record: ResponseRecord) -> io::Result<()> {
        self.output.blocking_send(record)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "FastCGI connection closed"))
    }

    /// Sends the records closing the response: a default header block if
    /// nothing was written, the end markers of both output streams, and
    /// the final `EndRequest`.
    pub(crate) fn finish(mut self, app_status: u32) {
        if self.send_trailer(app_status).is_err() {
            tracing::debug!(app_status, "connection closed before the response was complete");
        }
    }

    fn send_trailer(&mut self, app_status: u32) -> io::Result<()> {
        if !self.headers_sent {
            let head = if app_status == app_status::SUCCESS {
                cgi::response::EMPTY_HEADERS
            } else {
                cgi::response::FAILURE_HEADERS
            };
            self.headers_sent = true;
            self.send(ResponseRecord::Stdout(head.to_vec()))?;
        }
        self.send(ResponseRecord::Stdout(Vec::new()))?;
        if self.wrote_error {
            self.send(ResponseRecord::Stderr(Vec::new()))?;
        }
        self.send(crate::ExitStatus::Complete(app_status).to_record())
    }
}


/// An [`io::Write`] adapter for one of the output streams of a
/// [`ScriptContext`].
#[derive(Debug)]
pub struct Output<'a> {
    ctx: &'a mut ScriptContext,
    stderr: bool,
}

impl Write for Output<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let res = if self.stderr { self.ctx.write_error(buf) } else { self.ctx.write_output(buf) };
        res.and(Ok(buf.len()))
    }

    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}


/// A [`ScriptEngine`] running every script as a CGI/1.1 child process.
///
/// The request parameters become the child's environment and the request
/// body its standard input. The child's standard output is parsed as a
/// CGI/1.1 response: its header lines up to the first empty line are added
/// to the response headers, everything after that is the body. Standard
/// error is forwarded as diagnostic output. A non-zero exit code is
/// reported as [`ScriptError::Failed`].
#[derive(Debug, Clone, Default)]
pub struct ProcessEngine {
    interpreter: Option<PathBuf>,
}

impl ProcessEngine {
    /// Creates a [`ProcessEngine`] executing scripts directly.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a [`ProcessEngine`] that runs `interpreter` with the script
    /// path as its only argument.
    #[inline]
    #[must_use]
    pub fn with_interpreter(interpreter: impl Into<PathBuf>) -> Self {
        Self { interpreter: Some(interpreter.into()) }
    }

    fn command(&self, script: &Path) -> Command {
        match &self.interpreter {
            Some(i) => {
                let mut cmd = Command::new(i);
                cmd.arg(script);
                cmd
            },
            None => Command::new(script),
        }
    }
}

impl ScriptEngine for ProcessEngine {
    fn execute(&self, script: &Path, ctx: &mut ScriptContext) -> Result<(), ScriptError> {
        let mut cmd = self.command(script);
        cmd.current_dir(ctx.working_dir())
            .env_clear()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(path) = std::env::var_os("PATH") {
            cmd.env("PATH", path);
        }
        for (name, val) in ctx.params().iter() {
            // Such names or values would make spawning fail
            if name.contains(['=', '\0']) || val.contains(&0) {
                tracing::debug!(name, "parameter not passed to script environment");
                continue;
            }
            cmd.env(name, os_str(val));
        }

        let mut child = cmd.spawn()?;
        tracing::debug!(pid = child.id(), "script process started");
        let (Some(mut child_in), Some(child_out), Some(mut child_err)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(io::Error::other("child process pipes missing").into());
        };
        let input = std::mem::take(ctx.stdin.get_mut());

        let (out_res, err_res) = thread::scope(|s| {
            s.spawn(move || {
                // Scripts may exit without reading their input
                if let Err(e) = child_in.write_all(&input) {
                    if e.kind() != io::ErrorKind::BrokenPipe {
                        let error: &dyn std::error::Error = &e;
                        tracing::warn!(error, "writing script input failed");
                    }
                }
            });
            let err = s.spawn(move || {
                let mut buf = Vec::new();
                child_err.read_to_end(&mut buf).map(|_| buf)
            });
            let out = forward_cgi_output(child_out, ctx);
            let err = err.join().unwrap_or_else(|_| Ok(Vec::new()));
            (out, err)
        });

        let status = child.wait()?;
        ctx.write_error(&err_res?)?;
        out_res?;

        if status.success() {
            Ok(())
        } else {
            Err(ScriptError::Failed(compact_str::format_compact!("script process {status}")))
        }
    }
}

/// Parses the child's CGI/1.1 response and forwards it into `ctx`.
fn forward_cgi_output(out: impl Read, ctx: &mut ScriptContext) -> io::Result<()> {
    let mut out = BufReader::with_capacity(MAX_STREAM_PAYLOAD, out);
    let mut line = Vec::new();
    loop {
        line.clear();
        if out.read_until(b'\n', &mut line)? == 0 || cgi::response::is_block_end(&line) {
            break;
        }
        match cgi::response::parse_header_line(&line) {
            Some((name, val)) => ctx.headers.add(name, val),
            None => tracing::warn!(line = %String::from_utf8_lossy(&line), "invalid script header line ignored"),
        }
    }

    ctx.write_output(&[])?;
    io::copy(&mut out, &mut ctx.stdout())?;
    Ok(())
}

#[cfg(unix)]
fn os_str(v: &[u8]) -> &OsStr {
    use std::os::unix::ffi::OsStrExt;
    OsStr::from_bytes(v)
}

#[cfg(not(unix))]
fn os_str(v: &[u8]) -> std::ffi::OsString {
    String::from_utf8_lossy(v).into_owned().into()
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{drain, script_context};

    #[test]
    fn headers_precede_body() -> io::Result<()> {
        let (mut ctx, mut rx) = script_context(Params::default(), b"");
        ctx.set_header("Content-Type", ["text/plain"]);
        ctx.set_status(http::StatusCode::NOT_FOUND);
        write!(ctx.stdout(), "missing")?;
        ctx.add_header("X-Late", "ignored");
        ctx.write_output(b"!")?;
        ctx.finish(app_status::SUCCESS);

        let recs = drain(&mut rx);
        assert_eq!(recs, [
            ResponseRecord::Stdout(b"Content-Type:text/plain\nStatus:404 Not Found\n\nmissing".to_vec()),
            ResponseRecord::Stdout(b"!".to_vec()),
            ResponseRecord::Stdout(Vec::new()),
            crate::ExitStatus::Complete(0).to_record(),
        ]);
        Ok(())
    }

    #[test]
    fn default_headers() {
        let (ctx, mut rx) = script_context(Params::default(), b"");
        ctx.finish(app_status::SUCCESS);
        assert_eq!(drain(&mut rx)[0], ResponseRecord::Stdout(b"\n".to_vec()));

        let (mut ctx, mut rx) = script_context(Params::default(), b"");
        ctx.write_error(b"").expect("receiver alive");
        ctx.finish(app_status::SCRIPT_FAILED);
        assert_eq!(drain(&mut rx), [
            ResponseRecord::Stdout(b"Status:500 Internal Server Error\n\n".to_vec()),
            ResponseRecord::Stdout(Vec::new()),
            crate::ExitStatus::Complete(1).to_record(),
        ]);
    }

    #[test]
    fn chunked_output() -> io::Result<()> {
        let (mut ctx, mut rx) = script_context(Params::default(), b"");
        ctx.write_output(&[])?;
        ctx.write_output(&vec![b'x'; MAX_STREAM_PAYLOAD * 2 + 10])?;
        ctx.write_error(&vec![b'e'; MAX_STREAM_PAYLOAD + 1])?;
        ctx.finish(app_status::SUCCESS);

        let lens: Vec<_> = drain(&mut rx).iter().map(|r| match r {
            ResponseRecord::Stdout(b) => ('o', b.len()),
            ResponseRecord::Stderr(b) => ('e', b.len()),
            ResponseRecord::EndRequest(_) => ('x', 0),
            r => panic!("unexpected record {r:?}"),
        }).collect();
        assert_eq!(lens, [
            ('o', 1), ('o', MAX_STREAM_PAYLOAD), ('o', MAX_STREAM_PAYLOAD), ('o', 10),
            ('e', MAX_STREAM_PAYLOAD), ('e', 1), ('o', 0), ('e', 0), ('x', 0),
        ]);
        Ok(())
    }

    #[test]
    fn input_lines() {
        let (mut ctx, _rx) = script_context(Params::default(), b"first\r\nsecond\nlast");
        assert_eq!(ctx.read_input_line().as_deref(), Some("first"));
        assert_eq!(ctx.read_input_line().as_deref(), Some("second"));
        assert_eq!(ctx.read_input_line().as_deref(), Some("last"));
        assert_eq!(ctx.read_input_line(), None);
    }

    #[test]
    fn path_resolution() {
        let (ctx, _rx) = script_context(Params::default(), b"");
        let base = ctx.working_dir().to_path_buf();
        assert_eq!(ctx.path("data.txt"), base.join("data.txt"));
        assert_eq!(ctx.path("./sub/../other.txt"), base.join("other.txt"));
        assert_eq!(ctx.path("/etc/hosts"), PathBuf::from("/etc/hosts"));
    }

    #[test]
    fn closed_connection() {
        let (mut ctx, rx) = script_context(Params::default(), b"");
        drop(rx);
        let err = ctx.write_output(b"lost").expect_err("receiver is gone");
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        // Must not panic
        ctx.finish(app_status::SUCCESS);
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use crate::test_support::params;

        // Running through the interpreter avoids executing a freshly written file
        fn sh() -> ProcessEngine {
            ProcessEngine::with_interpreter("/bin/sh")
        }

        fn script(dir: &Path, body: &str) -> io::Result<PathBuf> {
            let path = dir.join("script.sh");
            std::fs::write(&path, body)?;
            path.canonicalize()
        }

        fn stdout(recs: &[ResponseRecord]) -> Vec<u8> {
            recs.iter().filter_map(|r| match r {
                ResponseRecord::Stdout(b) => Some(&b[..]),
                _ => None,
            }).flatten().copied().collect()
        }

        #[test]
        fn cgi_response() -> Result<(), Box<dyn std::error::Error>> {
            let dir = tempfile::tempdir()?;
            let path = script(dir.path(), concat!(
                "printf 'Content-Type: text/plain\\r\\nX-Method: %s\\r\\n\\r\\n' \"$REQUEST_METHOD\"\n",
                "cat\n",
                "echo oops >&2\n",
            ))?;

            let p = params(&[(b"REQUEST_METHOD", b"POST")]);
            let (mut ctx, mut rx) = script_context(p, b"echo me");
            sh().execute(&path, &mut ctx)?;
            ctx.finish(app_status::SUCCESS);

            let recs = drain(&mut rx);
            assert_eq!(stdout(&recs), b"Content-Type:text/plain\nX-Method:POST\n\necho me");
            assert!(recs.contains(&ResponseRecord::Stderr(b"oops\n".to_vec())));
            assert_eq!(recs.last(), Some(&crate::ExitStatus::Complete(0).to_record()));
            Ok(())
        }

        #[test]
        fn exit_codes() -> Result<(), Box<dyn std::error::Error>> {
            let dir = tempfile::tempdir()?;
            let path = script(dir.path(), "exit 3\n")?;
            let (mut ctx, _rx) = script_context(Params::default(), b"");
            let err = sh().execute(&path, &mut ctx).expect_err("script exits with 3");
            assert_eq!(err.app_status(), app_status::SCRIPT_FAILED);

            let missing = dir.path().join("missing.sh");
            let err = ProcessEngine::new().execute(&missing, &mut ctx).expect_err("script is missing");
            assert_eq!(err.app_status(), app_status::ENGINE_FAILED);
            Ok(())
        }

        #[test]
        fn no_headers() -> Result<(), Box<dyn std::error::Error>> {
            let dir = tempfile::tempdir()?;
            let path = script(dir.path(), "echo\necho from-sh\n")?;

            let (mut ctx, mut rx) = script_context(Params::default(), b"");
            sh().execute(&path, &mut ctx)?;
            ctx.finish(app_status::SUCCESS);
            assert_eq!(stdout(&drain(&mut rx)), b"\nfrom-sh\n");
            Ok(())
        }
    }
}
