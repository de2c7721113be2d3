// TODO(docs): #![deny(missing_docs)]
#![deny(unsafe_code, single_use_lifetimes, unused_lifetimes)]
#![warn(keyword_idents, let_underscore_drop, unreachable_pub, unused_import_braces)]

#![deny(clippy::suspicious, clippy::cargo)]
#![deny(clippy::exit, clippy::semicolon_inside_block, clippy::unwrap_used)]
#![warn(clippy::pedantic, clippy::multiple_crate_versions)]
#![allow(clippy::enum_glob_use, clippy::items_after_statements, clippy::module_name_repetitions)]

mod macros;

// Based on the FastCGI specification, especially Section 8
// See: https://fastcgi-archives.github.io/FastCGI_Specification.html
pub mod protocol;

/// A process-wide cache shared by all scripts.
pub mod cache;
/// Helpers for CGI/1.1 responses.
pub mod cgi;
pub mod config;
/// The interface between requests and the code that runs scripts.
pub mod engine;
pub mod request;
mod management;
pub mod connection;
pub mod server;

#[cfg(test)]
mod test_support;

pub use config::Config;
pub use engine::{ProcessEngine, ScriptContext, ScriptEngine, ScriptError};
pub use server::Server;


/// The `app_status` values reported in `EndRequest` records.
pub mod app_status {
    /// The script ran to completion.
    pub const SUCCESS: u32 = 0;
    /// The script itself reported a failure.
    pub const SCRIPT_FAILED: u32 = 1;
    /// The script could not be run, or the engine failed while running it.
    pub const ENGINE_FAILED: u32 = 2;
    /// No script file could be resolved from the request parameters.
    pub const SCRIPT_NOT_FOUND: u32 = 3;
    /// The client aborted the request before the script was started.
    pub const ABORTED: u32 = 4;
}


/// The outcome of a FastCGI request, as reported in its `EndRequest` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitStatus {
    /// The request was processed. The value is its [`app_status`].
    Complete(u32),
    /// The request was rejected because too many requests are active.
    Overloaded,
    /// The request was rejected because its role is unknown.
    UnknownRole,
}

impl ExitStatus {
    /// Returns the `EndRequest` body reporting this status.
    #[must_use]
    pub fn to_end_request(self) -> protocol::body::EndRequest {
        use protocol::ProtocolStatus;
        let (app_status, protocol_status) = match self {
            Self::Complete(s) => (s, ProtocolStatus::RequestComplete),
            Self::Overloaded => (0, ProtocolStatus::Overloaded),
            Self::UnknownRole => (0, ProtocolStatus::UnknownRole),
        };
        protocol::body::EndRequest { app_status, protocol_status }
    }

    /// Returns the `EndRequest` record reporting this status.
    #[inline]
    #[must_use]
    pub fn to_record(self) -> protocol::ResponseRecord {
        protocol::ResponseRecord::EndRequest(self.to_end_request())
    }
}

impl From<u32> for ExitStatus {
    #[inline]
    fn from(v: u32) -> Self {
        Self::Complete(v)
    }
}
