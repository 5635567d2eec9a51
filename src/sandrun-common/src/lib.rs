//! Wire-level data model and error taxonomy shared by every layer of the
//! sandboxed execution service: the dispatcher, the IPC channel, and the
//! worker processes that actually run JavaScript and WebAssembly.
#![deny(missing_docs)]

use std::collections::HashMap;
use std::num::NonZeroU32;

use serde::{Deserialize, Serialize};

/// A mapping of freeform string tags attached to a [`CodeObject`] or an
/// [`InvocationRequest`]. See [`parse_timeout_ms`] for the one tag the core
/// recognizes.
pub type Tags = HashMap<String, String>;

/// The tag key used to override the default per-invocation timeout.
pub const TIMEOUT_MS_TAG: &str = "TimeoutMs";

/// The default per-invocation deadline, in milliseconds, used when a
/// request carries no [`TIMEOUT_MS_TAG`] tag.
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// A monotonically meaningful, strictly positive code version.
///
/// Zero is rejected at construction; this makes "version 0 is invalid" a
/// property of the type rather than something every caller must re-check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version(NonZeroU32);

impl Version {
    /// Construct a `Version`, rejecting zero.
    pub fn new(value: u32) -> Result<Self> {
        NonZeroU32::new(value)
            .map(Version)
            .ok_or(RomaError::InvalidArgument("version must be > 0"))
    }

    /// The underlying integer value.
    pub fn get(self) -> u32 {
        self.0.get()
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An immutable record describing code to load into every worker.
///
/// Invariant: `js` and `wasm` are not both empty. Constructed only through
/// [`CodeObject::new`], which enforces this.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeObject {
    /// Opaque, host-chosen identifier.
    pub id: String,
    /// Monotonically meaningful version; zero is invalid.
    pub version: Version,
    /// UTF-8 JavaScript source. May be empty iff `wasm` is not.
    pub js: String,
    /// Raw WebAssembly module bytes. May be empty iff `js` is not.
    pub wasm: Vec<u8>,
    /// Freeform tags; no keys are reserved at this layer.
    pub tags: Tags,
}

impl CodeObject {
    /// Construct a `CodeObject`, validating the non-empty-code invariant.
    ///
    /// # Errors
    ///
    /// Returns [`RomaError::InvalidArgument`] if both `js` and `wasm` are
    /// empty.
    pub fn new(
        id: impl Into<String>,
        version: Version,
        js: impl Into<String>,
        wasm: impl Into<Vec<u8>>,
        tags: Tags,
    ) -> Result<Self> {
        let js = js.into();
        let wasm = wasm.into();
        if js.is_empty() && wasm.is_empty() {
            return Err(RomaError::InvalidArgument(
                "code object must carry js or wasm",
            ));
        }
        Ok(Self {
            id: id.into(),
            version,
            js,
            wasm,
            tags,
        })
    }

    /// A copy of this code object with `tags` retained but no other change;
    /// used by the per-channel code cache, which never retains request
    /// inputs (there are none on a `CodeObject` to begin with, but this
    /// makes the "no inputs retained" invariant explicit at the type that
    /// implements it — see `sandrun-ipc::CodeCache`).
    pub fn without_inputs(&self) -> Self {
        self.clone()
    }
}

/// The return type a WASM handler is expected to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WasmReturnType {
    /// The raw `i32` (host observes it as `u32`) return value.
    U32,
    /// The returned `i32` is a linear-memory offset to a string record.
    String,
    /// The returned `i32` is a linear-memory offset to a list-of-string record.
    ListOfString,
    /// Not a recognized WASM return type; only valid for non-WASM requests.
    Unknown,
}

impl WasmReturnType {
    /// Parse the wire representation used in request tags/JSON.
    pub fn parse(s: &str) -> Self {
        match s {
            "u32" => Self::U32,
            "string" => Self::String,
            "list_of_string" => Self::ListOfString,
            _ => Self::Unknown,
        }
    }
}

/// A request to invoke a handler exported by previously loaded code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationRequest {
    /// Opaque, host-chosen identifier, echoed back on the [`Response`].
    pub id: String,
    /// The version of the code this invocation must run against.
    pub version: Version,
    /// Name of the exported handler to call. Non-empty.
    pub handler_name: String,
    /// Ordered JSON-encoded arguments.
    pub input: Vec<String>,
    /// Expected WASM return shape; ignored for pure-JS handlers.
    pub wasm_return_type: WasmReturnType,
    /// Freeform tags; see [`TIMEOUT_MS_TAG`].
    pub tags: Tags,
}

impl InvocationRequest {
    /// Construct an `InvocationRequest`, validating that `handler_name` is
    /// non-empty.
    pub fn new(
        id: impl Into<String>,
        version: Version,
        handler_name: impl Into<String>,
        input: Vec<String>,
        wasm_return_type: WasmReturnType,
        tags: Tags,
    ) -> Result<Self> {
        let handler_name = handler_name.into();
        if handler_name.is_empty() {
            return Err(RomaError::InvalidArgument("handler_name must not be empty"));
        }
        Ok(Self {
            id: id.into(),
            version,
            handler_name,
            input,
            wasm_return_type,
            tags,
        })
    }
}

/// The body of a request carried by a work item: either a code load or an
/// invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RequestBody {
    /// Broadcast a new code object to be compiled/cached.
    Load(CodeObject),
    /// Invoke a handler against previously loaded code.
    Execute(InvocationRequest),
}

impl RequestBody {
    /// The id of the underlying load or invocation.
    pub fn id(&self) -> &str {
        match self {
            Self::Load(c) => &c.id,
            Self::Execute(r) => &r.id,
        }
    }
}

/// The outcome of running a request: the echoed id and either the
/// JSON-encoded result or a failure kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Echoes the id of the request this responds to.
    pub id: String,
    /// `Ok(result_json)` on success, `Err(kind)` otherwise.
    pub result: std::result::Result<String, RomaError>,
}

impl Response {
    /// Build a successful response.
    pub fn success(id: impl Into<String>, result_json: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            result: Ok(result_json.into()),
        }
    }

    /// Build a failing response.
    pub fn failure(id: impl Into<String>, error: RomaError) -> Self {
        Self {
            id: id.into(),
            result: Err(error),
        }
    }

    /// `true` iff this response represents a successful invocation.
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// The taxonomy of failures the core can report, per the error handling
/// design. Every variant here is a distinct *kind*, not a formatted
/// message-only string, so callers can `match` on outcome.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
pub enum RomaError {
    /// A host-facing API boundary validation failed before any channel was touched.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// The dispatcher could not reserve a slot on the target channel.
    #[error("channel is full")]
    ChannelFull,
    /// The work container was stopped while waiting for a request or response.
    #[error("pop failed: container stopped")]
    PopFailed,
    /// The engine could not compile the loaded code.
    #[error("compile failure: {0}")]
    CompileFailure(String),
    /// The engine compiled the code but running it at load time failed.
    #[error("script run failure: {0}")]
    ScriptRunFailure(String),
    /// The requested handler name does not exist on the loaded code.
    #[error("bad handler name")]
    BadHandlerName,
    /// The requested handler exists but is not callable.
    #[error("handler is not a callable function")]
    HandlerInvalidFunction,
    /// An input argument could not be parsed/marshalled.
    #[error("bad input")]
    BadInput,
    /// The handler threw/trapped during execution.
    #[error("execution failure: {0}")]
    ExecutionFailure(String),
    /// The watchdog terminated the engine before the handler returned.
    #[error("execution timed out")]
    ExecutionTimeout,
    /// The handler's return value could not be serialized back to JSON.
    #[error("result parse failure")]
    ResultParseFailure,
    /// A WASM invocation requested a return type the core does not support.
    #[error("unknown wasm return type")]
    UnknownWasmReturnType,
    /// The request's version does not match the version currently loaded.
    #[error("unmatched version")]
    UnmatchedVersion,
    /// No code has been successfully loaded into this worker yet.
    #[error("isolate not ready")]
    IsolateNotReady,
    /// The `TimeoutMs` tag was present but not a valid positive integer.
    #[error("failed to parse timeout tag")]
    FailedToParseTimeoutTag,
    /// This request was re-delivered to a restarted worker after a crash.
    #[error("worked on before")]
    WorkedOnBefore,
    /// Catch-all for host-boundary/system errors (I/O, OS primitives, etc).
    #[error("{0}")]
    Other(String),
}

/// The crate-wide `Result` alias.
pub type Result<T> = std::result::Result<T, RomaError>;

/// Parse the [`TIMEOUT_MS_TAG`] out of a tag map, falling back to
/// [`DEFAULT_TIMEOUT_MS`] when the tag is absent.
///
/// # Errors
///
/// Returns [`RomaError::FailedToParseTimeoutTag`] if the tag is present but
/// is not a valid positive integer.
pub fn parse_timeout_ms(tags: &Tags) -> Result<u64> {
    match tags.get(TIMEOUT_MS_TAG) {
        None => Ok(DEFAULT_TIMEOUT_MS),
        Some(s) => s
            .parse::<u64>()
            .ok()
            .filter(|ms| *ms > 0)
            .ok_or(RomaError::FailedToParseTimeoutTag),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_rejects_zero() {
        assert!(Version::new(0).is_err());
        assert!(Version::new(1).is_ok());
    }

    #[test]
    fn code_object_requires_js_or_wasm() {
        let v = Version::new(1).unwrap();
        assert!(CodeObject::new("id", v, "", Vec::new(), Tags::new()).is_err());
        assert!(CodeObject::new("id", v, "function f(){}", Vec::new(), Tags::new()).is_ok());
        assert!(CodeObject::new("id", v, "", vec![0u8, 1, 2], Tags::new()).is_ok());
    }

    #[test]
    fn invocation_request_requires_handler_name() {
        let v = Version::new(1).unwrap();
        assert!(InvocationRequest::new("id", v, "", vec![], WasmReturnType::Unknown, Tags::new())
            .is_err());
        assert!(
            InvocationRequest::new("id", v, "h", vec![], WasmReturnType::Unknown, Tags::new())
                .is_ok()
        );
    }

    #[test]
    fn timeout_tag_defaults_when_absent() {
        assert_eq!(parse_timeout_ms(&Tags::new()).unwrap(), DEFAULT_TIMEOUT_MS);
    }

    #[test]
    fn timeout_tag_parses_positive_integer() {
        let mut tags = Tags::new();
        tags.insert(TIMEOUT_MS_TAG.to_string(), "250".to_string());
        assert_eq!(parse_timeout_ms(&tags).unwrap(), 250);
    }

    #[test]
    fn timeout_tag_rejects_garbage() {
        let mut tags = Tags::new();
        tags.insert(TIMEOUT_MS_TAG.to_string(), "not-a-number".to_string());
        assert!(matches!(
            parse_timeout_ms(&tags),
            Err(RomaError::FailedToParseTimeoutTag)
        ));

        let mut tags = Tags::new();
        tags.insert(TIMEOUT_MS_TAG.to_string(), "0".to_string());
        assert!(matches!(
            parse_timeout_ms(&tags),
            Err(RomaError::FailedToParseTimeoutTag)
        ));
    }

    #[test]
    fn wasm_return_type_parses_recognized_strings() {
        assert_eq!(WasmReturnType::parse("u32"), WasmReturnType::U32);
        assert_eq!(WasmReturnType::parse("string"), WasmReturnType::String);
        assert_eq!(
            WasmReturnType::parse("list_of_string"),
            WasmReturnType::ListOfString
        );
        assert_eq!(WasmReturnType::parse("garbage"), WasmReturnType::Unknown);
    }
}
