use std::fmt;

/// Per-call failure, rendered into the `error` field of a wire response.
///
/// The `Display` output is the exact string a client sees; other calls in the
/// same batch are unaffected by any of these.
#[derive(Debug)]
pub enum CallError {
    /// The `service` half of `service.method` is not registered.
    UnknownService,
    /// The name carries no dot, or the method is not registered on the service.
    InvalidMethod,
    /// The service guard rejected the call's context.
    AccessDenied,
    /// Wire arguments ran out and no dependency provider matched the parameter.
    MissingArguments,
    /// The request context was cancelled before the handler finished.
    Cancelled,
    /// A dependency provider failed while materializing a parameter.
    Provider(ProviderError),
    /// A wire argument could not be decoded into the parameter type.
    Argument(CodecError),
    /// The handler's result value could not be encoded.
    Encode(CodecError),
    /// The handler returned an error; its message travels as-is.
    Method(String),
    /// The handler panicked; the panic payload stays in the server log.
    Panic,
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::UnknownService => write!(f, "Unknown service"),
            CallError::InvalidMethod => write!(f, "Invalid method name"),
            CallError::AccessDenied => write!(f, "Access Denied"),
            CallError::MissingArguments => write!(f, "invalid arguments"),
            CallError::Cancelled => write!(f, "Call cancelled"),
            CallError::Provider(err) => write!(f, "{err}"),
            CallError::Argument(err) => write!(f, "invalid arguments: {err}"),
            CallError::Encode(err) => write!(f, "{err}"),
            CallError::Method(message) => write!(f, "{message}"),
            CallError::Panic => write!(f, "Method call error"),
        }
    }
}

impl std::error::Error for CallError {}

/// Encode or decode failure in either codec.
#[derive(Debug)]
pub enum CodecError {
    Json(serde_json::Error),
    MessagePack(String),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Json(err) => write!(f, "{err}"),
            CodecError::MessagePack(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for CodecError {}

impl From<serde_json::Error> for CodecError {
    fn from(err: serde_json::Error) -> Self {
        CodecError::Json(err)
    }
}

impl From<rmp_serde::encode::Error> for CodecError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        CodecError::MessagePack(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for CodecError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        CodecError::MessagePack(err.to_string())
    }
}

impl From<rmpv::ext::Error> for CodecError {
    fn from(err: rmpv::ext::Error) -> Self {
        CodecError::MessagePack(err.to_string())
    }
}

/// Failure reported by a dependency provider.
///
/// Providers surface whatever message they like; the registry and dispatcher
/// only forward it.
#[derive(Clone, Debug)]
pub struct ProviderError {
    message: String,
}

impl ProviderError {
    pub fn new(message: impl fmt::Display) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ProviderError {}

impl From<String> for ProviderError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for ProviderError {
    fn from(message: &str) -> Self {
        Self {
            message: message.to_owned(),
        }
    }
}

/// Rejected registration during server assembly.
#[derive(Debug)]
pub enum RegisterError {
    /// A data record with this name already exists; data names never overwrite.
    DataCollision { name: String },
    /// A constant's value could not be converted to a catalog value.
    Constant { name: String, message: String },
}

impl fmt::Display for RegisterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterError::DataCollision { name } => {
                write!(f, "data record '{name}' is already registered")
            }
            RegisterError::Constant { name, message } => {
                write!(f, "constant '{name}' cannot be encoded: {message}")
            }
        }
    }
}

impl std::error::Error for RegisterError {}
