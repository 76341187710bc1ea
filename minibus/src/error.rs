//! Crate-wide error type and the process-wide D-Bus error-name table.

use std::collections::HashMap;
use std::io;
use std::sync::{OnceLock, RwLock};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("bad signature: {0}")]
    Signature(String),

    #[error("type mismatch: expected {expected}, got {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("value {value} is too large for type '{token}'")]
    Overflow { token: char, value: i128 },

    #[error("value {value} is too small for type '{token}'")]
    Underflow { token: char, value: i128 },

    #[error("invalid state: {0}")]
    State(&'static str),

    #[error("message data ended unexpectedly at byte {0}")]
    Truncated(usize),

    #[error("malformed message frame: {0}")]
    Frame(&'static str),

    #[error("invalid object path: {0}")]
    InvalidPath(String),

    #[error("out of memory building table")]
    Allocation,

    #[error("transport failure: {0}")]
    Transport(io::Error),

    #[error("remote error {name}: {message}")]
    Remote {
        kind: RemoteErrorKind,
        name: String,
        message: String,
    },

    #[error("connection closed")]
    Disconnected,
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset => Error::Disconnected,
            _ => Error::Transport(e),
        }
    }
}

/// Structured classification of a bus-reported error, resolved from the
/// remote error name. Unmapped names fall back to [`RemoteErrorKind::Generic`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum RemoteErrorKind {
    Failed,
    NoMemory,
    ServiceUnknown,
    NameHasNoOwner,
    NoReply,
    IoError,
    BadAddress,
    NotSupported,
    LimitsExceeded,
    AccessDenied,
    AuthFailed,
    NoServer,
    Timeout,
    NoNetwork,
    AddressInUse,
    Disconnected,
    InvalidArgs,
    FileNotFound,
    FileExists,
    UnknownMethod,
    UnknownObject,
    UnknownInterface,
    UnknownProperty,
    PropertyReadOnly,
    UnixProcessIdUnknown,
    InvalidSignature,
    InconsistentMessage,
    MatchRuleNotFound,
    MatchRuleInvalid,
    InteractiveAuthorizationRequired,
    Generic,
}

const ERROR_NAME_PREFIX: &str = "org.freedesktop.DBus.Error.";

const BUILTIN_NAMES: &[(&str, RemoteErrorKind)] = &[
    ("Failed", RemoteErrorKind::Failed),
    ("NoMemory", RemoteErrorKind::NoMemory),
    ("ServiceUnknown", RemoteErrorKind::ServiceUnknown),
    ("NameHasNoOwner", RemoteErrorKind::NameHasNoOwner),
    ("NoReply", RemoteErrorKind::NoReply),
    ("IOError", RemoteErrorKind::IoError),
    ("BadAddress", RemoteErrorKind::BadAddress),
    ("NotSupported", RemoteErrorKind::NotSupported),
    ("LimitsExceeded", RemoteErrorKind::LimitsExceeded),
    ("AccessDenied", RemoteErrorKind::AccessDenied),
    ("AuthFailed", RemoteErrorKind::AuthFailed),
    ("NoServer", RemoteErrorKind::NoServer),
    ("Timeout", RemoteErrorKind::Timeout),
    ("NoNetwork", RemoteErrorKind::NoNetwork),
    ("AddressInUse", RemoteErrorKind::AddressInUse),
    ("Disconnected", RemoteErrorKind::Disconnected),
    ("InvalidArgs", RemoteErrorKind::InvalidArgs),
    ("FileNotFound", RemoteErrorKind::FileNotFound),
    ("FileExists", RemoteErrorKind::FileExists),
    ("UnknownMethod", RemoteErrorKind::UnknownMethod),
    ("UnknownObject", RemoteErrorKind::UnknownObject),
    ("UnknownInterface", RemoteErrorKind::UnknownInterface),
    ("UnknownProperty", RemoteErrorKind::UnknownProperty),
    ("PropertyReadOnly", RemoteErrorKind::PropertyReadOnly),
    ("UnixProcessIdUnknown", RemoteErrorKind::UnixProcessIdUnknown),
    ("InvalidSignature", RemoteErrorKind::InvalidSignature),
    ("InconsistentMessage", RemoteErrorKind::InconsistentMessage),
    ("MatchRuleNotFound", RemoteErrorKind::MatchRuleNotFound),
    ("MatchRuleInvalid", RemoteErrorKind::MatchRuleInvalid),
    (
        "InteractiveAuthorizationRequired",
        RemoteErrorKind::InteractiveAuthorizationRequired,
    ),
];

fn registry() -> &'static RwLock<HashMap<String, RemoteErrorKind>> {
    static REGISTRY: OnceLock<RwLock<HashMap<String, RemoteErrorKind>>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Maps an additional error name to a structured kind. Intended to be called
/// once at startup per name; a name that is already mapped (builtin or
/// registered) is rejected.
pub fn register_error_name(name: &str, kind: RemoteErrorKind) -> Result<()> {
    if let Some(suffix) = name.strip_prefix(ERROR_NAME_PREFIX) {
        if BUILTIN_NAMES.iter().any(|(n, _)| *n == suffix) {
            return Err(Error::State("error name is already mapped"));
        }
    }
    let mut map = registry().write().map_err(|_| Error::State("error name table poisoned"))?;
    if map.contains_key(name) {
        return Err(Error::State("error name is already mapped"));
    }
    map.insert(name.to_owned(), kind);
    Ok(())
}

impl RemoteErrorKind {
    pub fn from_name(name: &str) -> RemoteErrorKind {
        if let Some(suffix) = name.strip_prefix(ERROR_NAME_PREFIX) {
            for (n, kind) in BUILTIN_NAMES {
                if *n == suffix {
                    return *kind;
                }
            }
        }
        if let Ok(map) = registry().read() {
            if let Some(kind) = map.get(name) {
                return *kind;
            }
        }
        RemoteErrorKind::Generic
    }

    /// The canonical error name for a builtin kind. `Generic` and registered
    /// kinds have no single canonical name.
    pub fn error_name(self) -> Option<String> {
        for (n, kind) in BUILTIN_NAMES {
            if *kind == self {
                return Some(format!("{}{}", ERROR_NAME_PREFIX, n));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_names_resolve() {
        assert_eq!(
            RemoteErrorKind::from_name("org.freedesktop.DBus.Error.Timeout"),
            RemoteErrorKind::Timeout
        );
        assert_eq!(
            RemoteErrorKind::from_name("org.freedesktop.DBus.Error.UnknownMethod"),
            RemoteErrorKind::UnknownMethod
        );
    }

    #[test]
    fn unmapped_name_is_generic() {
        assert_eq!(
            RemoteErrorKind::from_name("com.example.NoSuchError"),
            RemoteErrorKind::Generic
        );
    }

    #[test]
    fn registered_name_resolves_and_duplicates_are_rejected() {
        register_error_name("com.example.Error.Custom", RemoteErrorKind::Failed).unwrap();
        assert_eq!(
            RemoteErrorKind::from_name("com.example.Error.Custom"),
            RemoteErrorKind::Failed
        );
        assert!(register_error_name("com.example.Error.Custom", RemoteErrorKind::Timeout).is_err());
        assert!(
            register_error_name("org.freedesktop.DBus.Error.Timeout", RemoteErrorKind::Failed)
                .is_err()
        );
    }

    #[test]
    fn connection_reset_becomes_disconnected() {
        let e: Error = io::Error::new(io::ErrorKind::ConnectionReset, "gone").into();
        assert!(matches!(e, Error::Disconnected));
        let e: Error = io::Error::new(io::ErrorKind::PermissionDenied, "nope").into();
        assert!(matches!(e, Error::Transport(_)));
    }

    #[test]
    fn builtin_kind_round_trips_through_name() {
        let name = RemoteErrorKind::PropertyReadOnly.error_name().unwrap();
        assert_eq!(name, "org.freedesktop.DBus.Error.PropertyReadOnly");
        assert_eq!(
            RemoteErrorKind::from_name(&name),
            RemoteErrorKind::PropertyReadOnly
        );
    }
}
