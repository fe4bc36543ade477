//! Error taxonomy for packaging runs.
//!
//! Library code returns [`Result`]; the command layer converts to `anyhow`.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Corrupt, truncated or otherwise unparseable ELF input.
    #[error("malformed ELF {path}: {reason}")]
    MalformedElf { path: String, reason: String },

    /// Well-formed ELF built for a different class/endianness/machine.
    #[error("unsupported architecture in {path}: found {found}, expected {expected}")]
    UnsupportedArchitecture {
        path: String,
        found: String,
        expected: String,
    },

    #[error("unresolved library '{soname}' (required by {})", .chain.join(" -> "))]
    UnresolvedLibrary { soname: String, chain: Vec<String> },

    #[error(
        "ambiguous soname '{soname}': provided by {} (required by {})",
        .candidates.join(", "),
        .chain.join(" -> ")
    )]
    AmbiguousSoname {
        soname: String,
        candidates: Vec<String>,
        chain: Vec<String>,
    },

    #[error(
        "search path '{original}' in {object} must become '{replacement}' ({needed} bytes) but only {capacity} bytes are available"
    )]
    PatchTooLarge {
        object: String,
        original: String,
        replacement: String,
        needed: usize,
        capacity: usize,
    },

    /// Another dynamic string lives inside a region that would be rewritten.
    #[error("search path at offset {offset:#x} in {object} shares bytes with another dynamic string")]
    SharedString { object: String, offset: u64 },

    /// Bytes on disk no longer match what a patch plan was computed from.
    #[error("patch for {object} at offset {offset:#x} does not match file contents")]
    PatchMismatch { object: String, offset: u64 },

    #[error("incomplete package: '{soname}' needs '{missing}' which has no entry")]
    IncompletePackage { soname: String, missing: String },

    #[error("output path '{path}' claimed by both '{first}' and '{second}'")]
    NameCollision {
        path: String,
        first: String,
        second: String,
    },

    #[error("too many levels of symbolic links resolving {path} inside the image")]
    SymlinkLoop { path: String },

    #[error("I/O error on {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A per-object error annotated with the chain of objects that required it.
    #[error("required by {}", .chain.join(" -> "))]
    Required {
        chain: Vec<String>,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub fn malformed(path: &str, reason: impl Into<String>) -> Self {
        Error::MalformedElf {
            path: path.to_string(),
            reason: reason.into(),
        }
    }

    /// Attach the chain of requesters that led to `self`.
    ///
    /// Resolution errors carry the chain inline and keep the first one they
    /// were given; everything else is wrapped in `Required`.
    pub fn required_by(self, chain: Vec<String>) -> Self {
        match self {
            Error::UnresolvedLibrary { soname, chain: own } => Error::UnresolvedLibrary {
                soname,
                chain: if own.is_empty() { chain } else { own },
            },
            Error::AmbiguousSoname {
                soname,
                candidates,
                chain: own,
            } => Error::AmbiguousSoname {
                soname,
                candidates,
                chain: if own.is_empty() { chain } else { own },
            },
            Error::Required { .. } => self,
            other => Error::Required {
                chain,
                source: Box::new(other),
            },
        }
    }

    /// The error underneath any `Required` wrappers.
    pub fn innermost(&self) -> &Error {
        match self {
            Error::Required { source, .. } => source.innermost(),
            other => other,
        }
    }

    /// Requester chain attached to this error, if any.
    pub fn chain(&self) -> Option<&[String]> {
        match self {
            Error::UnresolvedLibrary { chain, .. }
            | Error::AmbiguousSoname { chain, .. }
            | Error::Required { chain, .. } => Some(chain),
            _ => None,
        }
    }

    /// Whether the resolver may skip the object and keep searching.
    pub fn is_skippable(&self) -> bool {
        matches!(self.innermost(), Error::UnsupportedArchitecture { .. })
    }

    /// True for "file does not exist" I/O errors.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self.innermost(),
            Error::Io { source, .. } if source.kind() == io::ErrorKind::NotFound
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unresolved_names_chain() {
        let err = Error::UnresolvedLibrary {
            soname: "libMissing.so".to_string(),
            chain: vec!["app".to_string(), "libA.so".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("libMissing.so"));
        assert!(msg.contains("app -> libA.so"));
    }

    #[test]
    fn test_required_by_wraps_once() {
        let err = Error::malformed("/system/lib64/libz.so", "bad magic")
            .required_by(vec!["app".to_string()]);
        assert!(matches!(err.innermost(), Error::MalformedElf { .. }));
        assert_eq!(err.chain(), Some(&["app".to_string()][..]));

        let unresolved = Error::UnresolvedLibrary {
            soname: "libx.so".to_string(),
            chain: Vec::new(),
        }
        .required_by(vec!["app".to_string()])
        .required_by(vec!["other".to_string()]);
        match unresolved {
            Error::UnresolvedLibrary { chain, .. } => assert_eq!(chain, vec!["app"]),
            other => panic!("expected UnresolvedLibrary, got {:?}", other),
        }
    }

    #[test]
    fn test_only_arch_mismatch_is_skippable() {
        let arch = Error::UnsupportedArchitecture {
            path: "/system/lib/libc.so".to_string(),
            found: "ELF32 ARM".to_string(),
            expected: "ELF64 AARCH64".to_string(),
        };
        assert!(arch.is_skippable());
        assert!(!Error::malformed("x", "y").is_skippable());
    }
}
