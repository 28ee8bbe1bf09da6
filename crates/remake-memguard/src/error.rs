//! Errors arising from memory admission and accounting
//!
//! Nothing in this crate propagates an error to the recipe runner: the
//! types here are for logging and for degrading to a disabled guard.

use crate::internal_prelude::*;

use std::io;

/// An error occurring while setting up the memory-admission core
///
/// The caller treats any of these as "run without memory awareness";
/// see [`MemGuard::new`](crate::MemGuard::new).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StartupError {
    /// Could not create or attach the shared accounting region
    #[error("couldn't set up shared accounting region")]
    Region(#[from] RegionError),

    /// Memory awareness is switched off by configuration
    ///
    /// Not a failure as such, but it travels the same path: the guard
    /// comes up disabled.
    #[error("memory awareness disabled by configuration")]
    DisabledByConfig,
}

/// An error from the shared accounting region
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RegionError {
    /// `shm_open` (or the equivalent) failed
    #[error("couldn't open shared memory object {name:?}")]
    Open {
        /// The well-known object name
        name: String,
        /// The OS error
        #[source]
        source: io::Error,
    },

    /// Couldn't size or map the object
    #[error("couldn't map shared memory object {name:?}")]
    Map {
        /// The well-known object name
        name: String,
        /// The OS error
        #[source]
        source: io::Error,
    },

    /// The object exists but its header is not ours
    ///
    /// Another tool's object, or an incompatible layout version.  We
    /// leave it alone and run without the region.
    #[error("shared memory object {name:?} has an incompatible layout")]
    Incompatible {
        /// The well-known object name
        name: String,
    },

    /// This build was compiled without shared-region support
    #[error("shared accounting region unsupported on this platform")]
    Unsupported,
}

/// An error while persisting the profile cache
///
/// Does not escape the crate; used for logging.
#[derive(Debug, Error)]
#[non_exhaustive]
pub(crate) enum FlushError {
    /// Couldn't write the temporary sibling file
    #[error("couldn't write profile cache {path:?}")]
    Write {
        /// The temporary file path
        path: PathBuf,
        /// The OS error
        #[source]
        source: io::Error,
    },

    /// Couldn't rename the temporary file into place
    #[error("couldn't install profile cache {path:?}")]
    Rename {
        /// The final file path
        path: PathBuf,
        /// The OS error
        #[source]
        source: io::Error,
    },
}
