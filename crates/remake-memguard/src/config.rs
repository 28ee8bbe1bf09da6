//! Configuration for the memory-admission core

use crate::internal_prelude::*;

/// Default recognized source-file suffixes
const DEFAULT_SUFFIXES: &[&str] = &[".cpp", ".cc", ".c"];

/// Default divisor for the final-exit peak decay
///
/// A finished compilation whose observed peak came in below the stored
/// peak pulls the stored value down by one `decay_divisor`-th of the gap.
/// 3 is a smoothing heuristic with no derivation; it is configurable for
/// exactly that reason.
const DEFAULT_DECAY_DIVISOR: u32 = 3;

/// Default on-disk cache file name
///
/// Kept byte-for-byte compatible with the make-family cache format, so a
/// tree previously built by a patched make warms us up and vice versa.
const DEFAULT_CACHE_FILE: &str = ".make_memory_cache";

/// Default shared-memory object name
const DEFAULT_SHM_NAME: &str = "/remake_memory_shared";

/// Highest meaningful verbosity level
pub(crate) const MAX_VERBOSITY: u8 = 4;

/// Which role this process plays in a recursive build
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum Role {
    /// The build whose ancestor is not itself a build process
    ///
    /// Owns the profile store, the shared region's lifetime, and the
    /// monitor thread.
    #[default]
    TopLevel,
    /// A recursive sub-build
    ///
    /// Attaches to the shared region lazily and owns nothing.
    SubBuild,
}

/// Configuration for the memory-admission core
///
/// Build one with [`Config::builder`], or [`ConfigBuilder::from_env`] to
/// honor the environment toggles.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Config {
    /// Master toggle; a disabled config produces a disabled guard
    pub(crate) enabled: bool,

    /// Whether the status line may be drawn at all
    pub(crate) display: bool,

    /// Diagnostic verbosity, 0 (silent) ..= 4 (maximum)
    pub(crate) verbosity: u8,

    /// Divisor for the final-exit peak decay
    ///
    /// Guaranteed nonzero.
    pub(crate) decay_divisor: u32,

    /// Recognized source-file suffixes, each beginning with a dot
    pub(crate) source_suffixes: Vec<Box<str>>,

    /// Profile cache file, relative to the top-level build's cwd
    pub(crate) cache_file: PathBuf,

    /// Well-known shared-memory object name, beginning with `/`
    pub(crate) shm_name: String,

    /// Top-level build or recursive sub-build
    pub(crate) role: Role,
}

/// Builder for [`Config`]
///
/// Unset fields take their defaults at [`build`](ConfigBuilder::build)
/// time.  Deserializable, so an embedding tool can read it straight from
/// its own configuration file.
#[derive(Debug, Clone, Eq, PartialEq, Default, Serialize, Deserialize)]
pub struct ConfigBuilder {
    /// See [`Config::enabled`](Config)
    enabled: Option<bool>,
    /// See [`Config::display`](Config)
    display: Option<bool>,
    /// See [`Config::verbosity`](Config)
    verbosity: Option<u8>,
    /// See [`Config::decay_divisor`](Config)
    decay_divisor: Option<u32>,
    /// See [`Config::source_suffixes`](Config)
    source_suffixes: Option<Vec<String>>,
    /// See [`Config::cache_file`](Config)
    cache_file: Option<PathBuf>,
    /// See [`Config::shm_name`](Config)
    shm_name: Option<String>,
    /// See [`Role`]
    role: Option<Role>,
}

/// An error constructing a [`Config`]
#[derive(Debug, Clone, Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum ConfigBuildError {
    /// A field had an invalid value
    #[error("field {field} is invalid: {problem}")]
    Invalid {
        /// The offending field
        field: String,
        /// What was wrong with it
        problem: String,
    },
}

impl Config {
    /// Start building a [`Config`]
    ///
    /// Returns a fresh default [`ConfigBuilder`].
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Would a diagnostic at verbosity level `need` be wanted?
    pub(crate) fn chatter(&self, need: u8) -> bool {
        self.verbosity >= need
    }
}

impl ConfigBuilder {
    /// Master on/off toggle.  Default: on.
    pub fn enabled(&mut self, value: bool) -> &mut Self {
        self.enabled = Some(value);
        self
    }

    /// Whether the status line may be drawn.  Default: on.
    pub fn display(&mut self, value: bool) -> &mut Self {
        self.display = Some(value);
        self
    }

    /// Diagnostic verbosity, 0 (silent) ..= 4 (maximum).  Default: 0.
    pub fn verbosity(&mut self, value: u8) -> &mut Self {
        self.verbosity = Some(value);
        self
    }

    /// Final-exit decay divisor.  Default: 3.
    pub fn decay_divisor(&mut self, value: u32) -> &mut Self {
        self.decay_divisor = Some(value);
        self
    }

    /// Recognized source suffixes.  Default: `.cpp`, `.cc`, `.c`.
    pub fn source_suffixes<I, S>(&mut self, value: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.source_suffixes = Some(value.into_iter().map(Into::into).collect());
        self
    }

    /// Profile cache file name.  Default: `.make_memory_cache`.
    pub fn cache_file(&mut self, value: impl Into<PathBuf>) -> &mut Self {
        self.cache_file = Some(value.into());
        self
    }

    /// Shared-memory object name.  Default: `/remake_memory_shared`.
    pub fn shm_name(&mut self, value: impl Into<String>) -> &mut Self {
        self.shm_name = Some(value.into());
        self
    }

    /// Top-level build or sub-build.  Default: top-level.
    pub fn role(&mut self, value: Role) -> &mut Self {
        self.role = Some(value);
        self
    }

    /// Apply the environment surface on top of whatever is already set.
    ///
    /// Recognized variables:
    ///
    ///  * `REMAKE_MEMORY` -- master toggle; `0`, `no`, and `false` are
    ///    falsy, anything else (including unset) leaves the toggle on.
    ///  * `REMAKE_MEMORY_DISPLAY` -- same falsy values, for the display.
    ///  * `REMAKE_MEMORY_VERBOSITY` -- an integer; unparseable values are
    ///    ignored.
    ///  * `REMAKE_LEVEL` -- recursion depth; nonzero means sub-build.
    pub fn from_env(&mut self) -> &mut Self {
        /// Is this variable set to one of the recognized falsy values?
        fn falsy(var: &str) -> bool {
            matches!(
                std::env::var(var).as_deref(),
                Ok("0") | Ok("no") | Ok("false")
            )
        }

        if falsy("REMAKE_MEMORY") {
            self.enabled = Some(false);
        }
        if falsy("REMAKE_MEMORY_DISPLAY") {
            self.display = Some(false);
        }
        if let Ok(v) = std::env::var("REMAKE_MEMORY_VERBOSITY")
            && let Ok(v) = v.parse()
        {
            self.verbosity = Some(v);
        }
        if let Ok(level) = std::env::var("REMAKE_LEVEL")
            && level.parse::<u32>().map(|l| l > 0).unwrap_or(false)
        {
            self.role = Some(Role::SubBuild);
        }
        self
    }

    /// Build a [`Config`] from this builder
    ///
    /// Returns an error if any field value is invalid.
    pub fn build(&self) -> Result<Config, ConfigBuildError> {
        /// Shorthand for an [`Invalid`](ConfigBuildError::Invalid) error
        fn invalid(field: &str, problem: impl ToString) -> ConfigBuildError {
            ConfigBuildError::Invalid {
                field: field.into(),
                problem: problem.to_string(),
            }
        }

        let decay_divisor = self.decay_divisor.unwrap_or(DEFAULT_DECAY_DIVISOR);
        if decay_divisor == 0 {
            return Err(invalid("decay_divisor", "must be nonzero"));
        }

        let verbosity = self.verbosity.unwrap_or(0);
        if verbosity > MAX_VERBOSITY {
            return Err(invalid(
                "verbosity",
                format!("must be at most {MAX_VERBOSITY}"),
            ));
        }

        let source_suffixes: Vec<Box<str>> = self
            .source_suffixes
            .clone()
            .unwrap_or_else(|| DEFAULT_SUFFIXES.iter().map(|s| (*s).to_owned()).collect())
            .into_iter()
            .map(Box::from)
            .collect();
        if source_suffixes.is_empty() {
            return Err(invalid("source_suffixes", "must not be empty"));
        }
        if let Some(bad) = source_suffixes.iter().find(|s| !s.starts_with('.')) {
            return Err(invalid(
                "source_suffixes",
                format!("suffix {bad:?} does not begin with a dot"),
            ));
        }

        let shm_name = self
            .shm_name
            .clone()
            .unwrap_or_else(|| DEFAULT_SHM_NAME.to_owned());
        if !shm_name.starts_with('/') || shm_name.len() < 2 || shm_name[1..].contains('/') {
            return Err(invalid(
                "shm_name",
                "must be `/` followed by a single path-free component",
            ));
        }

        Ok(Config {
            enabled: self.enabled.unwrap_or(true),
            display: self.display.unwrap_or(true),
            verbosity,
            decay_divisor,
            source_suffixes,
            cache_file: self
                .cache_file
                .clone()
                .unwrap_or_else(|| DEFAULT_CACHE_FILE.into()),
            shm_name,
            role: self.role.unwrap_or_default(),
        })
    }
}
