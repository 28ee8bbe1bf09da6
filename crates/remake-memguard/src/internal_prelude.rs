//! Internal prelude
//!
//! This file contains most of the imports we wish to use, throughout this
//! crate.
//!
//! Every module does `use crate::internal_prelude::*;`
//!
//! Exceptions:
//!
//!  * Names that are private to a module and its submodules
//!    are imported to the sub-modules via `use super::*`.
//!
//!  * OS-interface names (`libc`, `memmap2`) stay qualified at their few
//!    call sites, where the qualification is the documentation.

#![allow(unused_imports)]

pub(crate) use std::{
    collections::HashMap,
    fmt::{self, Debug},
    mem,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    },
    time::{Duration, Instant, SystemTime},
};

pub(crate) use {
    serde::{Deserialize, Serialize},
    thiserror::Error,
    tracing::{debug, error, info, trace, warn},
};

pub(crate) use remake_probe::{HostMemory, Mib, Pid, SystemProbe};

pub(crate) use crate::{
    classify::ClassifyRules,
    config::{Config, ConfigBuildError, Role},
    error::{RegionError, StartupError},
    profile::{ProfileId, ProfileStore},
    shared::{AccountingRegion, MAX_RESERVATIONS, RegionSlot, Totals},
};
