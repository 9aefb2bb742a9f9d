//! Installation dispatcher
//!
//! The installation is an ordered list of steps. Indirect steps are screens
//! shown by the presentation layer; direct steps are run by the dispatcher
//! itself. The dispatcher walks the list forward or back, skipping steps
//! that are in its skip list and running direct steps as it passes them.
//!
//! # Step Flow
//!
//! ```text
//! kickstart (direct)
//!     ↓
//! language → keyboard → network → storage → software → timezone → users → summary
//!     ↓
//! install (direct)
//!     ↓
//! writeksconfig (direct)
//!     ↓
//! complete
//! ```

pub mod dispatcher;
pub mod step;

pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use step::{default_steps, InstallContext, Step, StepAction};

use crate::bus::BusError;
use crate::tasks::TaskError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use strum::{Display, EnumString};
use thiserror::Error;

/// Which way the dispatcher moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Forward,
    Back,
    /// Returned by a direct step to keep the current direction.
    Default,
}

impl Direction {
    /// Index offset of one move. `Default` moves forward.
    pub const fn offset(self) -> isize {
        match self {
            Self::Back => -1,
            Self::Forward | Self::Default => 1,
        }
    }
}

/// Skip state of a step. Steps not in the skip list are not skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum SkipState {
    NotSkipped,
    /// Cleared by the next [`Dispatcher::set_step_list`].
    SkippedTransient,
    /// Never cleared.
    SkippedPermanent,
}

#[derive(Error, Debug)]
pub enum DispatchError {
    /// Moving back went past the first step.
    #[error("step index {index} is before the first step {first_step}")]
    OutOfBounds { index: isize, first_step: usize },

    #[error("unknown installation step {0:?}")]
    UnknownStep(String),

    #[error("the kickstart has {0} error(s)")]
    InvalidKickstart(usize),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("failed to write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
