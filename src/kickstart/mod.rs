//! Kickstart handling
//!
//! A kickstart is split into elements (commands, sections and addons),
//! each module gets the elements it claims, and the line numbers in the
//! module reports are mapped back to the user's files.

pub mod element;
pub mod manager;
pub mod parser;
pub mod report;
pub mod service;
pub mod writer;

pub use element::{
    get_kickstart_from_elements, get_references_from_elements, ElementKind, KickstartElement,
    KickstartElements, LineReference, Selection, END_MARKER,
};
pub use manager::KickstartManager;
pub use parser::{KickstartError, SplitKickstartParser};
pub use report::{KickstartMessage, KickstartReport};
pub use service::{kickstart_interface, publish_module, KickstartService};
pub use writer::{KickstartWriter, DEFAULT_WRITE_PRIORITY};
