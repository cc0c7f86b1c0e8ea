//! BIB configuration: model, XML loader, registry, dynamic mapping and the
//! hot-add directory watcher.

pub mod bib;
pub mod mapper;
pub mod registry;
pub mod watcher;
pub mod xml;

pub use bib::{
    BibConfiguration, BitBangConfig, DataPattern, Handshake, InputBit, OutputBit, ParityMode,
    Phase, PortConfig, ProtocolCommand, UutConfig, WorkflowControl,
};
pub use mapper::BibMapper;
pub use registry::BibRegistry;
pub use watcher::{ConfigEvent, ConfigWatcher, WatcherSettings, WorkflowTrigger};

use std::path::PathBuf;

/// Errors from loading and watching configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file does not exist.
    #[error("configuration file '{0}' not found")]
    ConfigNotFound(PathBuf),
    /// The configuration is malformed; the path names the offending node.
    #[error("invalid configuration at {xpath}: {reason}")]
    ConfigInvalid {
        /// XPath-style location of the offending element or attribute.
        xpath: String,
        /// What was wrong with it.
        reason: String,
    },
    /// An I/O error while reading a file.
    #[error("error reading configuration")]
    Io(#[from] std::io::Error),
    /// The file is not well-formed XML.
    #[error("malformed XML")]
    Xml(#[from] roxmltree::Error),
    /// A validation pattern failed to compile.
    #[error("invalid pattern")]
    Pattern(#[from] regex::Error),
    /// The filesystem watcher could not be installed.
    #[error("filesystem watch failed")]
    Watch(#[from] notify::Error),
}

impl ConfigError {
    pub(crate) fn invalid(xpath: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::ConfigInvalid {
            xpath: xpath.into(),
            reason: reason.into(),
        }
    }
}
