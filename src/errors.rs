//! Error-handling utilities.

use std::path::PathBuf;

use anyhow::Error;
use thiserror::Error;

/// Problems with our setup which prevent us from geocoding anything at all.
///
/// These are always fatal, and we report them before we touch the output file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The input file does not exist.
    #[error("input file not found: {}", .0.display())]
    InputNotFound(PathBuf),

    /// The selected geocoder needs an API key, and we weren't given one.
    #[error("the {geocoder} geocoder requires an API key (pass --api-key or set {env_var})")]
    MissingApiKey {
        geocoder: &'static str,
        env_var: &'static str,
    },

    /// We could not parse a geocoder endpoint URL.
    #[error("invalid geocoder endpoint {url:?}")]
    InvalidEndpoint {
        url: String,
        #[source]
        source: url::ParseError,
    },
}

/// Display an error, plus all the underlying "causes" (ie, wrapped errors), plus a
/// backtrace.
pub(crate) fn display_causes_and_backtrace(err: &Error) {
    eprintln!("Error: {}", err);
    for cause in err.chain().skip(1) {
        eprintln!("  caused by: {}", cause);
    }
    eprintln!("{}", err.backtrace());
}
