use thiserror::Error;

/// Errors produced while building a [`ProxyConfig`](crate::ProxyConfig).
///
/// These are all construction-time failures: once a configuration builds,
/// request handling itself is infallible and upstream failures surface as
/// error-class HTTP responses instead.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// None of `host`, `map`, or `url` was supplied, so there is no way to
    /// decide an upstream target.
    #[error("proxy config needs at least one of host, map, or url")]
    MissingTarget,

    /// The configured `host` could not be parsed as a URL.
    #[error("invalid host '{value}': {source}")]
    InvalidHost {
        value: String,
        #[source]
        source: url::ParseError,
    },

    /// A header name or value in the configuration is not valid HTTP.
    #[error("invalid header in configuration: {0}")]
    InvalidHeader(String),

    /// The configured response encoding label names no known code page.
    #[error("unknown encoding label '{0}'")]
    UnknownEncoding(String),
}
