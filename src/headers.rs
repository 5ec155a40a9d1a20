use http::{header, HeaderMap};

use crate::config::ProxyConfig;

/// Pin `Host` to the configured origin, then strip suppressed request
/// headers. Suppression runs last, so listing `host` removes even the
/// pinned value.
///
/// Header names in a [`HeaderMap`] are already lower-case, and the
/// suppression sets were lower-cased at build time, so the comparison is
/// case-insensitive by construction.
pub(crate) fn filter_request_headers(headers: &mut HeaderMap, config: &ProxyConfig) {
    if let Some(authority) = &config.host_authority {
        headers.insert(header::HOST, authority.clone());
    }
    remove_suppressed(headers, &config.suppress_request_headers);
}

/// Strip `transfer-encoding` and suppressed names from the upstream
/// response, then apply the configured overrides. Overrides always win, even
/// over upstream values.
///
/// `transfer-encoding` is dropped unconditionally: it describes the framing
/// of the upstream hop and must not be replayed across the proxy boundary.
pub(crate) fn filter_response_headers(headers: &mut HeaderMap, config: &ProxyConfig) {
    headers.remove(header::TRANSFER_ENCODING);
    remove_suppressed(headers, &config.suppress_response_headers);
    for (name, value) in &config.override_response_headers {
        headers.insert(name.clone(), value.clone());
    }
}

fn remove_suppressed(headers: &mut HeaderMap, suppressed: &std::collections::HashSet<String>) {
    if suppressed.is_empty() {
        return;
    }
    let doomed: Vec<_> = headers
        .keys()
        .filter(|name| suppressed.contains(name.as_str()))
        .cloned()
        .collect();
    for name in doomed {
        headers.remove(&name);
    }
}
