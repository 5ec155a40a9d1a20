use crate::config::{PathMap, ProxyConfig};

/// Decide the upstream target for an inbound path.
///
/// Priority order: a fixed `url` wins and ignores the inbound path entirely
/// (absolute URLs are used verbatim, relative ones joined onto `host`);
/// otherwise the path runs through `map` and is joined onto `host`. `None`
/// means the request is not ours and the next handler should see it.
///
/// Any query string injected by the configuration is stripped here; the
/// forwarder re-appends the query of the *inbound* request instead.
pub(crate) fn resolve(path: &str, config: &ProxyConfig) -> Option<String> {
    if let Some(target) = &config.url {
        let resolved = if target.starts_with("http://") || target.starts_with("https://") {
            target.clone()
        } else {
            config.host.as_ref()?.join(target).ok()?.to_string()
        };
        return Some(strip_query(&resolved).to_string());
    }

    let path = match &config.map {
        Some(PathMap::Table(table)) => match table.get(path) {
            Some(mapped) => strip_query(mapped).to_string(),
            None => path.to_string(),
        },
        Some(PathMap::Func(rewrite)) => rewrite(path),
        None => path.to_string(),
    };

    let joined = config.host.as_ref()?.join(&path).ok()?;
    Some(strip_query(joined.as_str()).to_string())
}

fn strip_query(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}
