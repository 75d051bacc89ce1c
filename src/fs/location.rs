//! Container location parsing.
//!
//! A location has the form `https://<host>/<container>[/<prefix>]`. Inline
//! credentials (SAS query strings or `user:pass@`) are refused: access always
//! goes through the configured managed identity.

use std::fmt;

use url::Url;

use crate::error::{KeepError, Result};

/// Where a blob container lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerLocation {
    /// Service endpoint, e.g. `https://account.blob.core.windows.net`
    pub endpoint: String,
    /// Container name (first path segment)
    pub container: String,
    /// Key prefix inside the container, without leading or trailing `/`
    pub root: Option<String>,
}

impl ContainerLocation {
    /// Full key of `key` once the root prefix is applied
    pub fn qualify(&self, key: &str) -> String {
        let key = key.trim_start_matches('/');
        match &self.root {
            Some(root) => format!("{}/{}", root, key),
            None => key.to_string(),
        }
    }
}

impl fmt::Display for ContainerLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.endpoint, self.container)?;
        if let Some(root) = &self.root {
            write!(f, "/{}", root)?;
        }
        Ok(())
    }
}

/// Parse and validate a container location string.
pub fn resolve_location(location: &str) -> Result<ContainerLocation> {
    let location = location.trim();

    // Checked on the raw string so a token is refused whatever the host/path look like
    if let Some((_, query)) = location.split_once('?') {
        let query = query.split('#').next().unwrap_or_default();
        if !query.is_empty() {
            return Err(KeepError::security_policy(
                "query strings (SAS tokens) are not accepted",
            ));
        }
    }

    let url = Url::parse(location).map_err(|e| KeepError::format(location, e.to_string()))?;

    if !url.username().is_empty() || url.password().is_some() {
        return Err(KeepError::security_policy(
            "user credentials embedded in the URL are not accepted",
        ));
    }

    if url.scheme() != "https" {
        return Err(KeepError::format(
            location,
            format!("scheme must be https, not '{}'", url.scheme()),
        ));
    }
    if url.fragment().is_some() {
        return Err(KeepError::format(location, "fragments are not allowed"));
    }

    let host = match url.host_str() {
        Some(host) if !host.is_empty() => host,
        _ => return Err(KeepError::format(location, "missing host")),
    };
    let endpoint = match url.port() {
        Some(port) => format!("https://{}:{}", host, port),
        None => format!("https://{}", host),
    };

    let path = url.path().trim_matches('/');
    let (container, root) = match path.split_once('/') {
        Some((container, rest)) => {
            let rest = rest.trim_matches('/');
            (container, (!rest.is_empty()).then(|| rest.to_string()))
        }
        None => (path, None),
    };
    if container.is_empty() {
        return Err(KeepError::format(location, "missing container name"));
    }

    tracing::debug!(%endpoint, container, ?root, "resolved container location");

    Ok(ContainerLocation {
        endpoint,
        container: container.to_string(),
        root,
    })
}
