use whale_core::{ResourceKind, WhaleError};

/// Map a kube error for `kind`/`name` onto the run's error taxonomy.
pub fn classify(err: kube::Error, kind: ResourceKind, name: &str) -> WhaleError {
    match err {
        kube::Error::Api(status) => match status.code {
            404 => WhaleError::NotFound {
                kind,
                name: name.to_string(),
            },
            409 => WhaleError::ResourceConflict {
                kind,
                name: name.to_string(),
            },
            401 | 403 => WhaleError::PermissionDenied(format!(
                "{} '{}': {}",
                kind, name, status.message
            )),
            code => from_status_code(code, &format!("{} '{}': {}", kind, name, status.message)),
        },
        // Anything that never got an API answer: connect, TLS, timeouts.
        other => WhaleError::ApiUnavailable(format!("{} '{}': {}", kind, name, other)),
    }
}

/// 429 and 5xx are worth retrying, any other status is final.
pub fn from_status_code(code: u16, detail: &str) -> WhaleError {
    match code {
        429 | 500..=599 => WhaleError::ApiUnavailable(format!("HTTP {}: {}", code, detail)),
        _ => WhaleError::Api(format!("HTTP {}: {}", code, detail)),
    }
}
