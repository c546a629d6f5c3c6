//! Shared state for the docstore server

use std::{fmt, sync::Arc, time::SystemTime};

use subtle::ConstantTimeEq;

use crate::{metrics::Metrics, store::Store};

/// The shared app state.
#[derive(Debug, Clone)]
pub struct AppState {
    /// The document store
    pub store: Arc<dyn Store>,
    /// Secret that write requests must carry
    pub secret: Secret,
    /// Metrics for the document API
    pub metrics: Arc<Metrics>,
    /// When the server was started
    pub started_at: SystemTime,
}

/// The shared secret guarding writes.
#[derive(Clone)]
pub struct Secret(Arc<str>);

impl Secret {
    /// Wraps a secret.
    pub fn new(secret: impl Into<Arc<str>>) -> Self {
        Self(secret.into())
    }

    /// Whether `candidate` equals the secret.
    ///
    /// The comparison time does not depend on where the first difference is.
    pub fn matches(&self, candidate: &str) -> bool {
        let expected = self.0.as_bytes();
        let candidate = candidate.as_bytes();
        if expected.len() != candidate.len() {
            return false;
        }
        candidate.ct_eq(expected).into()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_matching() {
        let secret = Secret::new("hunter2");
        assert!(secret.matches("hunter2"));
        assert!(!secret.matches("hunter3"));
        assert!(!secret.matches("hunter"));
        assert!(!secret.matches(""));
        assert!(!secret.matches("hunter2 "));
        assert!(!secret.matches("Hunter2"));
        assert_eq!(format!("{secret:?}"), "Secret(..)");
    }
}
