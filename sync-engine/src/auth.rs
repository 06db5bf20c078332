use std::sync::RwLock;

/// Supplies the opaque bearer credential attached to every remote call.
///
/// Returning `None` defers syncing; it never fails a queued mutation.
pub trait AuthProvider: Send + Sync {
    fn token(&self) -> Option<String>;
}

/// A token held in memory and replaced on login or logout.
#[derive(Default)]
pub struct StaticToken {
    token: RwLock<Option<String>>,
}

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: RwLock::new(Some(token.into())) }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn set(&self, token: Option<String>) {
        if let Ok(mut slot) = self.token.write() {
            *slot = token;
        }
    }
}

impl AuthProvider for StaticToken {
    fn token(&self) -> Option<String> {
        self.token.read().ok().and_then(|t| t.clone())
    }
}
