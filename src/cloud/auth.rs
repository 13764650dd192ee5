use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthState {
    SignedOut,
    SigningIn,
    SignedIn,
}

/// Sign-in state published by the host's auth layer.
#[derive(Clone)]
pub struct AuthSignal {
    tx: Arc<watch::Sender<AuthState>>,
}

impl AuthSignal {
    pub fn new(initial: AuthState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn set(&self, state: AuthState) {
        let previous = self.tx.send_replace(state);
        if previous != state {
            log::info!("[auth] {:?} → {:?}", previous, state);
        }
    }

    pub fn current(&self) -> AuthState {
        *self.tx.borrow()
    }

    pub fn is_signed_in(&self) -> bool {
        self.current() == AuthState::SignedIn
    }

    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.tx.subscribe()
    }
}

/// Supplies the bearer credential for uploads.
pub trait TokenProvider: Send + Sync {
    fn token(&self) -> Option<String>;
}

/// A fixed token, e.g. from the command line
pub struct StaticToken(pub String);

impl TokenProvider for StaticToken {
    fn token(&self) -> Option<String> {
        if self.0.is_empty() {
            None
        } else {
            Some(self.0.clone())
        }
    }
}
