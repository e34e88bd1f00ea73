//! In-memory engine for unit tests.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{Completion, CompletionReceiver, Engine, EngineError, RequestHook};
use crate::http::Method;

#[derive(Default)]
struct MockState {
    bound: Option<u16>,
    fail_bind: bool,
    hooks: HashMap<Method, RequestHook>,
    installs: HashMap<Method, usize>,
}

/// Records installs and lets tests inject requests without a socket.
#[derive(Default)]
pub(crate) struct MockEngine {
    state: Mutex<MockState>,
}

impl MockEngine {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// An engine whose every bind fails with `AddrInUse`.
    pub(crate) fn failing() -> Self {
        let engine = Self::default();
        engine.state().fail_bind = true;
        engine
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn bound_port(&self) -> Option<u16> {
        self.state().bound
    }

    /// How many times a hook was installed for `method` in total.
    pub(crate) fn install_count(&self, method: &Method) -> usize {
        self.state().installs.get(method).copied().unwrap_or(0)
    }

    pub(crate) fn has_hook(&self, method: &Method) -> bool {
        self.state().hooks.contains_key(method)
    }

    /// Simulates an inbound request. Returns `None` when the engine is not
    /// bound or has no hook for `method`.
    pub(crate) fn deliver(&self, method: &Method, body: &str) -> Option<CompletionReceiver> {
        let hook = {
            let state = self.state();
            state.bound?;
            state.hooks.get(method).cloned()?
        };
        let (completion, rx) = Completion::pair();
        hook(body.to_owned(), completion);
        Some(rx)
    }
}

impl Engine for MockEngine {
    fn bind(&self, port: u16) -> Result<String, EngineError> {
        let mut state = self.state();
        if state.fail_bind {
            return Err(EngineError::Bind {
                addr: format!("127.0.0.1:{port}"),
                source: std::io::ErrorKind::AddrInUse.into(),
            });
        }
        if state.bound.is_some() {
            return Err(EngineError::AlreadyBound);
        }
        state.bound = Some(port);
        Ok(format!("http://127.0.0.1:{port}/"))
    }

    fn unbind(&self) {
        self.state().bound = None;
    }

    fn install_handler(&self, method: Method, hook: RequestHook) {
        let mut state = self.state();
        *state.installs.entry(method.clone()).or_default() += 1;
        state.hooks.insert(method, hook);
    }

    fn remove_handlers(&self) {
        self.state().hooks.clear();
    }
}
