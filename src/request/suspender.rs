// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Controller-to-worker pause handshake.
//!
//! A controller coroutine asks a worker to pause at its next safe point; the
//! worker polls [`DelayedSuspender::suspend_if_requested`] between units of
//! work. The suspension itself blocks on a single request-scoped signal
//! routed through the event dispatcher.
//!
//! ```text
//!              request_suspension   resume_if_suspended   suspend_if_requested
//! None       → Pending              —                     — (no-op)
//! Pending    → (invalid)            None                  Suspended (blocks)
//! Suspended  → (invalid)            None + signal         —
//! ```

use std::sync::Mutex;

use crate::{
    client::error::ConnResult,
    request::dispatcher::FiberCtx,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    None,
    Pending,
    Suspended,
}

/// Shared between exactly one controller and one worker coroutine of the
/// same request.
#[derive(Debug)]
pub struct DelayedSuspender {
    state: Mutex<State>,
    /// Signal code the suspended worker blocks on.
    resume_code: u8,
}

impl DelayedSuspender {
    pub fn new(resume_code: u8) -> Self {
        Self {
            state: Mutex::new(State::None),
            resume_code,
        }
    }

    /// Controller: ask the worker to pause at its next safe point.
    pub fn request_suspension(&self) {
        let mut state = self.state.lock().expect("suspender lock poisoned");
        assert_eq!(
            *state,
            State::None,
            "suspension requested while already {state:?}"
        );
        *state = State::Pending;
    }

    /// Controller: withdraw the request, or wake the worker if it already
    /// paused. Returns whether there was anything to clear.
    pub fn resume_if_suspended(&self, fiber: &FiberCtx) -> bool {
        let mut state = self.state.lock().expect("suspender lock poisoned");
        match *state {
            State::None => false,
            State::Pending => {
                *state = State::None;
                true
            },
            State::Suspended => {
                *state = State::None;
                fiber.fire_signal(self.resume_code);
                true
            },
        }
    }

    /// Worker: pause here iff the controller asked. Returns once resumed,
    /// immediately when no suspension is pending.
    pub async fn suspend_if_requested(&self, fiber: &mut FiberCtx) -> ConnResult<()> {
        {
            let mut state = self.state.lock().expect("suspender lock poisoned");
            match *state {
                State::None => return Ok(()),
                State::Pending => *state = State::Suspended,
                State::Suspended => {
                    unreachable!("a second worker entered suspend_if_requested")
                },
            }
        }
        fiber.wait_signal(self.resume_code).await
    }
}
