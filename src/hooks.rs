//! Firmware-update hooks
//!
//! The manager only drives these; the update transport itself lives
//! elsewhere. Hooks are started the first time the link is usable and
//! polled on every `poll` while the status is at least `LinkOnly` or
//! `Broadcasting`.

pub trait UpdateHooks {
    fn start(&mut self);

    fn stop(&mut self);

    fn poll(&mut self);
}

/// Start/stop bookkeeping around a boxed [`UpdateHooks`]
pub(crate) struct HookDriver {
    hooks: Option<Box<dyn UpdateHooks>>,
    running: bool,
}

impl HookDriver {
    pub(crate) fn new() -> Self {
        Self {
            hooks: None,
            running: false,
        }
    }

    pub(crate) fn install(&mut self, hooks: Box<dyn UpdateHooks>) {
        self.stop();
        self.hooks = Some(hooks);
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running
    }

    /// Start if needed, then poll
    pub(crate) fn service(&mut self) {
        if let Some(hooks) = self.hooks.as_mut() {
            if !self.running {
                hooks.start();
                self.running = true;
            }
            hooks.poll();
        }
    }

    pub(crate) fn stop(&mut self) {
        if let Some(hooks) = self.hooks.as_mut() {
            if self.running {
                hooks.stop();
            }
        }
        self.running = false;
    }
}
