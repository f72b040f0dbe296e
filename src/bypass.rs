use std::sync::atomic::{AtomicBool, Ordering};

/// Cross-thread bypass flag. Written by the control surface, read once per block.
#[derive(Debug, Default)]
pub struct BypassController {
    bypassed: AtomicBool,
}

impl BypassController {
    pub fn new(bypassed: bool) -> Self {
        Self {
            bypassed: AtomicBool::new(bypassed),
        }
    }

    #[inline]
    pub fn is_bypassed(&self) -> bool {
        self.bypassed.load(Ordering::Relaxed)
    }

    pub fn set_bypass(&self, bypassed: bool) {
        self.bypassed.store(bypassed, Ordering::Relaxed);
    }

    /// Flip the flag and return the new value.
    pub fn toggle(&self) -> bool {
        !self.bypassed.fetch_xor(true, Ordering::Relaxed)
    }
}
