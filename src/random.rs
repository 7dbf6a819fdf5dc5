//! Shared random-number generation.
//!
//! Every step holds an [`RngHandle`]; clones of a handle share one
//! underlying generator, so draws interleave deterministically across
//! the phases that share it. The process-global default handle is used
//! by steps constructed without an explicit generator.

use std::sync::{Arc, Mutex, OnceLock};

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// Cloneable handle to a shared ChaCha generator.
#[derive(Clone, Debug)]
pub struct RngHandle {
    inner: Arc<Mutex<ChaCha8Rng>>,
}

impl RngHandle {
    pub fn seeded(seed: u64) -> Self {
        Self::from_rng(ChaCha8Rng::seed_from_u64(seed))
    }

    pub fn from_rng(rng: ChaCha8Rng) -> Self {
        Self {
            inner: Arc::new(Mutex::new(rng)),
        }
    }

    /// The process-global default handle, seeded from the OS once.
    pub fn global() -> Self {
        static GLOBAL: OnceLock<RngHandle> = OnceLock::new();
        GLOBAL
            .get_or_init(|| Self::from_rng(ChaCha8Rng::from_os_rng()))
            .clone()
    }

    /// Copies the current generator state. The copy replays the stream
    /// the handle is about to produce without consuming it.
    pub fn snapshot(&self) -> ChaCha8Rng {
        self.inner.lock().expect("rng mutex poisoned").clone()
    }

    /// Runs `f` with exclusive access to the generator.
    pub fn with<T>(&self, f: impl FnOnce(&mut ChaCha8Rng) -> T) -> T {
        let mut rng = self.inner.lock().expect("rng mutex poisoned");
        f(&mut rng)
    }
}
