use std::sync::Arc;
use tokio::sync::watch;

/// Generation counter shared by the controller and every worker of a request.
///
/// Each submitted request bumps the generation; listeners created for an
/// older generation observe themselves as stopped. One signal therefore
/// cancels readers, in-flight fetches and pacing sleeps of the superseded
/// request without any per-request bookkeeping.
#[derive(Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<u64>>,
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }

    pub fn generation(&self) -> u64 {
        *self.tx.borrow()
    }

    /// Stop everything listening on the current generation and return the new one.
    pub fn advance(&self) -> u64 {
        let mut next = 0;
        self.tx.send_modify(|generation| {
            *generation += 1;
            next = *generation;
        });
        next
    }

    /// Listener bound to `generation`; already stopped if the signal has moved past it.
    pub fn listener(&self, generation: u64) -> StopListener {
        StopListener {
            rx: self.tx.subscribe(),
            generation,
        }
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct StopListener {
    rx: watch::Receiver<u64>,
    generation: u64,
}

impl StopListener {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow() != self.generation
    }

    /// Resolves once a newer request has been submitted.
    pub async fn stopped(&self) {
        let generation = self.generation;
        let mut rx = self.rx.clone();
        // A dropped signal also counts as stopped.
        let _ = rx.wait_for(|current| *current != generation).await;
    }
}

/// Single-slot mailbox; a newer value overwrites one not yet taken.
pub struct RequestSlot<T> {
    tx: watch::Sender<Option<T>>,
}

impl<T> RequestSlot<T> {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    pub fn put(&self, value: T) {
        self.tx.send_replace(Some(value));
    }

    pub fn take(&self) -> Option<T> {
        let mut taken = None;
        // Emptying the slot is not a change listeners need to see.
        self.tx.send_if_modified(|slot| {
            taken = slot.take();
            false
        });
        taken
    }

    pub fn is_empty(&self) -> bool {
        self.tx.borrow().is_none()
    }

    /// Wait until the slot is filled and take its value.
    pub async fn next(&self) -> T {
        let mut rx = self.tx.subscribe();
        loop {
            let filled = rx.wait_for(Option::is_some).await.is_ok();
            // The sender lives in `self`, so the wait cannot fail.
            debug_assert!(filled);
            if let Some(value) = self.take() {
                return value;
            }
        }
    }
}

impl<T> Default for RequestSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}
