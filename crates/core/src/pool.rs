//! Reusable outbound association pool.
//!
//! Establishing an association to a remote peer is expensive (connection,
//! negotiation), so consecutive sends to the same destination reuse one live
//! association. The base design holds at most one association at a time: a
//! send to a different destination tears the current one down first. That is
//! a deliberate simplicity/throughput trade-off; a generalization to
//! one-per-destination with capacity bounds would keep the same contract per
//! slot.

use crate::{CoreError, CoreResult};
use opal_types::RemoteDestination;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A live association to one remote destination.
pub trait Association: Send {
    /// Sends one payload over the association.
    fn send(&mut self, payload: &[u8]) -> CoreResult<()>;

    /// Closes the association. Called best-effort during teardown.
    fn close(&mut self) -> CoreResult<()>;
}

/// Opens associations towards remote destinations. The transport behind this
/// seam (protocol negotiation, sockets) belongs to the embedding server;
/// tests inject scripted implementations.
pub trait AssociationOpener: Send + Sync {
    fn open(&self, destination: &RemoteDestination) -> CoreResult<Box<dyn Association>>;
}

struct HeldAssociation {
    destination: RemoteDestination,
    association: Box<dyn Association>,
    last_used: Instant,
}

/// Pool holding at most one live outbound association.
pub struct ReusableAssociation {
    opener: Box<dyn AssociationOpener>,
    idle_timeout: Duration,
    slot: Mutex<Option<HeldAssociation>>,
}

impl ReusableAssociation {
    pub fn new(opener: Box<dyn AssociationOpener>, idle_timeout: Duration) -> Self {
        Self {
            opener,
            idle_timeout,
            slot: Mutex::new(None),
        }
    }

    /// Sends `payload` to `destination`, reusing the held association when
    /// its destination tuple matches and it has not been idle past the
    /// timeout.
    ///
    /// On send failure the broken association is discarded so the next call
    /// re-establishes fresh state instead of failing repeatedly over a dead
    /// link.
    pub fn send_to(&self, destination: &RemoteDestination, payload: &[u8]) -> CoreResult<()> {
        let mut slot = self.lock()?;

        let reusable = matches!(
            slot.as_ref(),
            Some(held)
                if held.destination == *destination
                    && held.last_used.elapsed() < self.idle_timeout
        );

        if !reusable {
            if let Some(held) = slot.take() {
                Self::close_discarded(held);
            }
        }

        if slot.is_none() {
            tracing::info!("opening association to {}", destination);
            let association = self.opener.open(destination)?;
            *slot = Some(HeldAssociation {
                destination: destination.clone(),
                association,
                last_used: Instant::now(),
            });
        }

        match slot.as_mut() {
            Some(held) => match held.association.send(payload) {
                Ok(()) => {
                    held.last_used = Instant::now();
                    Ok(())
                }
                Err(err) => {
                    if let Some(broken) = slot.take() {
                        Self::close_discarded(broken);
                    }
                    Err(err)
                }
            },
            None => Err(CoreError::Internal(
                "association slot empty after open".into(),
            )),
        }
    }

    /// Tears down the held association, if any.
    pub fn close(&self) -> CoreResult<()> {
        let mut slot = self.lock()?;
        if let Some(held) = slot.take() {
            Self::close_discarded(held);
        }
        Ok(())
    }

    fn close_discarded(mut held: HeldAssociation) {
        if let Err(err) = held.association.close() {
            tracing::warn!(
                "failed to close association to {}: {}",
                held.destination,
                err
            );
        }
    }

    fn lock(&self) -> CoreResult<std::sync::MutexGuard<'_, Option<HeldAssociation>>> {
        self.slot
            .lock()
            .map_err(|_| CoreError::Internal("association slot lock poisoned".into()))
    }
}

impl std::fmt::Debug for ReusableAssociation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReusableAssociation")
            .field("idle_timeout", &self.idle_timeout)
            .finish_non_exhaustive()
    }
}
