//! Single-slot exchange scheduler
//!
//! At most one PASN exchange exists per device. A request occupies the slot
//! from the moment it is queued until its terminal status has been reported,
//! including any comeback wait in between.

use tracing::debug;

use crate::host::DriverCapabilities;
use crate::ieee80211::rsn::Akm;
use crate::ieee80211::{status, MacAddr};
use crate::pasn::{Comeback, ConfigError, ExchangeParams, PasnError, PasnExchange};
use crate::time::Timestamp;

/// Who asked for the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Manual,
    Batch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub params: ExchangeParams,
    pub origin: Origin,
    /// Comeback retries already spent
    pub retries: u8,
}

impl Job {
    pub fn new(params: ExchangeParams, origin: Origin) -> Self {
        Self {
            params,
            origin,
            retries: 0,
        }
    }
}

enum Slot {
    Idle,
    Queued {
        job: Job,
        since: Timestamp,
    },
    Running {
        job: Job,
        exchange: PasnExchange,
    },
    RetryWait {
        job: Job,
        at: Timestamp,
        comeback: Comeback,
    },
}

/// What `stop()` found in the slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stopped {
    pub job: Job,
    pub status: u16,
    pub comeback: Option<Comeback>,
}

pub struct Scheduler {
    slot: Slot,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self { slot: Slot::Idle }
    }

    /// Queue a job. Refused while another job holds the slot or when the
    /// driver cannot send off-channel.
    pub fn request(
        &mut self,
        job: Job,
        caps: DriverCapabilities,
        now: Timestamp,
    ) -> Result<(), PasnError> {
        if !caps.offchannel_tx {
            return Err(ConfigError::NoOffchannelTx.into());
        }
        if !self.is_idle() {
            return Err(PasnError::Busy);
        }
        debug!("scheduler: queued {} ({:?})", job.params.peer_addr, job.origin);
        self.slot = Slot::Queued { job, since: now };
        Ok(())
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.slot, Slot::Idle)
    }

    /// Peer and AKM of whatever holds the slot
    pub fn current(&self) -> Option<(MacAddr, Akm)> {
        match &self.slot {
            Slot::Idle => None,
            Slot::Queued { job, .. } | Slot::Running { job, .. } | Slot::RetryWait { job, .. } => {
                Some((job.params.peer_addr, job.params.akm))
            }
        }
    }

    /// When `poll` has something to do for the slot
    pub fn next_deadline(&self) -> Option<Timestamp> {
        match &self.slot {
            Slot::Idle => None,
            Slot::Queued { since, .. } => Some(*since),
            Slot::Running { exchange, .. } => exchange.deadline(),
            Slot::RetryWait { at, .. } => Some(*at),
        }
    }

    /// Take a job that is ready to be started
    pub fn take_due(&mut self, now: Timestamp) -> Option<Job> {
        let due = match &self.slot {
            Slot::Queued { .. } => true,
            Slot::RetryWait { at, .. } => now >= *at,
            _ => false,
        };
        if !due {
            return None;
        }
        match std::mem::replace(&mut self.slot, Slot::Idle) {
            Slot::Queued { job, .. } | Slot::RetryWait { job, .. } => Some(job),
            other => {
                self.slot = other;
                None
            }
        }
    }

    pub fn set_running(&mut self, job: Job, exchange: PasnExchange) {
        self.slot = Slot::Running { job, exchange };
    }

    pub fn running_mut(&mut self) -> Option<(&Job, &mut PasnExchange)> {
        match &mut self.slot {
            Slot::Running { job, exchange } => Some((&*job, exchange)),
            _ => None,
        }
    }

    /// Release the running exchange, dropping (and scrubbing) it
    pub fn finish(&mut self) -> Option<Job> {
        if !matches!(self.slot, Slot::Running { .. }) {
            return None;
        }
        match std::mem::replace(&mut self.slot, Slot::Idle) {
            Slot::Running { job, .. } => Some(job),
            _ => None,
        }
    }

    /// Park a job until `at`
    pub fn wait_retry(&mut self, job: Job, at: Timestamp, comeback: Comeback) {
        debug!("scheduler: {} retries at {:?}", job.params.peer_addr, at);
        self.slot = Slot::RetryWait { job, at, comeback };
    }

    /// Empty the slot whatever it holds. Safe to call repeatedly.
    pub fn stop(&mut self) -> Option<Stopped> {
        match std::mem::replace(&mut self.slot, Slot::Idle) {
            Slot::Idle => None,
            Slot::Queued { job, .. } => Some(Stopped {
                job,
                status: status::UNSPECIFIED_FAILURE,
                comeback: None,
            }),
            Slot::Running { job, mut exchange } => {
                exchange.abort();
                Some(Stopped {
                    job,
                    status: exchange.status(),
                    comeback: exchange.comeback().cloned(),
                })
            }
            Slot::RetryWait { job, comeback, .. } => Some(Stopped {
                job,
                status: status::ASSOC_REJECTED_TEMPORARILY,
                comeback: Some(comeback),
            }),
        }
    }
}
