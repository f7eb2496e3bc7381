//! Global resource quotas shared by all jobs
//!
//! One mutex guards both counters. It is held for a single increment or
//! decrement and never across I/O. Reservations are returned as permits
//! that give the capacity back when dropped.

use backspace_core::{BackspaceError, Result};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct Counters {
    jobs: usize,
    bytes: u64,
}

/// Snapshot of current quota usage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaUsage {
    pub jobs: usize,
    pub max_jobs: usize,
    pub bytes: u64,
    pub max_bytes: u64,
}

/// Concurrent job count and workspace byte budget
#[derive(Debug)]
pub struct ResourceQuotas {
    max_jobs: usize,
    max_bytes: u64,
    counters: Mutex<Counters>,
}

impl ResourceQuotas {
    pub fn new(max_jobs: usize, max_bytes: u64) -> Arc<Self> {
        Arc::new(Self {
            max_jobs,
            max_bytes,
            counters: Mutex::new(Counters::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Counters> {
        // Counters stay consistent even if a holder panicked mid-update
        self.counters.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reserve one concurrent job slot
    pub fn acquire_job(self: &Arc<Self>) -> Result<JobPermit> {
        {
            let mut counters = self.lock();
            if counters.jobs >= self.max_jobs {
                return Err(BackspaceError::ResourceExhausted(format!(
                    "{} jobs already running (limit {})",
                    counters.jobs, self.max_jobs
                )));
            }
            counters.jobs += 1;
        }
        Ok(JobPermit {
            quotas: Arc::clone(self),
        })
    }

    /// Reserve `bytes` of the total workspace budget
    pub fn reserve_bytes(self: &Arc<Self>, bytes: u64) -> Result<BytePermit> {
        {
            let mut counters = self.lock();
            let requested = counters.bytes.saturating_add(bytes);
            if requested > self.max_bytes {
                return Err(BackspaceError::ResourceExhausted(format!(
                    "workspace budget exhausted: {} of {} bytes reserved, {} requested",
                    counters.bytes, self.max_bytes, bytes
                )));
            }
            counters.bytes = requested;
        }
        Ok(BytePermit {
            quotas: Arc::clone(self),
            bytes,
        })
    }

    pub fn usage(&self) -> QuotaUsage {
        let counters = self.lock();
        QuotaUsage {
            jobs: counters.jobs,
            max_jobs: self.max_jobs,
            bytes: counters.bytes,
            max_bytes: self.max_bytes,
        }
    }
}

/// A held job slot; released on drop
#[derive(Debug)]
pub struct JobPermit {
    quotas: Arc<ResourceQuotas>,
}

impl Drop for JobPermit {
    fn drop(&mut self) {
        let mut counters = self.quotas.lock();
        counters.jobs = counters.jobs.saturating_sub(1);
    }
}

/// A held byte reservation; released on drop
#[derive(Debug)]
pub struct BytePermit {
    quotas: Arc<ResourceQuotas>,
    bytes: u64,
}

impl BytePermit {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for BytePermit {
    fn drop(&mut self) {
        let mut counters = self.quotas.lock();
        counters.bytes = counters.bytes.saturating_sub(self.bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_slots() {
        let quotas = ResourceQuotas::new(2, 1000);
        let a = quotas.acquire_job().unwrap();
        let _b = quotas.acquire_job().unwrap();
        assert!(matches!(
            quotas.acquire_job(),
            Err(BackspaceError::ResourceExhausted(_))
        ));

        drop(a);
        assert_eq!(quotas.usage().jobs, 1);
        assert!(quotas.acquire_job().is_ok());
    }

    #[test]
    fn test_byte_budget() {
        let quotas = ResourceQuotas::new(4, 100);
        let first = quotas.reserve_bytes(60).unwrap();
        assert_eq!(first.bytes(), 60);
        assert!(quotas.reserve_bytes(50).is_err());

        let second = quotas.reserve_bytes(40).unwrap();
        assert_eq!(quotas.usage().bytes, 100);

        drop(first);
        drop(second);
        assert_eq!(quotas.usage().bytes, 0);
    }

    #[test]
    fn test_concurrent_reservations_never_exceed_limit() {
        let quotas = ResourceQuotas::new(8, 1000);
        let handles: Vec<_> = (0..32)
            .map(|_| {
                let quotas = Arc::clone(&quotas);
                std::thread::spawn(move || quotas.acquire_job().ok())
            })
            .collect();

        let permits: Vec<_> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(permits.len(), 8);
        assert_eq!(quotas.usage().jobs, 8);
    }
}
