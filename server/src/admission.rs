//! Connection admission control.
//!
//! Every accepted TCP socket must obtain an [`AdmissionTicket`] before the
//! HTTP engine sees it. A ticket holds one permit of the global semaphore and
//! one slot in the per-address table; dropping it releases both, so the
//! counters stay correct no matter how the connection ends (clean close, I/O
//! error, panic unwinding, or runtime shutdown).
//!
//! ## Concurrency
//!
//! The per-address table is a `std::sync::Mutex<HashMap>`. `try_admit` holds
//! the lock across the per-address check, the global `try_acquire`, and the
//! increment, so the two limits are checked and taken together. The lock is
//! never held across an `.await`.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Why a connection was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("global connection limit ({limit}) reached")]
    GlobalLimit { limit: usize },
    #[error("per-address connection limit ({limit}) reached for {addr}")]
    AddressLimit { addr: IpAddr, limit: usize },
}

/// Bounds concurrent connections globally and per source address.
///
/// Cloneable — all clones share the same counters.
#[derive(Clone)]
pub struct AdmissionController {
    inner: Arc<Inner>,
}

struct Inner {
    global: Arc<Semaphore>,
    max_global: usize,
    max_per_addr: usize,
    per_addr: Mutex<HashMap<IpAddr, usize>>,
}

impl Inner {
    fn table(&self) -> MutexGuard<'_, HashMap<IpAddr, usize>> {
        self.per_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AdmissionController {
    pub fn new(max_global: usize, max_per_addr: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                global: Arc::new(Semaphore::new(max_global)),
                max_global,
                max_per_addr,
                per_addr: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Admit a connection from `addr`, or say why not.
    pub fn try_admit(&self, addr: IpAddr) -> Result<AdmissionTicket, Rejection> {
        let mut table = self.inner.table();

        let current = table.get(&addr).copied().unwrap_or(0);
        if current >= self.inner.max_per_addr {
            return Err(Rejection::AddressLimit {
                addr,
                limit: self.inner.max_per_addr,
            });
        }

        let permit = Arc::clone(&self.inner.global)
            .try_acquire_owned()
            .map_err(|_| Rejection::GlobalLimit {
                limit: self.inner.max_global,
            })?;

        table.insert(addr, current + 1);
        drop(table);

        Ok(AdmissionTicket {
            addr,
            controller: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    /// Connections currently holding a ticket.
    pub fn active(&self) -> usize {
        self.inner.max_global - self.inner.global.available_permits()
    }

    /// Connections currently holding a ticket for `addr`.
    pub fn active_for(&self, addr: IpAddr) -> usize {
        self.inner.table().get(&addr).copied().unwrap_or(0)
    }

    /// Number of distinct addresses with at least one live connection.
    #[cfg(test)]
    pub(crate) fn tracked_addresses(&self) -> usize {
        self.inner.table().len()
    }
}

/// Proof of admission for one connection. Releases its slots on drop.
pub struct AdmissionTicket {
    addr: IpAddr,
    controller: Arc<Inner>,
    _permit: OwnedSemaphorePermit,
}

impl AdmissionTicket {
    /// The peer address this ticket was issued for.
    pub fn addr(&self) -> IpAddr {
        self.addr
    }
}

impl Drop for AdmissionTicket {
    fn drop(&mut self) {
        let mut table = self.controller.table();
        if let Some(count) = table.get_mut(&self.addr) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                table.remove(&self.addr);
            }
        }
        // The global permit is returned when `_permit` drops after this body.
    }
}

impl std::fmt::Debug for AdmissionTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionTicket")
            .field("addr", &self.addr)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn test_global_limit_rejects_next_connection() {
        let admission = AdmissionController::new(3, 10);
        let tickets: Vec<_> = (1..=3).map(|n| admission.try_admit(ip(n)).unwrap()).collect();
        assert_eq!(admission.active(), 3);

        let err = admission.try_admit(ip(4)).unwrap_err();
        assert_eq!(err, Rejection::GlobalLimit { limit: 3 });
        // A rejected attempt leaves no trace in the table.
        assert_eq!(admission.active_for(ip(4)), 0);

        drop(tickets);
        assert_eq!(admission.active(), 0);
        assert!(admission.try_admit(ip(4)).is_ok());
    }

    #[test]
    fn test_per_address_limit_isolated_from_other_addresses() {
        let admission = AdmissionController::new(100, 2);
        let _a1 = admission.try_admit(ip(1)).unwrap();
        let _a2 = admission.try_admit(ip(1)).unwrap();

        let err = admission.try_admit(ip(1)).unwrap_err();
        assert_eq!(
            err,
            Rejection::AddressLimit {
                addr: ip(1),
                limit: 2
            }
        );

        let b = admission.try_admit(ip(2));
        assert!(b.is_ok());
        assert_eq!(admission.active_for(ip(1)), 2);
        assert_eq!(admission.active_for(ip(2)), 1);
        assert_eq!(admission.active(), 3);
    }

    #[test]
    fn test_release_on_drop_frees_both_counters() {
        let admission = AdmissionController::new(5, 1);
        let ticket = admission.try_admit(ip(7)).unwrap();
        assert_eq!(ticket.addr(), ip(7));
        assert!(admission.try_admit(ip(7)).is_err());

        drop(ticket);
        assert_eq!(admission.active(), 0);
        assert_eq!(admission.tracked_addresses(), 0);
        assert!(admission.try_admit(ip(7)).is_ok());
    }

    #[test]
    fn test_release_on_panic_unwind() {
        let admission = AdmissionController::new(1, 1);
        let cloned = admission.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _ticket = cloned.try_admit(ip(9)).unwrap();
            panic!("handler blew up");
        }));
        assert!(result.is_err());
        assert_eq!(admission.active(), 0);
        assert_eq!(admission.active_for(ip(9)), 0);
    }

    #[test]
    fn test_concurrent_admission_never_exceeds_limit() {
        let admission = AdmissionController::new(8, 100);
        let handles: Vec<_> = (0..32u8)
            .map(|n| {
                let admission = admission.clone();
                std::thread::spawn(move || admission.try_admit(ip(n % 4)).ok())
            })
            .collect();
        let admitted: Vec<_> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(admitted.len(), 8);
        assert_eq!(admission.active(), 8);
        drop(admitted);
        assert_eq!(admission.active(), 0);
        assert_eq!(admission.tracked_addresses(), 0);
    }
}
