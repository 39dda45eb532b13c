//! The failure-monitor contract and a scriptable implementation.
//!
//! Liveness tracking is external to the RPC layer; the layer only consumes
//! per-endpoint signals to translate transport faults into caller-visible
//! errors. Like the transport, the monitor is installed once per runtime
//! and reached through [`failure_monitor()`]. [`ManualFailureMonitor`] is
//! the in-process implementation used by tests and local tooling: the
//! harness flips endpoints up and down by hand.

use std::cell::RefCell;
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use rill_core::{Endpoint, NetworkAddress};

/// Future produced by monitor queries. Completes when the watched
/// condition holds; never errors.
pub type MonitorFuture = Pin<Box<dyn Future<Output = ()>>>;

/// Per-endpoint liveness signals consumed by the RPC layer.
pub trait FailureMonitor {
    /// Record that a peer reported no receiver behind `endpoint`'s token.
    /// Fired when a broken-promise error arrives for a reply endpoint.
    fn endpoint_not_found(&self, endpoint: &Endpoint);

    /// Synchronous query: is the endpoint's peer currently considered
    /// disconnected or failed? Used to short-circuit at-most-once sends.
    fn currently_failed(&self, endpoint: &Endpoint) -> bool;

    /// Completes when the endpoint's peer disconnects or is marked failed.
    /// Already-failed endpoints yield an immediately-ready future.
    fn on_disconnect_or_failure(&self, endpoint: &Endpoint) -> MonitorFuture;

    /// Completes when the failure has been sustained for
    /// `sustained_failure_duration`, scaled by `sustained_failure_slope`
    /// against how long the endpoint had been healthy.
    fn on_failed_for(
        &self,
        endpoint: &Endpoint,
        sustained_failure_duration: Duration,
        sustained_failure_slope: f64,
    ) -> MonitorFuture;
}

thread_local! {
    static FAILURE_MONITOR: RefCell<Option<Rc<dyn FailureMonitor>>> = const { RefCell::new(None) };
}

/// Install the runtime's failure monitor.
///
/// # Panics
///
/// Panics if a monitor is already installed; call
/// [`teardown_failure_monitor`] first when swapping.
pub fn init_failure_monitor(monitor: Rc<dyn FailureMonitor>) {
    FAILURE_MONITOR.with(|slot| {
        let mut slot = slot.borrow_mut();
        assert!(slot.is_none(), "failure monitor already installed");
        *slot = Some(monitor);
    });
}

/// The installed failure monitor.
///
/// # Panics
///
/// Panics if [`init_failure_monitor`] has not run on this runtime.
pub fn failure_monitor() -> Rc<dyn FailureMonitor> {
    try_failure_monitor().expect("no failure monitor installed; call init_failure_monitor() first")
}

/// The installed monitor, or `None` during shutdown.
pub(crate) fn try_failure_monitor() -> Option<Rc<dyn FailureMonitor>> {
    FAILURE_MONITOR.with(|slot| slot.borrow().clone())
}

/// Remove the installed failure monitor.
pub fn teardown_failure_monitor() {
    FAILURE_MONITOR.with(|slot| slot.borrow_mut().take());
}

#[derive(Default)]
struct MonitorState {
    failed: RefCell<HashSet<NetworkAddress>>,
    wakers: RefCell<Vec<Waker>>,
    not_found: RefCell<Vec<Endpoint>>,
}

impl MonitorState {
    fn wake_all(&self) {
        for waker in self.wakers.borrow_mut().drain(..) {
            waker.wake();
        }
    }
}

/// Hand-driven [`FailureMonitor`].
///
/// The harness marks addresses failed or healthy with [`set_failed`];
/// watch futures resolve accordingly. `on_failed_for` treats any marked
/// failure as already sustained — duration/slope integration belongs to a
/// production monitor, and tests want the signal immediately.
///
/// [`set_failed`]: ManualFailureMonitor::set_failed
#[derive(Clone, Default)]
pub struct ManualFailureMonitor {
    state: Rc<MonitorState>,
}

impl ManualFailureMonitor {
    /// A monitor with every address healthy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `address` failed or healthy, waking every watcher.
    pub fn set_failed(&self, address: &NetworkAddress, failed: bool) {
        let mut set = self.state.failed.borrow_mut();
        let changed = if failed {
            set.insert(address.clone())
        } else {
            set.remove(address)
        };
        drop(set);
        if changed {
            tracing::debug!(%address, failed, "failure state changed");
            self.state.wake_all();
        }
    }

    /// Endpoints reported through [`FailureMonitor::endpoint_not_found`],
    /// oldest first.
    pub fn not_found_endpoints(&self) -> Vec<Endpoint> {
        self.state.not_found.borrow().clone()
    }
}

impl FailureMonitor for ManualFailureMonitor {
    fn endpoint_not_found(&self, endpoint: &Endpoint) {
        tracing::debug!(token = %endpoint.token, "endpoint not found");
        self.state.not_found.borrow_mut().push(endpoint.clone());
    }

    fn currently_failed(&self, endpoint: &Endpoint) -> bool {
        self.state.failed.borrow().contains(&endpoint.address)
    }

    fn on_disconnect_or_failure(&self, endpoint: &Endpoint) -> MonitorFuture {
        Box::pin(FailedWatch {
            state: Rc::clone(&self.state),
            address: endpoint.address.clone(),
        })
    }

    fn on_failed_for(
        &self,
        endpoint: &Endpoint,
        _sustained_failure_duration: Duration,
        _sustained_failure_slope: f64,
    ) -> MonitorFuture {
        Box::pin(FailedWatch {
            state: Rc::clone(&self.state),
            address: endpoint.address.clone(),
        })
    }
}

struct FailedWatch {
    state: Rc<MonitorState>,
    address: NetworkAddress,
}

impl Future for FailedWatch {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.state.failed.borrow().contains(&self.address) {
            return Poll::Ready(());
        }
        self.state.wakers.borrow_mut().push(cx.waker().clone());
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use rill_core::UID;

    use super::*;

    fn endpoint(port: u16) -> Endpoint {
        let addr = NetworkAddress::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        Endpoint::new(addr, UID::new(1, 1))
    }

    #[test]
    fn failed_state_is_per_address() {
        let monitor = ManualFailureMonitor::new();
        let a = endpoint(4500);
        let b = endpoint(4501);

        monitor.set_failed(&a.address, true);
        assert!(monitor.currently_failed(&a));
        assert!(!monitor.currently_failed(&b));

        monitor.set_failed(&a.address, false);
        assert!(!monitor.currently_failed(&a));
    }

    #[tokio::test]
    async fn watch_resolves_on_failure() {
        let monitor = ManualFailureMonitor::new();
        let ep = endpoint(4500);

        monitor.set_failed(&ep.address, true);
        monitor.on_disconnect_or_failure(&ep).await;
        monitor
            .on_failed_for(&ep, Duration::from_secs(1), 0.1)
            .await;
    }

    #[test]
    fn not_found_reports_are_recorded() {
        let monitor = ManualFailureMonitor::new();
        let ep = endpoint(4500);
        monitor.endpoint_not_found(&ep);
        assert_eq!(monitor.not_found_endpoints(), vec![ep]);
    }
}
