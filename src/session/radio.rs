use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use crate::hw::{BleAdapter, RadioState};

/// Reports the adapter's radio state and fans transitions out to listeners.
#[derive(Debug, Clone)]
pub struct AdapterStateMonitor {
    adapter: Arc<dyn BleAdapter>,
}

impl AdapterStateMonitor {
    #[must_use]
    pub fn new(adapter: Arc<dyn BleAdapter>) -> Self {
        Self { adapter }
    }

    #[must_use]
    pub fn current_state(&self) -> RadioState {
        self.adapter.radio_state()
    }

    /// Calls `listener` with the current state before returning, then once per
    /// transition, in order, until the returned subscription is dropped.
    ///
    /// A listener that falls too far behind is handed [`RadioState::Unknown`]
    /// for the transitions it missed.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn on_state_change<F>(&self, listener: F) -> StateSubscription
    where
        F: Fn(RadioState) + Send + 'static,
    {
        let mut transitions = self.adapter.radio_transitions();
        listener(self.adapter.radio_state());

        let task = tokio::spawn(async move {
            loop {
                match transitions.recv().await {
                    Ok(state) => {
                        trace!(%state, "radio state transition");
                        listener(state);
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "radio transitions dropped");
                        listener(RadioState::Unknown);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        StateSubscription { task }
    }
}

/// Keeps a state-change listener registered; dropping it unregisters.
#[derive(Debug)]
pub struct StateSubscription {
    task: JoinHandle<()>,
}

impl StateSubscription {
    pub fn cancel(self) {
        self.task.abort();
    }
}

impl Drop for StateSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::hw::{FakeAdapter, FakeAdapterConfig};

    fn recorder() -> (Arc<Mutex<Vec<RadioState>>>, impl Fn(RadioState) + Send + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |state| {
            sink.lock().expect("recorder lock").push(state);
        })
    }

    fn monitor_for(adapter: &Arc<FakeAdapter>) -> AdapterStateMonitor {
        AdapterStateMonitor::new(adapter.clone())
    }

    async fn settle() {
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn listener_sees_current_state_immediately() {
        let adapter = Arc::new(FakeAdapter::new(
            FakeAdapterConfig::builder()
                .radio_state(RadioState::PoweredOff)
                .build(),
        ));
        let monitor = monitor_for(&adapter);
        let (seen, listener) = recorder();

        let _subscription = monitor.on_state_change(listener);

        assert_eq!(vec![RadioState::PoweredOff], *seen.lock().expect("recorder lock"));
    }

    #[tokio::test]
    async fn listener_sees_transitions_until_cancelled() {
        let adapter = Arc::new(FakeAdapter::new(FakeAdapterConfig::builder().build()));
        let monitor = monitor_for(&adapter);
        let (seen, listener) = recorder();
        let subscription = monitor.on_state_change(listener);

        adapter.set_radio_state(RadioState::PoweredOff);
        settle().await;
        subscription.cancel();
        adapter.set_radio_state(RadioState::PoweredOn);
        settle().await;

        assert_eq!(
            vec![RadioState::PoweredOn, RadioState::PoweredOff],
            *seen.lock().expect("recorder lock")
        );
        assert_eq!(RadioState::PoweredOn, monitor.current_state());
    }

    #[tokio::test]
    async fn back_to_back_flap_is_reported_in_full() {
        let adapter = Arc::new(FakeAdapter::new(FakeAdapterConfig::builder().build()));
        let monitor = monitor_for(&adapter);
        let (seen, listener) = recorder();
        let _subscription = monitor.on_state_change(listener);

        adapter.set_radio_state(RadioState::PoweredOff);
        adapter.set_radio_state(RadioState::PoweredOn);
        settle().await;

        assert_eq!(
            vec![
                RadioState::PoweredOn,
                RadioState::PoweredOff,
                RadioState::PoweredOn
            ],
            *seen.lock().expect("recorder lock")
        );
    }
}
