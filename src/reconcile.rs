//! The single writer of the record table.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::metrics::Metrics;
use crate::state::{AddressEvent, Reconciled, RecordStore};

/// Capacity of the shared event channel. Kept at one so watchers block on
/// send while the loop is busy instead of queueing events.
pub const EVENT_CHANNEL_CAPACITY: usize = 1;

/// Create the channel shared by every watcher and the reconciliation loop.
pub fn event_channel() -> (mpsc::Sender<AddressEvent>, mpsc::Receiver<AddressEvent>) {
    mpsc::channel(EVENT_CHANNEL_CAPACITY)
}

/// Apply events to `store` in arrival order until the channel closes or
/// `cancel` fires.
pub async fn run(
    mut events: mpsc::Receiver<AddressEvent>,
    store: RecordStore,
    metrics: Metrics,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("reconciliation loop shutting down");
                return;
            }

            event = events.recv() => match event {
                Some(event) => event,
                None => {
                    debug!("all watchers gone, reconciliation loop exiting");
                    return;
                }
            },
        };

        apply(&store, &metrics, event);
    }
}

fn apply(store: &RecordStore, metrics: &Metrics, event: AddressEvent) {
    let AddressEvent { service, addresses } = event;

    match store.reconcile(&service, addresses) {
        Reconciled::NoAddresses => {
            info!(service = %service, "No records for service");
        }
        Reconciled::Kept => {}
        Reconciled::Selected(_) => {
            metrics.record_selection_change(&service);
            metrics.record_state_counts(store.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::testing::{prometheus, sample};
    use std::time::Duration;

    #[tokio::test]
    async fn test_events_applied_in_order() {
        let store = RecordStore::new("z");
        let (tx, rx) = event_channel();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(rx, store.clone(), Metrics::noop(), cancel.clone()));

        tx.send(AddressEvent::new("svc1", ["10.0.0.2"])).await.unwrap();
        tx.send(AddressEvent::new("svc1", ["10.0.0.2", "10.0.0.4", "10.0.0.5"]))
            .await
            .unwrap();
        tx.send(AddressEvent::new("svc1", ["10.0.0.3", "10.0.0.4"]))
            .await
            .unwrap();
        tx.send(AddressEvent::new("svc1", Vec::<String>::new()))
            .await
            .unwrap();
        drop(tx);

        handle.await.unwrap();
        assert_eq!(store.lookup("svc1.z.").as_deref(), Some("10.0.0.3"));
    }

    #[tokio::test]
    async fn test_selection_change_metric_fires_only_on_change() {
        let store = RecordStore::new("z");
        let (metrics, prom) = prometheus();
        let (tx, rx) = event_channel();
        let handle = tokio::spawn(run(rx, store, metrics, CancellationToken::new()));

        tx.send(AddressEvent::new("svc1", ["10.0.0.2"])).await.unwrap();
        tx.send(AddressEvent::new("svc1", ["10.0.0.2", "10.0.0.1"]))
            .await
            .unwrap();
        tx.send(AddressEvent::new("svc1", Vec::<String>::new()))
            .await
            .unwrap();
        tx.send(AddressEvent::new("svc1", ["10.0.0.7"])).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(
            sample(
                &prom.render(),
                "selection_change_count",
                &[("service", "svc1")]
            ),
            Some(2.0)
        );
    }

    #[tokio::test]
    async fn test_cancel_stops_loop_with_open_channel() {
        let (_tx, rx) = event_channel();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(
            rx,
            RecordStore::new("z"),
            Metrics::noop(),
            cancel.clone(),
        ));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_senders_block_while_loop_is_not_consuming() {
        let (tx, _rx) = event_channel();

        tx.send(AddressEvent::new("svc1", ["10.0.0.1"])).await.unwrap();
        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            tx.send(AddressEvent::new("svc1", ["10.0.0.2"])),
        )
        .await;
        assert!(blocked.is_err(), "second send should wait for the consumer");
    }
}
