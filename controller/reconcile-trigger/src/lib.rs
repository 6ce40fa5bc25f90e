// Copyright (c) Microsoft. All rights reserved.

//! The reconcile driver shared by the entry and federation engines.
//!
//! Change notifications call [`Trigger::trigger`], which is non-blocking
//! and idempotent: any number of triggers between two passes coalesce into
//! one. The loop runs one pass at a time, re-runs on trigger or on the GC
//! interval, and stops on shutdown. Dropping the in-flight pass on shutdown
//! cancels it at its next RPC await point.

#![deny(rust_2018_idioms)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::default_trait_access,
    clippy::let_unit_value,
    clippy::missing_errors_doc,
    clippy::similar_names,
    clippy::too_many_lines
)]

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use log::{error, info};
use tokio::sync::{watch, Notify};

type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync + 'static>>;

/// A whole-world reconciliation pass.
#[async_trait::async_trait]
pub trait Reconciler: Send + Sync {
    fn name(&self) -> &str;

    async fn reconcile(&self) -> Result<()>;
}

#[derive(Clone, Default)]
pub struct Trigger {
    inner: Arc<TriggerInner>,
}

#[derive(Default)]
struct TriggerInner {
    pending: AtomicBool,
    notify: Notify,
}

impl Trigger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a reconcile pass. Never blocks; triggers between passes
    /// coalesce.
    pub fn trigger(&self) {
        self.inner.pending.store(true, Ordering::SeqCst);
        self.inner.notify.notify_one();
    }

    fn take_pending(&self) -> bool {
        self.inner.pending.swap(false, Ordering::SeqCst)
    }

    /// Completes once a trigger is pending, consuming it. Stored notify
    /// permits without a pending trigger are ignored.
    async fn wait(&self) {
        loop {
            self.inner.notify.notified().await;
            if self.take_pending() {
                return;
            }
        }
    }
}

/// Drive `reconciler` until `shutdown` turns true (or its sender goes
/// away). One pass runs immediately on start.
pub async fn run_reconciler(
    reconciler: Arc<dyn Reconciler>,
    trigger: Trigger,
    gc_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Starting {} reconciler", reconciler.name());

    loop {
        trigger.take_pending();

        tokio::select! {
            () = wait_shutdown(&mut shutdown) => break,
            result = reconciler.reconcile() => {
                if let Err(err) = result {
                    error!("Reconciling {} failed: {}", reconciler.name(), err);
                }
            }
        }

        // Triggers that arrived during the pass start the next one
        // immediately.
        if trigger.take_pending() {
            continue;
        }

        tokio::select! {
            () = wait_shutdown(&mut shutdown) => break,
            () = tokio::time::sleep(gc_interval) => {}
            () = trigger.wait() => {}
        }
    }

    info!("Stopped {} reconciler", reconciler.name());
}

async fn wait_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use tokio::sync::Semaphore;
    use tokio::time::{sleep, timeout};

    use super::*;

    struct GatedReconciler {
        calls: AtomicUsize,
        gate: Semaphore,
    }

    impl GatedReconciler {
        fn new(initial_permits: usize) -> Arc<Self> {
            Arc::new(GatedReconciler {
                calls: AtomicUsize::new(0),
                gate: Semaphore::new(initial_permits),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        async fn wait_calls(&self, expected: usize) {
            timeout(Duration::from_secs(5), async {
                while self.calls() < expected {
                    sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .expect("reconciler never reached expected call count");
        }
    }

    #[async_trait::async_trait]
    impl Reconciler for GatedReconciler {
        fn name(&self) -> &str {
            "gated"
        }

        async fn reconcile(&self) -> Result<()> {
            self.gate.acquire().await.expect("gate closed").forget();
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn idle_gc() -> Duration {
        Duration::from_secs(3600)
    }

    #[tokio::test]
    async fn reconciles_once_on_start() {
        let reconciler = GatedReconciler::new(1);
        let trigger = Trigger::new();
        let (_tx, rx) = watch::channel(false);

        let handle = tokio::spawn(run_reconciler(
            reconciler.clone(),
            trigger,
            idle_gc(),
            rx,
        ));

        reconciler.wait_calls(1).await;
        sleep(Duration::from_millis(50)).await;
        assert_eq!(reconciler.calls(), 1);

        handle.abort();
    }

    #[tokio::test]
    async fn triggers_coalesce_into_one_pass() {
        let reconciler = GatedReconciler::new(1);
        let trigger = Trigger::new();
        let (_tx, rx) = watch::channel(false);

        let handle = tokio::spawn(run_reconciler(
            reconciler.clone(),
            trigger.clone(),
            idle_gc(),
            rx,
        ));
        reconciler.wait_calls(1).await;

        // Burst of triggers while the next pass is gated: exactly one
        // further pass.
        for _ in 0..10 {
            trigger.trigger();
        }
        sleep(Duration::from_millis(50)).await;
        assert_eq!(reconciler.calls(), 1);

        reconciler.gate.add_permits(1);
        reconciler.wait_calls(2).await;
        sleep(Duration::from_millis(50)).await;
        assert_eq!(reconciler.calls(), 2);

        handle.abort();
    }

    #[tokio::test]
    async fn gc_interval_reconciles_without_triggers() {
        let reconciler = GatedReconciler::new(100);
        let trigger = Trigger::new();
        let (_tx, rx) = watch::channel(false);

        let handle = tokio::spawn(run_reconciler(
            reconciler.clone(),
            trigger,
            Duration::from_millis(20),
            rx,
        ));

        reconciler.wait_calls(3).await;
        handle.abort();
    }

    #[tokio::test]
    async fn shutdown_stops_the_loop() {
        let reconciler = GatedReconciler::new(100);
        let trigger = Trigger::new();
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(run_reconciler(
            reconciler.clone(),
            trigger,
            idle_gc(),
            rx,
        ));
        reconciler.wait_calls(1).await;

        tx.send(true).unwrap();
        timeout(Duration::from_secs(5), handle)
            .await
            .expect("loop did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn shutdown_cancels_a_stuck_pass() {
        // No permits: the first pass blocks forever inside reconcile().
        let reconciler = GatedReconciler::new(0);
        let trigger = Trigger::new();
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(run_reconciler(
            reconciler.clone(),
            trigger,
            idle_gc(),
            rx,
        ));
        sleep(Duration::from_millis(50)).await;
        assert_eq!(reconciler.calls(), 0);

        tx.send(true).unwrap();
        timeout(Duration::from_secs(5), handle)
            .await
            .expect("stuck pass was not cancelled")
            .unwrap();
    }
}
