use crate::normalize::RawEvent;
use crate::runtime::FleetInput;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered(usize),
    /// Nobody is listening for this kind; the event was dropped.
    NoSubscriber,
    /// Every subscriber's queue had already closed.
    Closed,
}

struct Route {
    id: u64,
    sink: mpsc::Sender<FleetInput>,
}

#[derive(Default)]
struct Routes {
    next_id: u64,
    by_kind: HashMap<String, Vec<Route>>,
}

/// Fans inbound transport events out to whoever subscribed to their kind.
#[derive(Clone, Default)]
pub struct EventRouter {
    routes: Arc<Mutex<Routes>>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, kinds: &[&str], sink: mpsc::Sender<FleetInput>) -> Subscription {
        let mut routes = lock(&self.routes);
        routes.next_id += 1;
        let id = routes.next_id;
        for kind in kinds {
            routes
                .by_kind
                .entry(kind.to_string())
                .or_default()
                .push(Route {
                    id,
                    sink: sink.clone(),
                });
        }
        debug!(event = "router_subscribe", subscription = id, kinds = kinds.len());
        Subscription {
            id,
            kinds: kinds.iter().map(|kind| kind.to_string()).collect(),
            routes: Arc::downgrade(&self.routes),
        }
    }

    /// Delivers the event to every live subscriber of its kind, waiting for queue space.
    pub async fn route(&self, raw: RawEvent) -> RouteOutcome {
        let sinks: Vec<mpsc::Sender<FleetInput>> = {
            let routes = lock(&self.routes);
            routes
                .by_kind
                .get(raw.kind.as_str())
                .map(|routes| routes.iter().map(|route| route.sink.clone()).collect())
                .unwrap_or_default()
        };
        if sinks.is_empty() {
            debug!(event = "route_drop", kind = %raw.kind, reason = "no_subscriber");
            return RouteOutcome::NoSubscriber;
        }

        let mut delivered = 0;
        let last = sinks.len() - 1;
        let mut raw = Some(raw);
        for (idx, sink) in sinks.iter().enumerate() {
            let event = if idx == last { raw.take() } else { raw.clone() };
            let Some(event) = event else {
                break;
            };
            if sink.send(FleetInput::Event(event)).await.is_ok() {
                delivered += 1;
            }
        }
        if delivered == 0 {
            RouteOutcome::Closed
        } else {
            RouteOutcome::Delivered(delivered)
        }
    }

    pub fn is_subscribed(&self, kind: &str) -> bool {
        lock(&self.routes)
            .by_kind
            .get(kind)
            .map(|routes| !routes.is_empty())
            .unwrap_or(false)
    }

    pub fn subscribed_kinds(&self) -> Vec<String> {
        let routes = lock(&self.routes);
        let mut kinds: Vec<String> = routes
            .by_kind
            .iter()
            .filter(|(_, routes)| !routes.is_empty())
            .map(|(kind, _)| kind.clone())
            .collect();
        kinds.sort();
        kinds
    }
}

/// Live registration on an [`EventRouter`]; dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    kinds: Vec<String>,
    routes: Weak<Mutex<Routes>>,
}

impl Subscription {
    pub fn kinds(&self) -> &[String] {
        &self.kinds
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(routes) = self.routes.upgrade() else {
            return;
        };
        let mut routes = lock(&routes);
        for kind in &self.kinds {
            if let Some(list) = routes.by_kind.get_mut(kind) {
                list.retain(|route| route.id != self.id);
                if list.is_empty() {
                    routes.by_kind.remove(kind);
                }
            }
        }
        debug!(event = "router_unsubscribe", subscription = self.id);
    }
}

fn lock(routes: &Mutex<Routes>) -> MutexGuard<'_, Routes> {
    routes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(kind: &str) -> RawEvent {
        RawEvent::new(kind, json!({"sid": "a"}))
    }

    #[tokio::test]
    async fn routes_only_subscribed_kinds() {
        let router = EventRouter::new();
        let (tx, mut rx) = mpsc::channel(8);
        let _subscription = router.subscribe(&["camera:connected"], tx);

        assert_eq!(router.route(raw("camera:connected")).await, RouteOutcome::Delivered(1));
        assert_eq!(router.route(raw("camera:disconnect")).await, RouteOutcome::NoSubscriber);

        match rx.recv().await {
            Some(FleetInput::Event(event)) => assert_eq!(event.kind, "camera:connected"),
            _ => panic!("expected routed event"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropping_subscription_unsubscribes() {
        let router = EventRouter::new();
        let (tx, _rx) = mpsc::channel(8);
        let subscription = router.subscribe(&["camera:connected", "deploy:success"], tx);
        assert_eq!(
            router.subscribed_kinds(),
            vec!["camera:connected".to_string(), "deploy:success".to_string()]
        );
        assert_eq!(subscription.kinds().len(), 2);

        drop(subscription);
        assert!(!router.is_subscribed("camera:connected"));
        assert_eq!(router.route(raw("deploy:success")).await, RouteOutcome::NoSubscriber);
    }

    #[tokio::test]
    async fn fans_out_to_every_subscriber() {
        let router = EventRouter::new();
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        let _a = router.subscribe(&["detection:result"], tx_a);
        let _b = router.subscribe(&["detection:result"], tx_b);

        assert_eq!(router.route(raw("detection:result")).await, RouteOutcome::Delivered(2));
        assert!(matches!(rx_a.recv().await, Some(FleetInput::Event(_))));
        assert!(matches!(rx_b.recv().await, Some(FleetInput::Event(_))));
    }

    #[tokio::test]
    async fn closed_queue_reports_closed() {
        let router = EventRouter::new();
        let (tx, rx) = mpsc::channel(8);
        let _subscription = router.subscribe(&["camera:list"], tx);
        drop(rx);
        assert_eq!(router.route(raw("camera:list")).await, RouteOutcome::Closed);
    }
}
