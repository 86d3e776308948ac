use super::discord::{run_gateway, EventQueue};
use crate::instances::{ChannelType, InstanceFilter, InstanceRegistry};
use crate::router::Router;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Capacity of the gateway → worker queue before oldest events are shed.
const EVENT_QUEUE_CAPACITY: usize = 1024;

/// Workers draining the Discord event queue into the router.
const WORKER_COUNT: usize = 4;

/// Start the Discord side of the gateway: one bot-gateway connection per
/// active Discord instance, feeding a bounded queue drained by a small
/// worker pool that runs the inbound pipeline.
///
/// Returns the queue handle for backpressure metrics. WhatsApp needs no
/// startup work: its events arrive through the webhook ingress.
pub fn start_discord_channels(
    http: reqwest::Client,
    registry: &InstanceRegistry,
    router: Arc<Router>,
    cancel: &CancellationToken,
) -> Arc<EventQueue> {
    let queue = Arc::new(EventQueue::new(EVENT_QUEUE_CAPACITY));

    let instances = registry.list(&InstanceFilter {
        channel_type: Some(ChannelType::Discord),
        active_only: true,
    });

    for instance in instances {
        tracing::info!(instance = %instance.name, "starting discord gateway");
        tokio::spawn(run_gateway(
            http.clone(),
            instance,
            Arc::clone(&queue),
            cancel.child_token(),
        ));
    }

    for _ in 0..WORKER_COUNT {
        let queue = Arc::clone(&queue);
        let router = Arc::clone(&router);
        let cancel = cancel.child_token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    event = queue.pop() => {
                        let outcome = router
                            .route_inbound(&event.instance_name, &event.envelope)
                            .await;
                        tracing::debug!(
                            instance = %event.instance_name,
                            status = outcome.status(),
                            reason = outcome.reason().unwrap_or("-"),
                            "discord event processed"
                        );
                    }
                }
            }
        });
    }

    queue
}
