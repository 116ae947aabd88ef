//! Two deliveries wired through the in-memory transport: handshake with auto-accepting
//!  observers, one data exchange, disconnect.

use std::sync::Arc;
use std::time::Duration;

use securelink::delivery::{DeliveryConfig, SecureDelivery};
use securelink::delivery::session::Stage;
use securelink::receiver::AutoAcceptReceiver;
use securelink::test_util::{in_memory_pair, CollectingReceiver};
use tokio::time::sleep;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let (requester_transport, acceptor_transport) = in_memory_pair();

    let requester = SecureDelivery::new("requester", requester_transport, DeliveryConfig::default_stack());
    let acceptor = SecureDelivery::new("acceptor", acceptor_transport, DeliveryConfig::default_stack());

    requester.register_receiver("auto", Arc::new(AutoAcceptReceiver::new(requester.clone())));
    acceptor.register_receiver("auto", Arc::new(AutoAcceptReceiver::new(acceptor.clone())));

    let requester_events = CollectingReceiver::new();
    let acceptor_events = CollectingReceiver::new();
    requester.register_receiver("collector", requester_events.clone());
    acceptor.register_receiver("collector", acceptor_events.clone());

    requester.connect(b"demo".to_vec());
    wait_for(&requester, Stage::Connected).await?;
    wait_for(&acceptor, Stage::Connected).await?;
    info!("both endpoints connected");

    requester.send(42, b"hello through the secure channel".to_vec())?;
    sleep(Duration::from_millis(200)).await;
    info!("acceptor observed: {:?}", acceptor_events.events());
    info!("requester observed: {:?}", requester_events.events());

    requester.disconnect(b"done".to_vec());
    sleep(Duration::from_millis(200)).await;
    info!("requester is back in stage {:?}", requester.stage());

    Ok(())
}

async fn wait_for(delivery: &SecureDelivery, stage: Stage) -> anyhow::Result<()> {
    for _ in 0..100 {
        if delivery.stage() == stage {
            return Ok(());
        }
        sleep(Duration::from_millis(20)).await;
    }
    anyhow::bail!("endpoint stuck in stage {:?}", delivery.stage())
}
