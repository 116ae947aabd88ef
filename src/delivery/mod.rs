mod receivers;
mod secure_delivery;
pub mod session;

pub use secure_delivery::{reasons, DeliveryConfig, DeliveryScheduler, SecureDelivery, TimerKind};
