//! Core domain types for subscription digests.

pub mod ids;
pub mod lease;
pub mod subscription;

pub use ids::{
    AuthToken, BindingId, FilterId, LeaseHolder, ResourceName, SubscriberId, SubscriptionId,
};
pub use lease::Lease;
pub use subscription::{
    Binding, Checkpoint, DeliveryMethod, Filter, Frequency, Predicate, Subscription, Trigger,
    decode_iso, encode_iso,
};
