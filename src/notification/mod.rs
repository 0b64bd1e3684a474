pub mod memory_gateway;
pub mod notification_dto;
pub mod notification_gateway;
pub mod notification_handlers;
pub mod notification_models;
pub mod notification_reconciler;
pub mod notification_store;
pub mod routes;
pub mod supabase_gateway;

#[cfg(test)]
pub mod test_support;

pub use memory_gateway::InMemoryGateway;
pub use notification_gateway::{DynNotificationGateway, GatewayError, NotificationGateway, Subscription};
pub use notification_models::{NewNotification, Notification, NotificationType};
pub use notification_reconciler::{FailurePolicy, NotificationReconciler, NotificationSnapshot, ReconcilerPhase};
pub use notification_store::NotificationStore;
pub use supabase_gateway::SupabaseGateway;
