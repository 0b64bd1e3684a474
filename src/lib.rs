//! Real-time notification reconciliation for the LegalPro client platform.
//!
//! A [`notification::NotificationReconciler`] owns the signed-in user's
//! notification list and unread counter, applying local commands
//! optimistically and push events from the backend as they arrive. The HTTP
//! surface in [`routes`] exposes snapshots and commands to the browser app.

pub mod auth;
pub mod error;
pub mod middleware;
pub mod notification;
pub mod routes;
pub mod session;
pub mod state;
