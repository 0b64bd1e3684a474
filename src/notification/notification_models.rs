use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Category of a notification. Only used to pick an icon on the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    OrderCompleted,
    CoursePurchased,
    CertificateIssued,
    ServicePurchased,
    AppointmentScheduled,
    AppointmentReminder,
    LessonCompleted,
    Welcome,
}

impl std::fmt::Display for NotificationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationType::OrderCompleted => write!(f, "order_completed"),
            NotificationType::CoursePurchased => write!(f, "course_purchased"),
            NotificationType::CertificateIssued => write!(f, "certificate_issued"),
            NotificationType::ServicePurchased => write!(f, "service_purchased"),
            NotificationType::AppointmentScheduled => write!(f, "appointment_scheduled"),
            NotificationType::AppointmentReminder => write!(f, "appointment_reminder"),
            NotificationType::LessonCompleted => write!(f, "lesson_completed"),
            NotificationType::Welcome => write!(f, "welcome"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub title: String,
    pub message: String,
    pub action_url: Option<String>,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

/// A notification that has not been persisted yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewNotification {
    pub user_id: Uuid,
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub title: String,
    pub message: String,
    pub action_url: Option<String>,
}
