use serde::Deserialize;
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use super::notification_models::{NewNotification, NotificationType};

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct CreateNotificationRequest {
    #[serde(rename = "type")]
    pub kind: NotificationType,
    #[validate(length(min = 1, max = 200))]
    pub title: String,
    #[validate(length(min = 1, max = 2000))]
    pub message: String,
    #[validate(length(min = 1, max = 2048))]
    pub action_url: Option<String>,
}

impl CreateNotificationRequest {
    pub fn into_new(self, user_id: Uuid) -> NewNotification {
        NewNotification {
            user_id,
            kind: self.kind,
            title: self.title,
            message: self.message,
            action_url: self.action_url,
        }
    }
}
