use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, RequestBuilder, Response};
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use super::{
    notification_gateway::{GatewayError, GatewayResult, NotificationGateway, Subscription},
    notification_models::{NewNotification, Notification},
};

/// How far behind the newest seen row each poll looks again. Rows whose
/// `created_at` was stamped before their commit became visible still show up
/// as long as they commit within this window.
const LATE_COMMIT_WINDOW_SECS: i64 = 30;

/// Gateway backed by a Supabase project through its PostgREST API.
///
/// Live updates are produced by polling for rows at or after the newest
/// backend timestamp seen, minus [`LATE_COMMIT_WINDOW_SECS`], and dropping ids
/// that were already delivered.
#[derive(Clone)]
pub struct SupabaseGateway {
    client: Client,
    table_url: String,
    api_key: String,
    page_size: usize,
    poll_interval: Duration,
}

impl SupabaseGateway {
    pub fn new(
        base_url: &str,
        table: &str,
        api_key: String,
        page_size: usize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            client: Client::new(),
            table_url: format!("{}/rest/v1/{}", base_url.trim_end_matches('/'), table),
            api_key,
            page_size,
            poll_interval,
        }
    }

    fn request(&self, method: reqwest::Method) -> RequestBuilder {
        self.client
            .request(method, &self.table_url)
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }

    /// Newest row for the user according to the backend's own clock.
    async fn fetch_latest(&self, user_id: Uuid) -> GatewayResult<Option<Notification>> {
        let response = self
            .request(reqwest::Method::GET)
            .query(&[
                ("select", "*".to_string()),
                ("user_id", format!("eq.{}", user_id)),
                ("order", "created_at.desc".to_string()),
                ("limit", "1".to_string()),
            ])
            .send()
            .await?;

        let mut rows: Vec<Notification> = check(response).await?.json().await?;
        Ok(rows.pop())
    }

    /// Rows created at or after `since`, oldest first. `None` means everything.
    async fn fetch_window(&self, user_id: Uuid, since: Option<DateTime<Utc>>) -> GatewayResult<Vec<Notification>> {
        let mut query = vec![
            ("select", "*".to_string()),
            ("user_id", format!("eq.{}", user_id)),
        ];
        if let Some(since) = since {
            query.push((
                "created_at",
                format!("gte.{}", since.to_rfc3339_opts(SecondsFormat::Micros, true)),
            ));
        }
        query.push(("order", "created_at.asc".to_string()));

        let response = self.request(reqwest::Method::GET).query(&query).send().await?;

        Ok(check(response).await?.json().await?)
    }
}

/// Position of a polling feed: the newest backend timestamp delivered so far
/// plus the ids already seen inside the re-read window.
#[derive(Debug, Default)]
struct FeedCursor {
    newest: Option<DateTime<Utc>>,
    seen: HashMap<Uuid, DateTime<Utc>>,
}

impl FeedCursor {
    /// Lower bound for the next poll.
    fn since(&self) -> Option<DateTime<Utc>> {
        self.newest
            .map(|newest| newest - chrono::Duration::seconds(LATE_COMMIT_WINDOW_SECS))
    }

    /// Records the row and returns true if it has not been delivered before.
    fn admit(&mut self, notification: &Notification) -> bool {
        if self.seen.contains_key(&notification.id) {
            return false;
        }
        self.seen.insert(notification.id, notification.created_at);
        self.newest = self.newest.max(Some(notification.created_at));
        true
    }

    /// Forgets ids that fell out of the window; the next poll cannot return them.
    fn prune(&mut self) {
        if let Some(since) = self.since() {
            self.seen.retain(|_, created_at| *created_at >= since);
        }
    }
}

async fn check(response: Response) -> GatewayResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(GatewayError::Status {
        status: status.as_u16(),
        body,
    })
}

/// Parses the total out of a PostgREST `Content-Range` header such as `0-24/57` or `*/0`.
pub(crate) fn parse_content_range_total(header: &str) -> Option<u64> {
    header.rsplit_once('/')?.1.trim().parse().ok()
}

#[async_trait]
impl NotificationGateway for SupabaseGateway {
    async fn list_notifications(&self, user_id: Uuid) -> GatewayResult<Vec<Notification>> {
        let response = self
            .request(reqwest::Method::GET)
            .query(&[
                ("select", "*".to_string()),
                ("user_id", format!("eq.{}", user_id)),
                ("order", "created_at.desc".to_string()),
                ("limit", self.page_size.to_string()),
            ])
            .send()
            .await?;

        Ok(check(response).await?.json().await?)
    }

    async fn count_unread(&self, user_id: Uuid) -> GatewayResult<u64> {
        let response = self
            .request(reqwest::Method::HEAD)
            .header("Prefer", "count=exact")
            .query(&[
                ("select", "id".to_string()),
                ("user_id", format!("eq.{}", user_id)),
                ("is_read", "eq.false".to_string()),
            ])
            .send()
            .await?;
        let response = check(response).await?;

        response
            .headers()
            .get("content-range")
            .and_then(|value| value.to_str().ok())
            .and_then(parse_content_range_total)
            .ok_or_else(|| GatewayError::Decode("missing or invalid Content-Range".to_string()))
    }

    async fn mark_read(&self, notification_id: Uuid) -> GatewayResult<()> {
        let response = self
            .request(reqwest::Method::PATCH)
            .query(&[("id", format!("eq.{}", notification_id))])
            .json(&json!({ "is_read": true }))
            .send()
            .await?;

        check(response).await?;
        Ok(())
    }

    async fn mark_all_read(&self, user_id: Uuid) -> GatewayResult<()> {
        let response = self
            .request(reqwest::Method::PATCH)
            .query(&[
                ("user_id", format!("eq.{}", user_id)),
                ("is_read", "eq.false".to_string()),
            ])
            .json(&json!({ "is_read": true }))
            .send()
            .await?;

        check(response).await?;
        Ok(())
    }

    async fn delete(&self, notification_id: Uuid) -> GatewayResult<()> {
        let response = self
            .request(reqwest::Method::DELETE)
            .query(&[("id", format!("eq.{}", notification_id))])
            .send()
            .await?;

        check(response).await?;
        Ok(())
    }

    async fn create(&self, notification: NewNotification) -> GatewayResult<Notification> {
        let response = self
            .request(reqwest::Method::POST)
            .header("Prefer", "return=representation")
            .json(&notification)
            .send()
            .await?;

        let mut rows: Vec<Notification> = check(response).await?.json().await?;
        rows.pop()
            .ok_or_else(|| GatewayError::Decode("insert returned no rows".to_string()))
    }

    async fn subscribe(&self, user_id: Uuid) -> GatewayResult<Subscription> {
        // Fails fast if the table is unreachable so the caller can run degraded.
        // Everything already stored is covered by the full load, so it only
        // seeds the cursor.
        let mut cursor = FeedCursor::default();
        if let Some(latest) = self.fetch_latest(user_id).await? {
            cursor.admit(&latest);
            for existing in self.fetch_window(user_id, cursor.since()).await? {
                cursor.admit(&existing);
            }
        }

        let (tx, subscription) = Subscription::channel();
        let gateway = self.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(gateway.poll_interval);

            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    _ = interval.tick() => {}
                }

                match gateway.fetch_window(user_id, cursor.since()).await {
                    Ok(rows) => {
                        for notification in rows {
                            if !cursor.admit(&notification) {
                                continue;
                            }
                            if tx.send(notification).await.is_err() {
                                tracing::debug!(%user_id, "Subscriber gone, stopping poller");
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(%user_id, error = %e, "Polling for new notifications failed");
                    }
                }
                cursor.prune();
            }
            tracing::debug!(%user_id, "Supabase subscription closed");
        });

        Ok(subscription)
    }
}
