use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::notification::{
    DynNotificationGateway, FailurePolicy, InMemoryGateway, NotificationReconciler,
    SupabaseGateway,
};
use crate::session::SessionBinding;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub gateway: DynNotificationGateway,
    pub reconciler: NotificationReconciler,
    pub session: SessionBinding,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let gateway: DynNotificationGateway = match &config.gateway {
            GatewaySettings::Supabase { url, service_key } => Arc::new(SupabaseGateway::new(
                url,
                &config.notifications_table,
                service_key.clone(),
                config.page_size,
                config.poll_interval,
            )),
            GatewaySettings::Memory => Arc::new(InMemoryGateway::new(config.page_size)),
        };

        Self::with_gateway(config, gateway)
    }

    pub fn with_gateway(config: Config, gateway: DynNotificationGateway) -> Self {
        let reconciler = NotificationReconciler::new(gateway.clone(), config.failure_policy);

        Self {
            config: Arc::new(config),
            gateway,
            reconciler,
            session: SessionBinding::new(),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Clone, Debug)]
pub enum GatewaySettings {
    Supabase { url: String, service_key: String },
    Memory,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub jwt_secret: String,
    pub gateway: GatewaySettings,
    pub notifications_table: String,
    pub page_size: usize,
    pub poll_interval: Duration,
    pub failure_policy: FailurePolicy,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &'static str| lookup(key).ok_or(ConfigError::Missing(key));

        let gateway = match lookup("NOTIFICATION_GATEWAY")
            .unwrap_or_else(|| "supabase".to_string())
            .as_str()
        {
            "supabase" => GatewaySettings::Supabase {
                url: required("SUPABASE_URL")?,
                service_key: required("SUPABASE_SERVICE_KEY")?,
            },
            "memory" => GatewaySettings::Memory,
            other => {
                return Err(ConfigError::Invalid {
                    name: "NOTIFICATION_GATEWAY",
                    reason: format!("expected 'supabase' or 'memory', got '{}'", other),
                })
            }
        };

        Ok(Self {
            host: lookup("HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            port: parse_or(&lookup, "PORT", 3000)?,
            jwt_secret: required("SUPABASE_JWT_SECRET")?,
            gateway,
            notifications_table: lookup("NOTIFICATIONS_TABLE")
                .unwrap_or_else(|| "notifications".to_string()),
            page_size: parse_or(&lookup, "NOTIFICATIONS_PAGE_SIZE", 50)?,
            poll_interval: Duration::from_secs(parse_or(&lookup, "NOTIFICATIONS_POLL_SECS", 10)?),
            failure_policy: parse_or(&lookup, "NOTIFICATIONS_FAILURE_POLICY", FailurePolicy::Diverge)?,
        })
    }
}

fn parse_or<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}
