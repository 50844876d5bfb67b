use async_trait::async_trait;

/// A single liveness check against some backend.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// `Err` carries a human-readable reason.
    async fn probe(&self) -> Result<(), String>;

    fn target(&self) -> String {
        "upstream".to_string()
    }
}
