use thinglog_api::ApiError;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("connection '{0}' is closed")]
    Disconnected(String),

    #[error("subscription {0} not found")]
    UnknownSubscription(u64),

    #[error("bind {addr}: {source}")]
    Bind { addr: String, source: std::io::Error },

    #[error("description: {0}")]
    Description(#[from] serde_json::Error),
}

impl BusError {
    /// Convert to ApiError preserving the failure category.
    ///
    /// `Disconnected` and `Bind` → Io, `UnknownSubscription` → Logic,
    /// `Description` → Format.
    pub fn into_api_error(self) -> ApiError {
        match self {
            BusError::Disconnected(_) | BusError::Bind { .. } => ApiError::io(self.to_string()),
            BusError::UnknownSubscription(_) => ApiError::new(self.to_string()),
            BusError::Description(e) => ApiError::from(e),
        }
    }
}
