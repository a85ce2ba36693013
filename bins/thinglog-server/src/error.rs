#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("config ({context}): {detail}")]
    Config { context: &'static str, detail: String },

    #[error("{0}")]
    Router(#[from] thinglog_engine::RouterError),

    #[error("{0}")]
    Bus(#[from] thinglog_bus::BusError),

    #[error("signal: {0}")]
    Signal(#[from] std::io::Error),
}
