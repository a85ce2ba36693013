use crate::config::{ServeArgs, ServerConfig};
use crate::error::ServerError;

/// Resolve the effective routing settings and verify the logs folder.
pub fn run(args: ServeArgs) -> Result<(), ServerError> {
    let config = ServerConfig::load(&args.config)?;
    let host = config.host.host_paths()?;
    let routing = config.logger.resolve(&host);

    let filters: Vec<String> = routing.filters().iter().map(ToString::to_string).collect();
    tracing::info!(
        client = %routing.client_id,
        folder = %routing.logs_folder.display(),
        filters = ?filters,
        describe = routing.self_describe,
        durability = ?routing.durability,
        "resolved logger config"
    );

    routing.verify_logs_folder()?;
    tracing::info!("config ok");
    Ok(())
}
