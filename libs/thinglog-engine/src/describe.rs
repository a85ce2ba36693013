use thinglog_api::ServiceDescription;

use crate::config::RoutingConfig;

pub const SERVICE_DEVICE_TYPE: &str = "service";

/// Publisher-scoped id of the recorder, `urn:<zone>:hub:<client_id>:service`.
pub fn service_id(zone: &str, client_id: &str) -> String {
    format!("urn:{zone}:hub:{client_id}:{SERVICE_DEVICE_TYPE}")
}

/// Description announced on the bus when self-description is enabled.
pub fn describe_service(routing: &RoutingConfig) -> ServiceDescription {
    ServiceDescription::new(
        service_id(&routing.zone, &routing.client_id),
        SERVICE_DEVICE_TYPE,
        "Simple Hub message logging",
        "This service logs hub messages to file",
    )
    .with_string_property(
        "logsFolder",
        "Logging Folder",
        "Directory where to store the log files",
        routing.logs_folder.display().to_string(),
    )
}
