//! Command-line overrides on top of the loaded `pushok_config::Config`.

use std::path::PathBuf;

use pushok_config::Config;

use crate::cli::{GlobalOpts, RegisterArgs, RunArgs};
use crate::error::CliError;

/// `--config`, else the platform default.
pub fn resolve_path(global: &GlobalOpts) -> PathBuf {
    global
        .config
        .clone()
        .unwrap_or_else(pushok_config::config_path)
}

pub fn load(global: &GlobalOpts) -> Result<Config, CliError> {
    let path = resolve_path(global);
    pushok_config::load_config(&path).map_err(|e| CliError::from_config(e, &path))
}

/// Flags win over file and environment values.
pub fn apply_run_overrides(cfg: &mut Config, args: &RunArgs) {
    if let Some(host) = &args.hub_host {
        cfg.hub.host.clone_from(host);
    }
    if let Some(port) = args.hub_port {
        cfg.hub.port = port;
    }
    if let Some(host) = &args.mqtt_host {
        cfg.mqtt.host.clone_from(host);
    }
    if let Some(port) = args.mqtt_port {
        cfg.mqtt.port = port;
    }
    if let Some(topic) = &args.base_topic {
        cfg.mqtt.base_topic.clone_from(topic);
    }
}

/// Registration target: flags, then `[hub]`.
pub fn register_target(cfg: &Config, args: &RegisterArgs) -> (String, u16, bool) {
    (
        args.host.clone().unwrap_or_else(|| cfg.hub.host.clone()),
        args.port.unwrap_or(cfg.hub.port),
        args.ssl || cfg.hub.use_ssl,
    )
}
