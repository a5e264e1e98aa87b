//! Configuration namespace (spec.md §6.4): flat key-value settings grouped
//! into `network`/`security`/`chat`/`retry`/`performance`/`image`/`timeout`/
//! `app` namespaces, loaded from a layered YAML settings file the way the
//! teacher's `RuntimeSettings` loader does (system defaults merged under
//! user overrides), plus a small TOML-backed model-table loader mirroring
//! the original's `core/config.py` static config store.

mod models_file;
mod settings;

pub use models_file::load_model_table_file;
pub use settings::{
    AppSettings, ChatSettings, GatewaySettings, ImageSettings, NetworkSettings,
    PerformanceSettings, RetrySettings, SecuritySettings, TimeoutSettings, load_gateway_settings,
    load_gateway_settings_from_paths, set_config_home_override,
};
