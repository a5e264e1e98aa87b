//! Layered gateway settings loader.
//!
//! Loads and merges:
//! - System defaults: `<PRJ_ROOT>/packages/conf/settings.yaml`
//! - User overrides:  `<PRJ_CONFIG_HOME>/grok-gateway/settings.yaml`
//!
//! Merge precedence is user over system, field-by-field (`Option::or`),
//! mirroring the teacher's layered `RuntimeSettings` loader but over the
//! namespace set named in spec.md §6.4 instead of channel/session config.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use serde::Deserialize;

const DEFAULT_SYSTEM_SETTINGS_RELATIVE_PATH: &str = "packages/conf/settings.yaml";
const DEFAULT_USER_SETTINGS_RELATIVE_PATH: &str = "grok-gateway/settings.yaml";
const DEFAULT_CONFIG_HOME_RELATIVE_PATH: &str = ".config";
static CONFIG_HOME_OVERRIDE: OnceLock<PathBuf> = OnceLock::new();

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewaySettings {
    #[serde(default)]
    pub network: NetworkSettings,
    #[serde(default)]
    pub security: SecuritySettings,
    #[serde(default)]
    pub chat: ChatSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub performance: PerformanceSettings,
    #[serde(default)]
    pub image: ImageSettings,
    #[serde(default)]
    pub timeout: TimeoutSettings,
    #[serde(default)]
    pub app: AppSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkSettings {
    pub timeout_secs: Option<u64>,
    pub connect_timeout_secs: Option<u64>,
    pub base_proxy_url: Option<String>,
    pub asset_proxy_url: Option<String>,
    /// Account-management host (`SetTosAcceptedVersion` lives here, not on
    /// the chat host).
    pub accounts_proxy_url: Option<String>,
    /// Outbound proxy pool (supplemented feature §B.3); empty = direct.
    pub proxies: Option<Vec<String>>,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            timeout_secs: None,
            connect_timeout_secs: None,
            base_proxy_url: None,
            asset_proxy_url: None,
            accounts_proxy_url: None,
            proxies: None,
        }
    }
}

impl NetworkSettings {
    pub fn timeout_secs(&self) -> u64 {
        self.timeout_secs.unwrap_or(60)
    }

    pub fn connect_timeout_secs(&self) -> u64 {
        self.connect_timeout_secs.unwrap_or(10)
    }

    pub fn base_proxy_url(&self) -> String {
        self.base_proxy_url
            .clone()
            .unwrap_or_else(|| "https://grok.com".to_string())
    }

    pub fn asset_proxy_url(&self) -> String {
        self.asset_proxy_url
            .clone()
            .unwrap_or_else(|| "https://assets.grok.com".to_string())
    }

    pub fn accounts_proxy_url(&self) -> String {
        self.accounts_proxy_url
            .clone()
            .unwrap_or_else(|| "https://accounts.x.ai".to_string())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SecuritySettings {
    pub browser: Option<String>,
    pub chrome_major_version: Option<u32>,
    pub platform: Option<String>,
    pub user_agent: Option<String>,
    pub cf_clearance: Option<String>,
    pub sentry_baggage: Option<String>,
    pub app_url: Option<String>,
}

impl SecuritySettings {
    pub fn chrome_major_version(&self) -> u32 {
        self.chrome_major_version.unwrap_or(129)
    }

    pub fn platform(&self) -> String {
        self.platform.clone().unwrap_or_else(|| "Windows".to_string())
    }

    pub fn user_agent(&self) -> String {
        self.user_agent.clone().unwrap_or_else(|| {
            format!(
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/{}.0.0.0 Safari/537.36",
                self.chrome_major_version()
            )
        })
    }

    pub fn app_url(&self) -> String {
        self.app_url.clone().unwrap_or_else(|| "https://grok.com".to_string())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatSettings {
    pub stream: Option<bool>,
    pub thinking: Option<bool>,
    pub dynamic_statsig: Option<bool>,
    pub filter_tags: Option<Vec<String>>,
}

impl ChatSettings {
    pub fn dynamic_statsig(&self) -> bool {
        self.dynamic_statsig.unwrap_or(false)
    }

    pub fn show_thinking(&self) -> bool {
        self.thinking.unwrap_or(false)
    }

    pub fn filter_tags(&self) -> std::collections::HashSet<String> {
        match &self.filter_tags {
            Some(tags) => tags.iter().cloned().collect(),
            None => crate::stream::filter::default_filtered_tags(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RetrySettings {
    pub max_retry: Option<u32>,
    pub retry_status_codes: Option<Vec<u16>>,
    pub backoff_base: Option<f64>,
    pub backoff_factor: Option<f64>,
    pub backoff_max: Option<f64>,
    pub retry_budget: Option<f64>,
}

impl RetrySettings {
    pub fn to_retry_config(&self) -> crate::retry::RetryConfig {
        let default = crate::retry::RetryConfig::default();
        crate::retry::RetryConfig {
            max_retry: self.max_retry.unwrap_or(default.max_retry),
            retryable_status: self
                .retry_status_codes
                .as_ref()
                .map(|codes| codes.iter().copied().collect())
                .unwrap_or(default.retryable_status),
            backoff_base: self.backoff_base.unwrap_or(default.backoff_base),
            backoff_factor: self.backoff_factor.unwrap_or(default.backoff_factor),
            backoff_max: self.backoff_max.unwrap_or(default.backoff_max),
            retry_budget: self.retry_budget.unwrap_or(default.retry_budget),
        }
    }
}

/// `*_max_concurrent` / `*_batch_size` / `*_max_tokens` knobs per spec.md
/// §6.4 performance namespace; one field pair per bounded-concurrency
/// collaborator (C6 batch workers, C4 per-endpoint semaphores).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PerformanceSettings {
    pub rate_limits_max_concurrent: Option<usize>,
    pub nsfw_enable_max_concurrent: Option<usize>,
    pub asset_download_max_concurrent: Option<usize>,
    pub batch_max_concurrent: Option<usize>,
    pub batch_batch_size: Option<usize>,
    pub batch_max_tokens: Option<usize>,
    pub max_token_retries: Option<u32>,
}

impl PerformanceSettings {
    pub fn rate_limits_max_concurrent(&self) -> usize {
        self.rate_limits_max_concurrent.unwrap_or(25)
    }

    pub fn nsfw_enable_max_concurrent(&self) -> usize {
        self.nsfw_enable_max_concurrent.unwrap_or(10)
    }

    pub fn asset_download_max_concurrent(&self) -> usize {
        self.asset_download_max_concurrent.unwrap_or(10)
    }

    pub fn batch_max_concurrent(&self) -> usize {
        self.batch_max_concurrent.unwrap_or(10)
    }

    pub fn batch_batch_size(&self) -> usize {
        self.batch_batch_size.unwrap_or(50)
    }

    pub fn batch_max_tokens(&self) -> usize {
        self.batch_max_tokens.unwrap_or(1000)
    }

    pub fn max_token_retries(&self) -> u32 {
        self.max_token_retries.unwrap_or(3)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageSettings {
    pub timeout_secs: Option<u64>,
    pub stream_timeout_secs: Option<u64>,
    pub final_timeout_secs: Option<u64>,
    pub final_min_bytes: Option<usize>,
    pub medium_min_bytes: Option<usize>,
    pub cache_max_size_mb: Option<u64>,
    pub video_cache_max_size_mb: Option<u64>,
}

impl ImageSettings {
    pub fn final_timeout_secs(&self) -> u64 {
        self.final_timeout_secs.unwrap_or(20)
    }

    pub fn final_min_bytes(&self) -> usize {
        self.final_min_bytes.unwrap_or(200_000)
    }

    pub fn medium_min_bytes(&self) -> usize {
        self.medium_min_bytes.unwrap_or(20_000)
    }

    pub fn cache_max_size_mb(&self) -> u64 {
        self.cache_max_size_mb.unwrap_or(512)
    }

    pub fn video_cache_max_size_mb(&self) -> u64 {
        self.video_cache_max_size_mb.unwrap_or(2048)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TimeoutSettings {
    pub stream_idle_timeout_secs: Option<u64>,
    pub video_idle_timeout_secs: Option<u64>,
}

impl TimeoutSettings {
    pub fn stream_idle_timeout_secs(&self) -> u64 {
        self.stream_idle_timeout_secs.unwrap_or(crate::stream::CHAT_IDLE_TIMEOUT_SECS)
    }

    pub fn video_idle_timeout_secs(&self) -> u64 {
        self.video_idle_timeout_secs.unwrap_or(crate::stream::VIDEO_IDLE_TIMEOUT_SECS)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppSettings {
    pub app_url: Option<String>,
    pub image_format: Option<String>,
    pub video_format: Option<String>,
    pub data_dir: Option<String>,
    pub app_key: Option<String>,
    pub max_tokens: Option<u32>,
}

impl AppSettings {
    pub fn image_format(&self) -> &str {
        self.image_format.as_deref().unwrap_or("url")
    }

    pub fn video_format(&self) -> &str {
        self.video_format.as_deref().unwrap_or("url")
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(self.data_dir.as_deref().unwrap_or("data"))
    }

    pub fn max_tokens(&self) -> u32 {
        self.max_tokens.unwrap_or(1000)
    }
}

impl GatewaySettings {
    fn merge(self, overlay: Self) -> Self {
        Self {
            network: self.network.merge(overlay.network),
            security: self.security.merge(overlay.security),
            chat: self.chat.merge(overlay.chat),
            retry: self.retry.merge(overlay.retry),
            performance: self.performance.merge(overlay.performance),
            image: self.image.merge(overlay.image),
            timeout: self.timeout.merge(overlay.timeout),
            app: self.app.merge(overlay.app),
        }
    }
}

impl NetworkSettings {
    fn merge(self, overlay: Self) -> Self {
        Self {
            timeout_secs: overlay.timeout_secs.or(self.timeout_secs),
            connect_timeout_secs: overlay.connect_timeout_secs.or(self.connect_timeout_secs),
            base_proxy_url: overlay.base_proxy_url.or(self.base_proxy_url),
            asset_proxy_url: overlay.asset_proxy_url.or(self.asset_proxy_url),
            accounts_proxy_url: overlay.accounts_proxy_url.or(self.accounts_proxy_url),
            proxies: overlay.proxies.or(self.proxies),
        }
    }
}

impl SecuritySettings {
    fn merge(self, overlay: Self) -> Self {
        Self {
            browser: overlay.browser.or(self.browser),
            chrome_major_version: overlay.chrome_major_version.or(self.chrome_major_version),
            platform: overlay.platform.or(self.platform),
            user_agent: overlay.user_agent.or(self.user_agent),
            cf_clearance: overlay.cf_clearance.or(self.cf_clearance),
            sentry_baggage: overlay.sentry_baggage.or(self.sentry_baggage),
            app_url: overlay.app_url.or(self.app_url),
        }
    }
}

impl ChatSettings {
    fn merge(self, overlay: Self) -> Self {
        Self {
            stream: overlay.stream.or(self.stream),
            thinking: overlay.thinking.or(self.thinking),
            dynamic_statsig: overlay.dynamic_statsig.or(self.dynamic_statsig),
            filter_tags: overlay.filter_tags.or(self.filter_tags),
        }
    }
}

impl RetrySettings {
    fn merge(self, overlay: Self) -> Self {
        Self {
            max_retry: overlay.max_retry.or(self.max_retry),
            retry_status_codes: overlay.retry_status_codes.or(self.retry_status_codes),
            backoff_base: overlay.backoff_base.or(self.backoff_base),
            backoff_factor: overlay.backoff_factor.or(self.backoff_factor),
            backoff_max: overlay.backoff_max.or(self.backoff_max),
            retry_budget: overlay.retry_budget.or(self.retry_budget),
        }
    }
}

impl PerformanceSettings {
    fn merge(self, overlay: Self) -> Self {
        Self {
            rate_limits_max_concurrent: overlay
                .rate_limits_max_concurrent
                .or(self.rate_limits_max_concurrent),
            nsfw_enable_max_concurrent: overlay
                .nsfw_enable_max_concurrent
                .or(self.nsfw_enable_max_concurrent),
            asset_download_max_concurrent: overlay
                .asset_download_max_concurrent
                .or(self.asset_download_max_concurrent),
            batch_max_concurrent: overlay.batch_max_concurrent.or(self.batch_max_concurrent),
            batch_batch_size: overlay.batch_batch_size.or(self.batch_batch_size),
            batch_max_tokens: overlay.batch_max_tokens.or(self.batch_max_tokens),
            max_token_retries: overlay.max_token_retries.or(self.max_token_retries),
        }
    }
}

impl ImageSettings {
    fn merge(self, overlay: Self) -> Self {
        Self {
            timeout_secs: overlay.timeout_secs.or(self.timeout_secs),
            stream_timeout_secs: overlay.stream_timeout_secs.or(self.stream_timeout_secs),
            final_timeout_secs: overlay.final_timeout_secs.or(self.final_timeout_secs),
            final_min_bytes: overlay.final_min_bytes.or(self.final_min_bytes),
            medium_min_bytes: overlay.medium_min_bytes.or(self.medium_min_bytes),
            cache_max_size_mb: overlay.cache_max_size_mb.or(self.cache_max_size_mb),
            video_cache_max_size_mb: overlay
                .video_cache_max_size_mb
                .or(self.video_cache_max_size_mb),
        }
    }
}

impl TimeoutSettings {
    fn merge(self, overlay: Self) -> Self {
        Self {
            stream_idle_timeout_secs: overlay
                .stream_idle_timeout_secs
                .or(self.stream_idle_timeout_secs),
            video_idle_timeout_secs: overlay
                .video_idle_timeout_secs
                .or(self.video_idle_timeout_secs),
        }
    }
}

impl AppSettings {
    fn merge(self, overlay: Self) -> Self {
        Self {
            app_url: overlay.app_url.or(self.app_url),
            image_format: overlay.image_format.or(self.image_format),
            video_format: overlay.video_format.or(self.video_format),
            data_dir: overlay.data_dir.or(self.data_dir),
            app_key: overlay.app_key.or(self.app_key),
            max_tokens: overlay.max_tokens.or(self.max_tokens),
        }
    }
}

/// Load merged gateway settings (user overrides system).
pub fn load_gateway_settings() -> GatewaySettings {
    let (system_path, user_path) = gateway_settings_paths();
    load_gateway_settings_from_paths(&system_path, &user_path)
}

fn gateway_settings_paths() -> (PathBuf, PathBuf) {
    let root = project_root();
    let system_path = root.join(DEFAULT_SYSTEM_SETTINGS_RELATIVE_PATH);
    let user_path = resolve_config_home(&root).join(DEFAULT_USER_SETTINGS_RELATIVE_PATH);
    (system_path, user_path)
}

#[doc(hidden)]
pub fn load_gateway_settings_from_paths(system: &Path, user: &Path) -> GatewaySettings {
    load_one(system).merge(load_one(user))
}

fn load_one(path: &Path) -> GatewaySettings {
    if !path.exists() {
        return GatewaySettings::default();
    }
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(error) => {
            tracing::warn!(
                path = %path.display(),
                error = %error,
                "failed to read settings file; ignoring"
            );
            return GatewaySettings::default();
        }
    };
    match serde_yaml::from_str::<GatewaySettings>(&raw) {
        Ok(value) => value,
        Err(error) => {
            tracing::warn!(
                path = %path.display(),
                error = %error,
                "failed to parse settings yaml; ignoring file"
            );
            GatewaySettings::default()
        }
    }
}

fn project_root() -> PathBuf {
    std::env::var("PRJ_ROOT")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
}

/// Set config-home override (used by CLI `--conf`).
///
/// The path can be absolute, or relative to `PRJ_ROOT`/cwd.
pub fn set_config_home_override(path: impl Into<PathBuf>) {
    let path = path.into();
    if path.as_os_str().is_empty() {
        return;
    }
    if CONFIG_HOME_OVERRIDE.set(path.clone()).is_err()
        && let Some(current) = CONFIG_HOME_OVERRIDE.get()
        && current != &path
    {
        tracing::warn!(
            current = %current.display(),
            ignored = %path.display(),
            "config home override already set; ignoring subsequent value"
        );
    }
}

fn resolve_config_home(project_root: &Path) -> PathBuf {
    if let Some(path) = CONFIG_HOME_OVERRIDE.get() {
        return absolutize(project_root, path.clone());
    }

    let configured = std::env::var("PRJ_CONFIG_HOME")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_CONFIG_HOME_RELATIVE_PATH.to_string());
    absolutize(project_root, PathBuf::from(configured))
}

fn absolutize(project_root: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        project_root.join(path)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn user_overrides_take_precedence_over_system() {
        let dir = tempfile::tempdir().unwrap();
        let system_path = dir.path().join("system.yaml");
        let user_path = dir.path().join("user.yaml");
        std::fs::write(
            &system_path,
            "network:\n  base_proxy_url: https://system.example\nretry:\n  max_retry: 5\n",
        )
        .unwrap();
        std::fs::write(&user_path, "network:\n  base_proxy_url: https://user.example\n").unwrap();

        let merged = load_gateway_settings_from_paths(&system_path, &user_path);
        assert_eq!(merged.network.base_proxy_url(), "https://user.example");
        assert_eq!(merged.retry.max_retry, Some(5));
    }

    #[test]
    fn missing_files_yield_defaults() {
        let merged = load_gateway_settings_from_paths(Path::new("/nonexistent/a.yaml"), Path::new("/nonexistent/b.yaml"));
        assert_eq!(merged.network.base_proxy_url(), "https://grok.com");
        assert_eq!(merged.performance.rate_limits_max_concurrent(), 25);
    }
}
