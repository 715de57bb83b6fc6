//! 日志配置命令

use crate::logging::LogConfig;
use crate::AppState;

pub fn get_log_config(state: &AppState) -> LogConfig {
    LogConfig::load(&state.config_dir)
}

/// 修改日志配置，下次启动生效
pub fn set_log_config(
    state: &AppState,
    enabled: Option<bool>,
    max_size_mb: Option<u32>,
    level: Option<&str>,
) -> Result<LogConfig, String> {
    let mut config = LogConfig::load(&state.config_dir);
    config.apply(enabled, max_size_mb, level)?;
    config.save(&state.config_dir).map_err(|e| e.to_string())?;
    Ok(config)
}
