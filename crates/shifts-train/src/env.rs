//! Process environment for collective-communication backends

/// Variables exported before any component is built
pub const TRAINING_ENV: [(&str, &str); 3] = [
    ("NCCL_DEBUG", "INFO"),
    ("NCCL_ASYNC_ERROR_HANDLING", "1"),
    ("NCCL_P2P_DISABLE", "1"),
];

/// Export [`TRAINING_ENV`], overwriting existing values
pub fn setup_env_vars() {
    for (key, value) in TRAINING_ENV {
        std::env::set_var(key, value);
        tracing::debug!("{}={}", key, value);
    }
}
