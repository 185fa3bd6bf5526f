use std::path::PathBuf;

use windlass_core::{InferenceConfig, RuntimeKind, Scheduler};

/// Configuration pointed at the freshly built worker binary, with the
/// deterministic synthetic runtime so no model weights are needed.
pub fn test_config() -> InferenceConfig {
    let mut config = InferenceConfig::new("");
    config.runtime = RuntimeKind::Synthetic;
    config.worker_executable_path = Some(PathBuf::from(env!("CARGO_BIN_EXE_windlass-worker")));
    config.worker_count = 2;
    config
}

pub async fn start(config: InferenceConfig) -> Scheduler {
    Scheduler::start(config)
        .await
        .expect("scheduler should start against the test worker binary")
}
