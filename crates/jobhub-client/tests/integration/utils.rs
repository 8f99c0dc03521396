use std::sync::Arc;
use std::time::Duration;

use jobhub_client::RequestLayer;
use jobhub_client::config::Config;
use jobhub_client::transport::HttpTransport;

pub use jobhub_test::{MockBackend, setup};

pub const AUTH_TOKEN: &str = "secret-token";

/// A config pointing to `backend`, with short deadlines and backoff.
pub fn test_config(backend: &MockBackend) -> Config {
    let mut config = Config {
        base_url: backend.base_url(),
        auth_token: Some(AUTH_TOKEN.to_owned()),
        ..Default::default()
    };
    config.timeouts.fast = Duration::from_millis(200);
    config.timeouts.default = Duration::from_millis(500);
    config.timeouts.slow = Duration::from_secs(1);
    config.retry.base_delay = Duration::from_millis(10);
    config
}

/// Creates a [`RequestLayer`] talking HTTP to `backend`.
pub fn setup_layer<F>(backend: &MockBackend, update_config: F) -> RequestLayer
where
    F: FnOnce(&mut Config),
{
    setup();

    let mut config = test_config(backend);
    update_config(&mut config);

    let transport = HttpTransport::from_config(&config).unwrap();
    RequestLayer::new(config, Arc::new(transport))
}
