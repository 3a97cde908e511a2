use std::{sync::Arc, time::Duration};

use governor::{clock::QuantaInstant, middleware::NoOpMiddleware};
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::PeerIpKeyExtractor, GovernorLayer,
};

/// Create the rate-limiting layer for node registrations.
///
/// This spawns a background thread to clean up the rate limiting cache.
pub fn create() -> GovernorLayer<PeerIpKeyExtractor, NoOpMiddleware<QuantaInstant>> {
    // Configure rate limiting:
    // * allow bursts with up to two registrations per IP address
    // * replenish one element every four seconds
    let governor_conf = GovernorConfigBuilder::default()
        .per_second(4)
        .burst_size(2)
        .finish()
        .expect("failed to build rate-limiting governor");
    let governor_conf = Arc::new(governor_conf);

    // The governor needs a background task for garbage collection (to clear expired records)
    let gc_interval = Duration::from_secs(60);
    let governor_limiter = governor_conf.limiter().clone();
    std::thread::spawn(move || loop {
        std::thread::sleep(gc_interval);
        tracing::debug!("rate limiting storage size: {}", governor_limiter.len());
        governor_limiter.retain_recent();
    });

    GovernorLayer {
        config: governor_conf,
    }
}
