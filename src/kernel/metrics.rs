use lazy_static::lazy_static;
use prometheus::{
    register_int_counter_with_registry, register_int_gauge_with_registry, Encoder, IntCounter, IntGauge, Registry,
    TextEncoder,
};
use tracing::info;

lazy_static! {
    pub static ref REGISTRY: Registry = {
        info!("Initializing Prometheus registry");
        Registry::new()
    };

    pub static ref RPC_REQUESTS_TOTAL: IntCounter = register_int_counter_with_registry!(
        "nfsgate_rpc_requests_total",
        "Total number of procedure calls handled",
        REGISTRY
    ).expect("register nfsgate_rpc_requests_total");

    pub static ref RPC_ERRORS_TOTAL: IntCounter = register_int_counter_with_registry!(
        "nfsgate_rpc_errors_total",
        "Total number of procedure calls answered with an error status",
        REGISTRY
    ).expect("register nfsgate_rpc_errors_total");

    pub static ref HANDLES_MINTED: IntCounter = register_int_counter_with_registry!(
        "nfsgate_handles_minted_total",
        "File handles created by the handle store",
        REGISTRY
    ).expect("register nfsgate_handles_minted_total");

    pub static ref FD_EVICTIONS: IntCounter = register_int_counter_with_registry!(
        "nfsgate_fd_evictions_total",
        "Descriptors evicted from the FD cache",
        REGISTRY
    ).expect("register nfsgate_fd_evictions_total");

    pub static ref OPEN_DESCRIPTORS: IntGauge = register_int_gauge_with_registry!(
        "nfsgate_open_descriptors",
        "Descriptors currently held by the FD cache",
        REGISTRY
    ).expect("register nfsgate_open_descriptors");
}

pub fn init() {
    info!("Ensuring metrics are initialized");
    lazy_static::initialize(&REGISTRY);
    lazy_static::initialize(&RPC_REQUESTS_TOTAL);
    lazy_static::initialize(&RPC_ERRORS_TOTAL);
    lazy_static::initialize(&HANDLES_MINTED);
    lazy_static::initialize(&FD_EVICTIONS);
    lazy_static::initialize(&OPEN_DESCRIPTORS);
    info!("Metrics initialization complete");
}

/// Current values in the Prometheus text exposition format.
pub fn render() -> Result<String, prometheus::Error> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_exposes_every_series() {
        init();
        HANDLES_MINTED.inc();
        let text = render().expect("render");
        for name in [
            "nfsgate_rpc_requests_total",
            "nfsgate_rpc_errors_total",
            "nfsgate_handles_minted_total",
            "nfsgate_fd_evictions_total",
            "nfsgate_open_descriptors",
        ] {
            assert!(text.contains(name), "missing {}", name);
        }
    }
}
