#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Metrics for the prime miner.
//!
//! - Provides a global Prometheus registry and the default mining metrics.
//! - Exposes helper functions the service and engines call to update them.
//! - Optionally runs a Warp-based HTTP endpoint (/metrics) when the
//!   `http-exporter` feature is enabled; gated at runtime by the presence of
//!   a metrics port in the CLI.
//!
//! Default metrics:
//! - miner_fermat_tests_total            : candidates submitted to Fermat testing
//! - miner_fermat_primes_total           : candidates that passed the witness
//! - miner_chains_total                  : chain candidates emitted by the locator
//! - miner_chain_length_total{length}    : confirmed chain lengths histogram
//! - miner_shares_total                  : shares that met the difficulty target
//! - miner_range_searched_total          : integers covered by the sieve
//! - miner_worker_unhealthy{worker}      : 1 when a worker failed a cross-check
//! - miner_engine_backend{engine,backend}: label-only backend info gauge

use once_cell::sync::Lazy;
use prometheus::{
    opts, Encoder, GaugeVec, IntCounter, IntCounterVec, IntGaugeVec, Registry, TextEncoder,
};

#[cfg(feature = "http-exporter")]
use {anyhow::Result, std::net::SocketAddr, warp::Filter};

#[cfg(not(feature = "http-exporter"))]
use anyhow::Result;

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static FERMAT_TESTS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new(
        "miner_fermat_tests_total",
        "Candidates submitted to Fermat testing",
    )
    .expect("create miner_fermat_tests_total");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("register miner_fermat_tests_total");
    c
});

static FERMAT_PRIMES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new(
        "miner_fermat_primes_total",
        "Candidates that passed the Fermat witness",
    )
    .expect("create miner_fermat_primes_total");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("register miner_fermat_primes_total");
    c
});

static CHAINS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new(
        "miner_chains_total",
        "Chain candidates emitted by the locator",
    )
    .expect("create miner_chains_total");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("register miner_chains_total");
    c
});

static CHAIN_LENGTH_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        opts!(
            "miner_chain_length_total",
            "Confirmed chain lengths after Fermat testing"
        ),
        &["length"],
    )
    .expect("create miner_chain_length_total");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("register miner_chain_length_total");
    c
});

static SHARES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("miner_shares_total", "Shares that met the difficulty target")
        .expect("create miner_shares_total");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("register miner_shares_total");
    c
});

static RANGE_SEARCHED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new(
        "miner_range_searched_total",
        "Integers covered by the sieve across all workers",
    )
    .expect("create miner_range_searched_total");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("register miner_range_searched_total");
    c
});

static WORKER_UNHEALTHY: Lazy<IntGaugeVec> = Lazy::new(|| {
    let g = IntGaugeVec::new(
        opts!(
            "miner_worker_unhealthy",
            "Set to 1 when a worker failed a device cross-check"
        ),
        &["worker"],
    )
    .expect("create miner_worker_unhealthy");
    REGISTRY
        .register(Box::new(g.clone()))
        .expect("register miner_worker_unhealthy");
    g
});

static ENGINE_BACKEND_INFO: Lazy<GaugeVec> = Lazy::new(|| {
    let g = GaugeVec::new(
        opts!(
            "miner_engine_backend",
            "Engine backend info (label-only gauge set to 1). Labels: engine, backend"
        ),
        &["engine", "backend"],
    )
    .expect("create miner_engine_backend");
    REGISTRY
        .register(Box::new(g.clone()))
        .expect("register miner_engine_backend");
    g
});

pub fn inc_fermat_tests(n: u64) {
    FERMAT_TESTS_TOTAL.inc_by(n);
}

pub fn inc_fermat_primes(n: u64) {
    FERMAT_PRIMES_TOTAL.inc_by(n);
}

pub fn inc_chains(n: u64) {
    CHAINS_TOTAL.inc_by(n);
}

pub fn observe_chain_length(length: u32) {
    CHAIN_LENGTH_TOTAL
        .with_label_values(&[&length.to_string()])
        .inc();
}

pub fn inc_shares() {
    SHARES_TOTAL.inc();
}

pub fn add_range_searched(n: u64) {
    RANGE_SEARCHED_TOTAL.inc_by(n);
}

pub fn set_worker_unhealthy(worker: u16, unhealthy: bool) {
    WORKER_UNHEALTHY
        .with_label_values(&[&worker.to_string()])
        .set(i64::from(unhealthy));
}

pub fn set_engine_backend(engine: &str, backend: &str) {
    ENGINE_BACKEND_INFO
        .with_label_values(&[engine, backend])
        .set(1.0);
}

/// Render the registry in the Prometheus text exposition format.
pub fn gather() -> String {
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        log::warn!("failed to encode metrics: {e}");
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Serve `/metrics` on `0.0.0.0:port` as a background task.
#[cfg(feature = "http-exporter")]
pub async fn start_http_exporter(port: u16) -> Result<()> {
    let route = warp::path("metrics").map(|| {
        warp::http::Response::builder()
            .header("Content-Type", "text/plain; version=0.0.4")
            .body(gather())
    });
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    log::info!("metrics exporter listening on {addr}");
    tokio::spawn(async move {
        warp::serve(route).run(addr).await;
    });
    Ok(())
}

/// No-op when the exporter feature is compiled out.
#[cfg(not(feature = "http-exporter"))]
pub async fn start_http_exporter(_port: u16) -> Result<()> {
    log::warn!("metrics http-exporter feature not enabled; /metrics unavailable");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_and_render() {
        inc_fermat_tests(10);
        inc_fermat_primes(3);
        inc_chains(2);
        observe_chain_length(4);
        inc_shares();
        add_range_searched(1_000_000);
        set_worker_unhealthy(0, true);
        set_engine_backend("gpu-0", "Vulkan");

        let text = gather();
        assert!(text.contains("miner_fermat_tests_total"));
        assert!(text.contains("miner_chain_length_total"));
        assert!(text.contains("miner_worker_unhealthy"));
    }
}
