//! Racing of multiple HTTP endpoint candidates for one logical server.
//!
//! A server may advertise several endpoint URLs for the same storage service
//! (different routes, protocols, or address families). Rather than guessing,
//! the client probes them all at once and adopts whichever answers first.

use std::future::Future;

use futures::stream::{FuturesUnordered, StreamExt};
use thiserror::Error;

/// One endpoint's failure, kept so an all-endpoints outage is diagnosable
/// per candidate (DNS failure here, TLS failure there).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeFailure {
    pub url: String,
    pub reason: String,
}

/// Every candidate failed. Carries all individual reasons, not just the
/// first or last.
#[derive(Error, Debug)]
#[error("all {} endpoint probes failed", .failures.len())]
pub struct AllProbesFailed {
    pub failures: Vec<ProbeFailure>,
}

/// Probes every candidate URL concurrently and resolves to the first one
/// whose probe succeeds.
///
/// "First" is completion order, not list order: a candidate listed later
/// wins if it answers sooner. Once a winner is chosen the losing probes are
/// abandoned and their eventual results discarded. If every probe fails, the
/// aggregated error holds exactly one failure reason per candidate. The
/// racer never retries a probe; retry policy belongs to the caller.
pub async fn pick_http_server<F, Fut>(
    candidate_urls: Vec<String>,
    probe: F,
) -> Result<String, AllProbesFailed>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = gridstore_common::Result<()>>,
{
    let mut in_flight: FuturesUnordered<_> = candidate_urls
        .into_iter()
        .map(|url| {
            let attempt = probe(url.clone());
            async move { (url, attempt.await) }
        })
        .collect();

    let mut failures = Vec::new();
    while let Some((url, outcome)) = in_flight.next().await {
        match outcome {
            // Dropping `in_flight` abandons every probe still running.
            Ok(()) => return Ok(url),
            Err(e) => failures.push(ProbeFailure {
                url,
                reason: e.to_string(),
            }),
        }
    }
    Err(AllProbesFailed { failures })
}
