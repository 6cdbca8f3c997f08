// Endpoint selector - capability filtering plus tiered ranking

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::health::HealthStatus;
use super::registry::Endpoint;
use super::{ClientType, WireFormat};

/// A ranked endpoint together with the formats it will be spoken to in.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub endpoint: Arc<Endpoint>,
    pub upstream_formats: Vec<WireFormat>,
    pub needs_conversion: bool,
    pub status: HealthStatus,
    pub latency: Option<Duration>,
}

/// Why an endpoint was left out, for the request trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Skipped {
    pub endpoint: String,
    pub reason: &'static str,
}

#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub candidates: Vec<Candidate>,
    pub skipped: Vec<Skipped>,
}

pub struct EndpointSelector;

impl EndpointSelector {
    /// Filter and rank `endpoints` for a request in `target` format.
    ///
    /// Ranking tiers, each breaking ties for the next: no conversion first,
    /// ascending priority, health status, ascending last latency with
    /// unknown latency last. The sort is stable so configuration order is
    /// the final tiebreak.
    pub fn select(
        endpoints: &[Arc<Endpoint>],
        target: WireFormat,
        tags: &[String],
        client_type: ClientType,
        now: Instant,
    ) -> Selection {
        let mut selection = Selection::default();

        for endpoint in endpoints {
            let skip = |reason| Skipped {
                endpoint: endpoint.name().to_string(),
                reason,
            };

            if !endpoint.is_enabled() {
                selection.skipped.push(skip("disabled"));
                continue;
            }
            if !endpoint.has_tags(tags) {
                selection.skipped.push(skip("tag mismatch"));
                continue;
            }
            if let Some(filter) = endpoint.config().client_type.as_deref() {
                if !filter.eq_ignore_ascii_case(client_type.as_str()) {
                    selection.skipped.push(skip("client type mismatch"));
                    continue;
                }
            }
            let status = endpoint.health_status(now);
            if status == HealthStatus::Blacklisted {
                selection.skipped.push(skip("blacklisted"));
                continue;
            }
            let upstream_formats = endpoint.upstream_attempts(target);
            let Some(first) = upstream_formats.first().copied() else {
                selection.skipped.push(skip("no usable format"));
                continue;
            };

            selection.candidates.push(Candidate {
                endpoint: endpoint.clone(),
                needs_conversion: first != target,
                upstream_formats,
                status,
                latency: endpoint.last_latency(),
            });
        }

        selection.candidates.sort_by_key(|c| {
            (
                c.needs_conversion,
                c.endpoint.config().priority,
                c.status.rank(),
                c.latency.is_none(),
                c.latency.unwrap_or(Duration::ZERO),
            )
        });

        selection
    }
}
