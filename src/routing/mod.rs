//! Route planning for the virtual interface
//!
//! The tunnel wants to attract all traffic except packets destined for the
//! remote endpoint itself: if the endpoint's own traffic re-enters the
//! tunnel, the session loops. Rather than relying on a host-route with a
//! higher metric (not available on every platform), the planner emits a
//! minimal set of CIDR blocks that cover the whole IPv4 space minus the
//! single endpoint address.
//!
//! The cover is produced by bisection: starting from the full space, the
//! half that does not contain the target is emitted whole and the half that
//! does is split again, down to /32. This yields exactly one block per
//! prefix length, 32 blocks total for a /0 base.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use tracing::warn;

use crate::config::SessionConfig;

/// The full IPv4 address space, `0.0.0.0/0`
#[must_use]
pub fn default_route() -> Ipv4Net {
    Ipv4Net::default()
}

/// Compute the minimal disjoint cover of `base` excluding the single
/// address `target`
///
/// Pure function; recursion depth is bounded by the address bit width
/// (`32 - base.prefix_len()` levels). The base case is a /32, where the
/// remaining block is the target itself and nothing is emitted.
///
/// # Panics
///
/// Debug-asserts that `base` contains `target`.
#[must_use]
pub fn exclusion_cover(base: Ipv4Net, target: Ipv4Addr) -> Vec<Ipv4Net> {
    debug_assert!(base.contains(&target), "target must lie inside base");
    let mut out = Vec::with_capacity(usize::from(32 - base.prefix_len()));
    split_around(base.trunc(), target, &mut out);
    out
}

fn split_around(block: Ipv4Net, target: Ipv4Addr, out: &mut Vec<Ipv4Net>) {
    if block.prefix_len() >= 32 {
        // Only the target itself remains; excluded by construction.
        return;
    }

    let Ok(mut halves) = block.subnets(block.prefix_len() + 1) else {
        return;
    };
    let (Some(lower), Some(upper)) = (halves.next(), halves.next()) else {
        return;
    };

    if lower.contains(&target) {
        out.push(upper);
        split_around(lower, target, out);
    } else {
        out.push(lower);
        split_around(upper, target, out);
    }
}

/// Routes to install on the virtual interface for one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePlan {
    /// CIDR blocks routed into the tunnel
    pub included: Vec<Ipv4Net>,
    /// CIDR blocks kept on the physical network (from config bypass list)
    pub bypassed: Vec<Ipv4Net>,
    /// True when the endpoint could not be excluded and the plan fell back
    /// to the unsplit default route
    pub degraded: bool,
}

/// Build the route plan for a session
///
/// A literal IPv4 server host gets the exclusion cover; an IPv6 or
/// domain-based endpoint cannot be excluded at this layer, so the plan
/// falls back to `0.0.0.0/0` and records the degraded mode. The fallback is
/// logged, never silent: the endpoint's own traffic may loop through the
/// tunnel until the engine's socket protection catches it.
#[must_use]
pub fn plan_tunnel_routes(config: &SessionConfig) -> RoutePlan {
    let bypassed: Vec<Ipv4Net> = config
        .bypass_routes
        .iter()
        .filter_map(|s| s.parse::<Ipv4Net>().ok().map(|n| n.trunc()))
        .collect();

    let host = config.server_host();
    match host.parse::<Ipv4Addr>() {
        Ok(target) => RoutePlan {
            included: exclusion_cover(default_route(), target),
            bypassed,
            degraded: false,
        },
        Err(_) => {
            warn!(
                server = %host,
                "endpoint is not a literal IPv4 address; routing full \
                 default route through the tunnel (degraded mode)"
            );
            RoutePlan {
                included: vec![default_route()],
                bypassed,
                degraded: true,
            }
        }
    }
}
