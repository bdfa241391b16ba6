// Decision Aggregator - Combines per-rule results into one Decision
//
// Pure function of the ordered results and the failure policy. Precedence,
// highest first: DENY, CHALLENGE, ERROR under fail-closed (enforced as DENY),
// ALLOW. Ties keep the first rule's reason.

use crate::decision::{Conclusion, Decision, IpDetails, Reason, RuleResult, RuleState};

fn rank(conclusion: Conclusion, fail_open: bool) -> u8 {
    match conclusion {
        Conclusion::Deny => 3,
        Conclusion::Challenge => 2,
        Conclusion::Error if !fail_open => 1,
        Conclusion::Error | Conclusion::Allow => 0,
    }
}

fn outcome(rank: u8) -> Conclusion {
    match rank {
        3 | 1 => Conclusion::Deny,
        2 => Conclusion::Challenge,
        _ => Conclusion::Allow,
    }
}

/// Aggregate `results` into a decision
///
/// Skipped rules take no part. Dry-run rules contribute ALLOW whatever
/// their own conclusion. An ALLOW decision surfaces the first error as its
/// reason so fail-open failures stay visible. Any live error drops the TTL
/// to 0 so the decision is never cached.
pub fn aggregate(results: Vec<RuleResult>, fail_open: bool, ip: Option<IpDetails>) -> Decision {
    let evaluated = || results.iter().filter(|r| r.was_evaluated());

    let top = evaluated()
        .map(|r| rank(r.enforced_conclusion(), fail_open))
        .max()
        .unwrap_or(0);
    let conclusion = outcome(top);

    let reason = if top > 0 {
        evaluated()
            .find(|r| rank(r.enforced_conclusion(), fail_open) == top)
            .map(|r| r.reason.clone())
    } else {
        evaluated()
            .find(|r| r.is_error())
            .or_else(|| evaluated().next())
            .map(|r| r.reason.clone())
    }
    .unwrap_or(Reason::NotRun);

    let live = || evaluated().filter(|r| r.state == RuleState::Run);
    let ttl = if live().any(RuleResult::is_error) {
        0
    } else {
        live().map(|r| r.ttl).max().unwrap_or(0)
    };

    Decision::new(conclusion, reason, results, ip, ttl)
}
