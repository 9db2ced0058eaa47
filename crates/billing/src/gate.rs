//! Feature gate decision
//!
//! Pure function of tenant status, tenant type, HTTP method and route that the
//! API layer runs on every tenant-scoped request.
//!
//! | Tenant            | Blocked                                            | Code                   | HTTP |
//! |-------------------|----------------------------------------------------|------------------------|------|
//! | DEMO (type/status)| writes, except logout                              | `DEMO_READ_ONLY`       | 403  |
//! | EXPIRED           | writes, except logout and billing/invoices/payments| `SUBSCRIPTION_EXPIRED` | 402  |
//! | TRIAL             | `billing_warga` and `export` features              | `TRIAL_FEATURE_LOCKED` | 403  |
//! | ACTIVE            | nothing                                            |                        |      |

use serde::Serialize;

use kampung_shared::types::{TenantStatus, TenantType};

pub const DEMO_READ_ONLY: &str = "DEMO_READ_ONLY";
pub const SUBSCRIPTION_EXPIRED: &str = "SUBSCRIPTION_EXPIRED";
pub const TRIAL_FEATURE_LOCKED: &str = "TRIAL_FEATURE_LOCKED";

/// Route as seen by the router: the matched template (e.g.
/// `/api/v1/exports/:kind`) when known, and the raw path
#[derive(Debug, Clone, Copy)]
pub struct RouteIdentity<'a> {
    pub matched_path: Option<&'a str>,
    pub path: &'a str,
}

impl<'a> RouteIdentity<'a> {
    pub fn new(matched_path: Option<&'a str>, path: &'a str) -> Self {
        Self { matched_path, path }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteCategory {
    Logout,
    /// Paying the platform: billing, invoices, payments
    Billing,
    /// Resident dues collection
    BillingWarga,
    Export,
}

/// Classify a route by its path segments. Platform billing routes are recognised
/// only as the leading resource after `/api/vN`; logout only as the final segment.
pub fn route_category(route: &RouteIdentity<'_>) -> Option<RouteCategory> {
    let path = route.matched_path.unwrap_or(route.path);
    let segments: Vec<&str> = path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|s| s.split('.').next().unwrap_or(s))
        .collect();

    let has = |names: &[&str]| segments.iter().any(|segment| named(segment, names));
    let is = |segment: Option<&str>, names: &[&str]| segment.is_some_and(|s| named(s, names));

    // First segment after the `/api/vN` prefix
    let resource = segments
        .iter()
        .copied()
        .find(|s| !s.eq_ignore_ascii_case("api") && !is_version(s));

    if is(segments.last().copied(), &["logout"]) {
        Some(RouteCategory::Logout)
    } else if has(&["billing-warga", "billing_warga", "iuran-warga"]) {
        Some(RouteCategory::BillingWarga)
    } else if has(&["export", "exports"]) {
        Some(RouteCategory::Export)
    } else if is(resource, &["billing", "invoices", "payments"]) {
        Some(RouteCategory::Billing)
    } else {
        None
    }
}

fn named(segment: &str, names: &[&str]) -> bool {
    names.iter().any(|name| segment.eq_ignore_ascii_case(name))
}

fn is_version(segment: &str) -> bool {
    segment
        .strip_prefix(['v', 'V'])
        .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GateDecision {
    Allow,
    Deny {
        code: &'static str,
        http_status: u16,
    },
}

impl GateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

fn is_read(method: &str) -> bool {
    matches!(method.to_ascii_uppercase().as_str(), "GET" | "HEAD" | "OPTIONS")
}

pub fn evaluate(
    status: TenantStatus,
    tenant_type: TenantType,
    method: &str,
    route: &RouteIdentity<'_>,
) -> GateDecision {
    let category = route_category(route);
    let read = is_read(method);
    let logout = category == Some(RouteCategory::Logout);

    let demo = tenant_type == TenantType::Demo || status == TenantStatus::Demo;
    if demo {
        return if read || logout {
            GateDecision::Allow
        } else {
            GateDecision::Deny {
                code: DEMO_READ_ONLY,
                http_status: 403,
            }
        };
    }

    match status {
        TenantStatus::Expired if !read && !logout && category != Some(RouteCategory::Billing) => {
            GateDecision::Deny {
                code: SUBSCRIPTION_EXPIRED,
                http_status: 402,
            }
        }
        TenantStatus::Trial
            if matches!(
                category,
                Some(RouteCategory::BillingWarga | RouteCategory::Export)
            ) =>
        {
            GateDecision::Deny {
                code: TRIAL_FEATURE_LOCKED,
                http_status: 403,
            }
        }
        _ => GateDecision::Allow,
    }
}
