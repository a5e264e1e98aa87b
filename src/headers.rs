//! Header/cookie builder (C1).
//!
//! Grounded on `app/services/reverse/utils/headers.py` (`_build_sso_cookie`,
//! `build_headers`): assembles the cookie header, browser-impersonation
//! headers, and the per-request Statsig identifier. Pure function over a
//! token string and static config; never fails.

use uuid::Uuid;

use crate::config::SecuritySettings;
use crate::statsig::gen_statsig_id;

/// Payload kind influences the `Content-Type` header chosen for the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Json,
    GrpcWeb,
}

/// Normalizes a raw token string, stripping a leading `sso=` prefix if present.
pub fn normalize_token(token: &str) -> &str {
    token.strip_prefix("sso=").unwrap_or(token)
}

fn build_sso_cookie(token: &str, cf_clearance: Option<&str>) -> String {
    let normalized = normalize_token(token);
    let mut cookie = format!("sso={normalized}; sso-rw={normalized}");
    if let Some(cf) = cf_clearance {
        cookie.push_str("; cf_clearance=");
        cookie.push_str(cf);
    }
    cookie
}

/// One fully-built header set for a single upstream request.
pub struct BuiltHeaders {
    pub headers: Vec<(&'static str, String)>,
}

/// Builds the full outbound header set for one upstream request.
pub fn build_headers(
    token: &str,
    security: &SecuritySettings,
    dynamic_statsig: bool,
    payload_kind: PayloadKind,
) -> BuiltHeaders {
    let cookie = build_sso_cookie(token, security.cf_clearance.as_deref());
    let statsig_id = gen_statsig_id(dynamic_statsig);
    let request_id = Uuid::new_v4().to_string();
    let app_url = security.app_url();

    let content_type = match payload_kind {
        PayloadKind::Json => "application/json",
        PayloadKind::GrpcWeb => "application/grpc-web+proto",
    };

    let mut headers = vec![
        ("Cookie", cookie),
        ("User-Agent", security.user_agent()),
        ("Accept-Encoding", "gzip, deflate, br".to_string()),
        ("Accept-Language", "en-US,en;q=0.9".to_string()),
        ("Content-Type", content_type.to_string()),
        ("Origin", app_url.clone()),
        ("Referer", format!("{app_url}/")),
        (
            "Sec-Ch-Ua",
            format!(
                "\"Chromium\";v=\"{ver}\", \"Not.A/Brand\";v=\"8\"",
                ver = security.chrome_major_version()
            ),
        ),
        ("Sec-Ch-Ua-Mobile", "?0".to_string()),
        (
            "Sec-Ch-Ua-Platform",
            format!("\"{}\"", security.platform()),
        ),
        ("Sec-Fetch-Mode", "cors".to_string()),
        ("Sec-Fetch-Dest", "empty".to_string()),
        ("Sec-Fetch-Site", "same-origin".to_string()),
        ("x-statsig-id", statsig_id),
        ("x-xai-request-id", request_id),
    ];

    if let Some(baggage) = security.sentry_baggage.as_ref() {
        headers.push(("baggage", baggage.clone()));
    }

    BuiltHeaders { headers }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn strips_sso_prefix() {
        assert_eq!(normalize_token("sso=abc123"), "abc123");
        assert_eq!(normalize_token("abc123"), "abc123");
    }

    #[test]
    fn cookie_includes_cf_clearance_when_configured() {
        let cookie = build_sso_cookie("abc", Some("cfval"));
        assert_eq!(cookie, "sso=abc; sso-rw=abc; cf_clearance=cfval");
    }

    #[test]
    fn cookie_omits_cf_clearance_when_absent() {
        let cookie = build_sso_cookie("abc", None);
        assert_eq!(cookie, "sso=abc; sso-rw=abc");
    }
}
