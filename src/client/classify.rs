//! Provider error-body classification.
//!
//! The provider reports failures in a structured fault body. This module is
//! the single place that decides what a failure was about, so the resilience
//! pipeline never pattern-matches on raw payloads anywhere else. Detection
//! has to stay false-positive-free: misreading a business error as an auth
//! error would trigger pointless refresh churn.

use serde::Deserialize;

/// What a provider failure was about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// The token was rejected; a forced refresh may recover.
    Auth,
    /// Provider-side throttling; retry after the advertised delay.
    RateLimited,
    /// The resource already exists (e.g. duplicate invoice name).
    Duplicate,
    /// Anything else: business validation, server errors, unknown bodies.
    Other,
}

/// Fault codes the provider documents for token problems.
/// 3200 = AuthenticationFailed (expired/invalid token),
/// 3201 = ApplicationAuthenticationFailed, 120 = authorization failure.
const AUTH_FAULT_CODES: &[&str] = &["3200", "3201", "120"];

/// 6240 = Duplicate Name Exists.
const DUPLICATE_FAULT_CODES: &[&str] = &["6240"];

const AUTH_FAULT_SUBSTRINGS: &[&str] = &["AuthenticationFailed", "Token expired", "token expired"];

#[derive(Debug, Deserialize)]
struct FaultBody {
    #[serde(alias = "Fault")]
    fault: Option<Fault>,
}

#[derive(Debug, Deserialize)]
struct Fault {
    #[serde(alias = "Error", alias = "error", default)]
    errors: Vec<FaultError>,
    #[serde(alias = "type", default)]
    fault_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FaultError {
    #[serde(alias = "Message", default)]
    message: Option<String>,
    #[serde(alias = "Detail", default)]
    detail: Option<String>,
    #[serde(default)]
    code: Option<String>,
}

/// Classify a failed response by HTTP status and structured fault body.
pub fn classify(status: u16, body: &str) -> FaultKind {
    match status {
        401 | 403 => return FaultKind::Auth,
        429 => return FaultKind::RateLimited,
        _ => {}
    }

    let Ok(parsed) = serde_json::from_str::<FaultBody>(body) else {
        return FaultKind::Other;
    };
    let Some(fault) = parsed.fault else {
        return FaultKind::Other;
    };

    if fault
        .fault_type
        .as_deref()
        .is_some_and(|t| t.eq_ignore_ascii_case("authentication"))
    {
        return FaultKind::Auth;
    }

    for error in &fault.errors {
        if let Some(code) = &error.code {
            if AUTH_FAULT_CODES.contains(&code.as_str()) {
                return FaultKind::Auth;
            }
            if DUPLICATE_FAULT_CODES.contains(&code.as_str()) {
                return FaultKind::Duplicate;
            }
        }
        let text_matches = |s: &Option<String>| {
            s.as_deref()
                .is_some_and(|s| AUTH_FAULT_SUBSTRINGS.iter().any(|sub| s.contains(sub)))
        };
        if text_matches(&error.message) || text_matches(&error.detail) {
            return FaultKind::Auth;
        }
    }

    FaultKind::Other
}

/// True when the failure is about the token itself.
pub fn is_auth_failure(status: u16, body: &str) -> bool {
    classify(status, body) == FaultKind::Auth
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_401_and_403_are_auth() {
        assert_eq!(classify(401, ""), FaultKind::Auth);
        assert_eq!(classify(403, "{}"), FaultKind::Auth);
    }

    #[test]
    fn test_status_429_is_rate_limited() {
        assert_eq!(classify(429, ""), FaultKind::RateLimited);
    }

    #[test]
    fn test_auth_fault_code_in_200_family_body() {
        let body = r#"{"Fault":{"Error":[{"Message":"message=AuthenticationFailed; errorCode=003200","Detail":"Token expired","code":"3200"}],"type":"AUTHENTICATION"},"time":"2026-08-30T10:00:00Z"}"#;
        assert_eq!(classify(400, body), FaultKind::Auth);
        assert!(is_auth_failure(400, body));
    }

    #[test]
    fn test_auth_substring_without_code() {
        let body = r#"{"Fault":{"Error":[{"Message":"Token expired","code":"9999"}]}}"#;
        assert_eq!(classify(400, body), FaultKind::Auth);
    }

    #[test]
    fn test_duplicate_fault() {
        let body = r#"{"Fault":{"Error":[{"Message":"Duplicate Name Exists Error","code":"6240"}],"type":"ValidationFault"}}"#;
        assert_eq!(classify(400, body), FaultKind::Duplicate);
    }

    #[test]
    fn test_business_validation_error_is_not_auth() {
        let body = r#"{"Fault":{"Error":[{"Message":"Invalid account type","Detail":"Account type must be set","code":"2070"}],"type":"ValidationFault"}}"#;
        assert_eq!(classify(400, body), FaultKind::Other);
        assert!(!is_auth_failure(400, body));
    }

    #[test]
    fn test_unparseable_body_is_other() {
        assert_eq!(classify(400, "not json"), FaultKind::Other);
        assert_eq!(classify(500, ""), FaultKind::Other);
    }
}
