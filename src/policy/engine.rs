use crate::policy::types::*;

pub const NO_MATCHING_RULE: &str = "no matching rule";
pub const INVALID_REQUEST: &str = "invalid request: user and profile are required";

/// Evaluate `request` against `policy`.
///
/// Rules are tried in order and the first match wins. A request with no
/// matching rule is denied with no rule index. The result depends only on
/// the two arguments, so identical inputs always produce identical decisions.
pub fn evaluate(policy: &Policy, request: &Request) -> Decision {
    if request.user.is_empty() || request.profile.is_empty() {
        return Decision::default_deny(INVALID_REQUEST);
    }

    for (index, rule) in policy.rules.iter().enumerate() {
        if !rule_matches(rule, request) {
            continue;
        }

        let mut decision = Decision {
            effect: rule.effect,
            matched_rule: rule.name.clone(),
            rule_index: Some(index),
            reason: rule.reason.clone(),
            requires_server_mode: false,
            requires_session_tracking: false,
        };

        if rule.effect == Effect::RequireServerSession {
            let server_mode = request.mode == Mode::Server;
            let tracked = !request.session_table_name.is_empty();
            if server_mode && tracked {
                decision.effect = Effect::Allow;
            } else {
                decision.effect = Effect::Deny;
                decision.requires_server_mode = !server_mode;
                decision.requires_session_tracking = !tracked;
            }
        }

        return decision;
    }

    Decision::default_deny(NO_MATCHING_RULE)
}

fn rule_matches(rule: &Rule, request: &Request) -> bool {
    let c = &rule.conditions;

    let profile_match = c
        .profiles
        .iter()
        .any(|p| p == WILDCARD || *p == request.profile);
    if !profile_match {
        return false;
    }

    let user_match =
        c.users.is_empty() || c.users.iter().any(|u| u == WILDCARD || *u == request.user);
    if !user_match {
        return false;
    }

    match &c.time {
        Some(window) => window.contains(request.time),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc, Weekday};

    fn rule(name: &str, effect: Effect, profiles: &[&str], users: &[&str]) -> Rule {
        Rule {
            name: name.into(),
            effect,
            conditions: Conditions {
                profiles: profiles.iter().map(|s| s.to_string()).collect(),
                users: users.iter().map(|s| s.to_string()).collect(),
                time: None,
            },
            reason: format!("{name} reason"),
        }
    }

    fn request(user: &str, profile: &str) -> Request {
        Request {
            user: user.into(),
            profile: profile.into(),
            time: Utc.with_ymd_and_hms(2025, 3, 3, 10, 0, 0).unwrap(),
            mode: Mode::Cli,
            session_table_name: String::new(),
        }
    }

    fn policy(rules: Vec<Rule>) -> Policy {
        Policy {
            version: "1".into(),
            rules,
        }
    }

    #[test]
    fn test_allow_all_production() {
        let p = policy(vec![rule("allow-all", Effect::Allow, &["production"], &[])]);
        let d = evaluate(&p, &request("alice", "production"));
        assert_eq!(d.effect, Effect::Allow);
        assert_eq!(d.matched_rule, "allow-all");
        assert_eq!(d.rule_index, Some(0));
    }

    #[test]
    fn test_empty_policy_denies() {
        let d = evaluate(&policy(vec![]), &request("alice", "production"));
        assert_eq!(d.effect, Effect::Deny);
        assert_eq!(d.rule_index, None);
        assert_eq!(d.reason, NO_MATCHING_RULE);
        assert!(d.matched_rule.is_empty());
    }

    #[test]
    fn test_non_matching_rules_deny() {
        let p = policy(vec![
            rule("staging", Effect::Allow, &["staging"], &[]),
            rule("bob-only", Effect::Allow, &["production"], &["bob"]),
        ]);
        let d = evaluate(&p, &request("alice", "production"));
        assert_eq!(d, Decision::default_deny(NO_MATCHING_RULE));
    }

    #[test]
    fn test_first_match_wins() {
        let p = policy(vec![
            rule("allow", Effect::Allow, &["production"], &["alice"]),
            rule("deny", Effect::Deny, &["production"], &["alice"]),
        ]);
        let d = evaluate(&p, &request("alice", "production"));
        assert_eq!(d.effect, Effect::Allow);
        assert_eq!(d.rule_index, Some(0));
        assert_eq!(d.matched_rule, "allow");
    }

    #[test]
    fn test_explicit_deny_rule() {
        let p = policy(vec![
            rule("deny-prod", Effect::Deny, &["production"], &[]),
            rule("allow-rest", Effect::Allow, &["*"], &[]),
        ]);
        let d = evaluate(&p, &request("alice", "production"));
        assert_eq!(d.effect, Effect::Deny);
        assert_eq!(d.rule_index, Some(0));
        assert_eq!(d.reason, "deny-prod reason");

        let d = evaluate(&p, &request("alice", "dev"));
        assert_eq!(d.effect, Effect::Allow);
        assert_eq!(d.rule_index, Some(1));
    }

    #[test]
    fn test_user_wildcard() {
        let p = policy(vec![rule("any", Effect::Allow, &["dev"], &["*"])]);
        assert!(evaluate(&p, &request("carol", "dev")).is_allowed());
    }

    #[test]
    fn test_time_window_condition() {
        let mut r = rule("weekdays", Effect::Allow, &["production"], &[]);
        r.conditions.time = Some(TimeWindow {
            days: vec![Weekday::Mon],
            hours: HourRange::parse("09:00", "17:00"),
        });
        let p = policy(vec![r]);

        // Monday 10:00
        assert!(evaluate(&p, &request("alice", "production")).is_allowed());

        let mut late = request("alice", "production");
        late.time = Utc.with_ymd_and_hms(2025, 3, 3, 20, 0, 0).unwrap();
        assert_eq!(evaluate(&p, &late).rule_index, None);
    }

    #[test]
    fn test_require_server_session_cli_without_table() {
        let p = policy(vec![rule(
            "server-only",
            Effect::RequireServerSession,
            &["production"],
            &[],
        )]);
        let d = evaluate(&p, &request("alice", "production"));
        assert_eq!(d.effect, Effect::Deny);
        assert_eq!(d.rule_index, Some(0));
        assert!(d.requires_server_mode);
        assert!(d.requires_session_tracking);
    }

    #[test]
    fn test_require_server_session_server_without_table() {
        let p = policy(vec![rule(
            "server-only",
            Effect::RequireServerSession,
            &["production"],
            &[],
        )]);
        let mut req = request("alice", "production");
        req.mode = Mode::Server;
        let d = evaluate(&p, &req);
        assert_eq!(d.effect, Effect::Deny);
        assert!(!d.requires_server_mode);
        assert!(d.requires_session_tracking);
    }

    #[test]
    fn test_require_server_session_satisfied() {
        let p = policy(vec![rule(
            "server-only",
            Effect::RequireServerSession,
            &["production"],
            &[],
        )]);
        let mut req = request("alice", "production");
        req.mode = Mode::Server;
        req.session_table_name = "x".into();
        let d = evaluate(&p, &req);
        assert_eq!(d.effect, Effect::Allow);
        assert!(!d.requires_server_mode);
        assert!(!d.requires_session_tracking);
        assert_eq!(d.matched_rule, "server-only");
    }

    #[test]
    fn test_require_server_session_credential_process_with_table() {
        let p = policy(vec![rule(
            "server-only",
            Effect::RequireServerSession,
            &["production"],
            &[],
        )]);
        let mut req = request("alice", "production");
        req.mode = Mode::CredentialProcess;
        req.session_table_name = "sessions".into();
        let d = evaluate(&p, &req);
        assert_eq!(d.effect, Effect::Deny);
        assert!(d.requires_server_mode);
        assert!(!d.requires_session_tracking);
    }

    #[test]
    fn test_invalid_request_denied() {
        let p = policy(vec![rule("any", Effect::Allow, &["*"], &[])]);
        let d = evaluate(&p, &request("", "production"));
        assert_eq!(d.effect, Effect::Deny);
        assert_eq!(d.rule_index, None);
        assert_eq!(d.reason, INVALID_REQUEST);
    }

    #[test]
    fn test_evaluate_is_deterministic() {
        let p = policy(vec![
            rule("a", Effect::RequireServerSession, &["production"], &["alice"]),
            rule("b", Effect::Allow, &["*"], &[]),
        ]);
        let req = request("alice", "production");
        let first = evaluate(&p, &req);
        for _ in 0..100 {
            assert_eq!(evaluate(&p, &req), first);
        }
    }
}
