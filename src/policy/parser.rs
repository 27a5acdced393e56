use crate::policy::errors::PolicyError;
use crate::policy::types::*;
use kdl::KdlDocument;

/// Parse a KDL document string into an unvalidated [`ParsedPolicy`].
pub fn parse_kdl_document(source: &str) -> Result<ParsedPolicy, PolicyError> {
    let doc: KdlDocument = source
        .parse()
        .map_err(|e: kdl::KdlError| PolicyError::KdlParse(e.to_string()))?;

    let mut policy = ParsedPolicy::default();

    for node in doc.nodes() {
        match node.name().value() {
            "version" => {
                let version = first_scalar_arg(node).ok_or_else(|| {
                    PolicyError::Invalid(
                        "version node requires an argument (e.g. version \"1\")".into(),
                    )
                })?;
                policy.version = Some(version);
            }
            "rule" => {
                let name = first_string_arg(node).ok_or_else(|| {
                    PolicyError::Invalid(
                        "rule node requires a string argument (e.g. rule \"allow-dev\" effect=\"allow\")"
                            .into(),
                    )
                })?;

                let effect = node
                    .get("effect")
                    .and_then(|v| v.as_string())
                    .unwrap_or("deny")
                    .to_string();

                let mut rule = ParsedRule {
                    name,
                    effect,
                    ..Default::default()
                };

                if let Some(children) = node.children() {
                    for child in children.nodes() {
                        match child.name().value() {
                            "profiles" => rule.profiles = dash_list(child),
                            "users" => rule.users = dash_list(child),
                            "reason" => rule.reason = first_string_arg(child),
                            "time" => parse_time_node(child, &mut rule)?,
                            other => {
                                return Err(PolicyError::InvalidRule {
                                    rule: rule.name.clone(),
                                    message: format!(
                                        "unexpected child `{other}` (expected `profiles`, `users`, `time` or `reason`)"
                                    ),
                                });
                            }
                        }
                    }
                }

                policy.rules.push(rule);
            }
            other => {
                tracing::warn!("ignoring unknown top-level KDL node `{other}`");
            }
        }
    }

    Ok(policy)
}

fn parse_time_node(node: &kdl::KdlNode, rule: &mut ParsedRule) -> Result<(), PolicyError> {
    let Some(children) = node.children() else {
        return Ok(());
    };
    for child in children.nodes() {
        match child.name().value() {
            "days" => rule.days = dash_list(child),
            "hours" => {
                let start = child.get("start").and_then(|v| v.as_string());
                let end = child.get("end").and_then(|v| v.as_string());
                match (start, end) {
                    (Some(s), Some(e)) => rule.hours = Some((s.to_string(), e.to_string())),
                    _ => {
                        return Err(PolicyError::InvalidRule {
                            rule: rule.name.clone(),
                            message: "hours requires start=\"HH:MM\" and end=\"HH:MM\"".into(),
                        })
                    }
                }
            }
            other => {
                return Err(PolicyError::InvalidRule {
                    rule: rule.name.clone(),
                    message: format!("unexpected child `{other}` in time (expected `days` or `hours`)"),
                });
            }
        }
    }
    Ok(())
}

/// Extract the first string argument from a KDL node.
fn first_string_arg(node: &kdl::KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

/// Like [`first_string_arg`] but also accepts an integer (`version 1`).
fn first_scalar_arg(node: &kdl::KdlNode) -> Option<String> {
    let entry = node.entries().iter().find(|e| e.name().is_none())?;
    let value = entry.value();
    value
        .as_string()
        .map(|s| s.to_string())
        .or_else(|| value.as_integer().map(|n| n.to_string()))
}

/// Extract dash-list children: nodes named "-" whose first argument is a string.
fn dash_list(node: &kdl::KdlNode) -> Vec<String> {
    let Some(children) = node.children() else {
        return Vec::new();
    };
    children
        .nodes()
        .iter()
        .filter(|n| n.name().value() == "-")
        .filter_map(first_string_arg)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rule() {
        let kdl = r#"
version "1"

rule "allow-prod-oncall" effect="allow" {
    profiles {
        - "production"
    }
    users {
        - "alice"
        - "bob"
    }
    reason "on-call engineers"
}
"#;
        let policy = parse_kdl_document(kdl).unwrap();
        assert_eq!(policy.version.as_deref(), Some("1"));
        assert_eq!(policy.rules.len(), 1);
        let rule = &policy.rules[0];
        assert_eq!(rule.name, "allow-prod-oncall");
        assert_eq!(rule.effect, "allow");
        assert_eq!(rule.profiles, vec!["production"]);
        assert_eq!(rule.users, vec!["alice", "bob"]);
        assert_eq!(rule.reason.as_deref(), Some("on-call engineers"));
    }

    #[test]
    fn test_parse_integer_version() {
        let policy = parse_kdl_document("version 2").unwrap();
        assert_eq!(policy.version.as_deref(), Some("2"));
    }

    #[test]
    fn test_parse_time_window() {
        let kdl = r#"
rule "business-hours" effect="allow" {
    profiles {
        - "staging"
    }
    time {
        days {
            - "monday"
            - "friday"
        }
        hours start="09:00" end="17:00"
    }
}
"#;
        let policy = parse_kdl_document(kdl).unwrap();
        let rule = &policy.rules[0];
        assert_eq!(rule.days, vec!["monday", "friday"]);
        assert_eq!(
            rule.hours,
            Some(("09:00".to_string(), "17:00".to_string()))
        );
    }

    #[test]
    fn test_effect_defaults_to_deny() {
        let policy = parse_kdl_document(r#"rule "r" { profiles { - "p" } }"#).unwrap();
        assert_eq!(policy.rules[0].effect, "deny");
    }

    #[test]
    fn test_parse_hours_missing_end() {
        let kdl = r#"
rule "r" effect="allow" {
    profiles {
        - "p"
    }
    time {
        hours start="09:00"
    }
}
"#;
        let err = parse_kdl_document(kdl).unwrap_err();
        assert!(matches!(err, PolicyError::InvalidRule { .. }));
    }

    #[test]
    fn test_parse_unknown_rule_child() {
        let kdl = r#"rule "r" effect="allow" { roles { - "admin" } }"#;
        let err = parse_kdl_document(kdl).unwrap_err();
        assert!(matches!(err, PolicyError::InvalidRule { .. }));
    }

    #[test]
    fn test_parse_rule_without_name() {
        let err = parse_kdl_document(r#"rule effect="allow""#).unwrap_err();
        assert!(matches!(err, PolicyError::Invalid(_)));
    }

    #[test]
    fn test_parse_bad_syntax() {
        let err = parse_kdl_document("rule \"unterminated").unwrap_err();
        assert!(matches!(err, PolicyError::KdlParse(_)));
    }
}
