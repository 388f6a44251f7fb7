//! Server command registry.
//!
//! Commands dispatch through an explicit table: each entry declares its
//! parameter names, and arguments are extracted from the payload by name
//! into positional order. Unknown names never reach the supervisor; they
//! resolve to the NotFound error path.

use serde_json::Value;

use garrison_common::ProviderFault;

pub struct CommandSpec {
    pub name: &'static str,
    pub params: &'static [&'static str],
}

pub const REGISTRY: &[CommandSpec] = &[
    CommandSpec { name: "create", params: &[] },
    CommandSpec { name: "delete", params: &[] },
    CommandSpec { name: "start", params: &[] },
    CommandSpec { name: "stop", params: &[] },
    CommandSpec { name: "kill", params: &[] },
    CommandSpec { name: "status", params: &[] },
    CommandSpec { name: "backup", params: &["archive"] },
    CommandSpec { name: "restore", params: &["archive"] },
    CommandSpec { name: "say", params: &["message"] },
];

pub fn lookup(name: &str) -> Option<&'static CommandSpec> {
    REGISTRY.iter().find(|spec| spec.name == name)
}

/// Pull the declared parameters out of the payload, in declared order.
/// A leading `:` marks a string as a symbolic/enum argument and is
/// stripped before dispatch.
pub fn extract_args(spec: &CommandSpec, payload: &Value) -> Result<Vec<Value>, ProviderFault> {
    spec.params
        .iter()
        .map(|param| {
            let value = payload
                .get(*param)
                .cloned()
                .ok_or_else(|| ProviderFault::Argument(format!("missing argument '{param}'")))?;
            Ok(desymbolize(value))
        })
        .collect()
}

fn desymbolize(value: Value) -> Value {
    match value {
        Value::String(s) => match s.strip_prefix(':') {
            Some(symbol) => Value::String(symbol.to_string()),
            None => Value::String(s),
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lookup_finds_known_commands_only() {
        assert!(lookup("start").is_some());
        assert!(lookup("create").is_some());
        assert!(lookup("reboot-the-moon").is_none());
    }

    #[test]
    fn args_extract_by_declared_name() {
        let spec = lookup("backup").unwrap();
        let args = extract_args(spec, &json!({"archive": "srv1.tgz", "extra": 1})).unwrap();
        assert_eq!(args, vec![json!("srv1.tgz")]);
    }

    #[test]
    fn missing_argument_is_an_argument_fault() {
        let spec = lookup("say").unwrap();
        let err = extract_args(spec, &json!({})).unwrap_err();
        assert_eq!(err.kind_name(), "ArgumentError");
    }

    #[test]
    fn leading_colon_marks_a_symbol() {
        let spec = lookup("restore").unwrap();
        let args = extract_args(spec, &json!({"archive": ":latest"})).unwrap();
        assert_eq!(args, vec![json!("latest")]);
        // Non-string values pass through untouched.
        let spec = lookup("say").unwrap();
        let args = extract_args(spec, &json!({"message": 42})).unwrap();
        assert_eq!(args, vec![json!(42)]);
    }
}
