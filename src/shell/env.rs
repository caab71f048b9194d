//! Restricted environment for real subprocesses.
//!
//! Child processes never inherit the host environment. Only names on an
//! explicit allowlist are passed through, their values come from an
//! [`EnvProvider`], and known loader/interpreter injection variables are
//! always stripped, even if someone put them on the allowlist.

use std::collections::{BTreeMap, HashMap};

/// Variables passed to real subprocesses unless configured otherwise.
pub const DEFAULT_ENV_ALLOWLIST: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "LOGNAME",
    "LANG",
    "LC_ALL",
    "TERM",
    "TZ",
    "TMPDIR",
    "CARGO_HOME",
    "RUSTUP_HOME",
    "RUSTUP_TOOLCHAIN",
    "CARGO_TARGET_DIR",
    "NODE_ENV",
    "NPM_CONFIG_CACHE",
];

/// Variables that change what code a process loads or runs at startup.
const DANGEROUS_ENV: &[&str] = &[
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
    "LD_AUDIT",
    "DYLD_INSERT_LIBRARIES",
    "DYLD_LIBRARY_PATH",
    "DYLD_FRAMEWORK_PATH",
    "NODE_OPTIONS",
    "NODE_PATH",
    "PYTHONPATH",
    "PYTHONSTARTUP",
    "PYTHONHOME",
    "PERL5OPT",
    "PERL5LIB",
    "RUBYOPT",
    "RUBYLIB",
    "BASH_ENV",
    "ENV",
    "PROMPT_COMMAND",
    "SHELLOPTS",
    "GIT_SSH_COMMAND",
    "GIT_EXEC_PATH",
    "RUSTC_WRAPPER",
    "RUSTC_WORKSPACE_WRAPPER",
];

const DANGEROUS_PREFIXES: &[&str] = &["LD_", "DYLD_"];

/// Source of values for allowlisted environment variables.
///
/// The host application may back this with encrypted storage; the pipeline
/// only ever asks for names it is allowed to pass on.
pub trait EnvProvider: Send + Sync {
    fn get_allowed_env_value(&self, name: &str) -> Option<String>;
}

/// Reads values from the current process environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemEnv;

impl EnvProvider for SystemEnv {
    fn get_allowed_env_value(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

/// Fixed set of values, useful for tests and embedding.
#[derive(Debug, Default, Clone)]
pub struct StaticEnv {
    vars: HashMap<String, String>,
}

impl StaticEnv {
    pub fn new(vars: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            vars: vars.into_iter().collect(),
        }
    }
}

impl EnvProvider for StaticEnv {
    fn get_allowed_env_value(&self, name: &str) -> Option<String> {
        self.vars.get(name).cloned()
    }
}

pub fn is_dangerous_env(name: &str) -> bool {
    let upper = name.to_ascii_uppercase();
    DANGEROUS_ENV.contains(&upper.as_str())
        || DANGEROUS_PREFIXES.iter().any(|p| upper.starts_with(p))
}

/// Assemble the environment for a child process.
///
/// Values come from `provider`, then `overrides` are merged on top. Both
/// steps are limited to names in `allowlist`, and dangerous names are
/// removed last.
pub fn build_restricted_env(
    allowlist: &[String],
    provider: &dyn EnvProvider,
    overrides: &HashMap<String, String>,
) -> BTreeMap<String, String> {
    let mut env: BTreeMap<String, String> = allowlist
        .iter()
        .filter_map(|name| {
            provider
                .get_allowed_env_value(name)
                .map(|value| (name.clone(), value))
        })
        .collect();

    for (name, value) in overrides {
        if allowlist.contains(name) {
            env.insert(name.clone(), value.clone());
        }
    }

    env.retain(|name, _| !is_dangerous_env(name));
    env
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn provider() -> StaticEnv {
        StaticEnv::new([
            ("PATH".to_string(), "/usr/bin:/bin".to_string()),
            ("HOME".to_string(), "/home/user".to_string()),
            ("LD_PRELOAD".to_string(), "/tmp/evil.so".to_string()),
            ("AWS_SECRET_ACCESS_KEY".to_string(), "secret".to_string()),
        ])
    }

    #[test]
    fn test_only_allowlisted_names_pass() {
        let env = build_restricted_env(&names(&["PATH", "HOME"]), &provider(), &HashMap::new());
        assert_eq!(env.len(), 2);
        assert_eq!(env.get("PATH").map(String::as_str), Some("/usr/bin:/bin"));
        assert!(!env.contains_key("AWS_SECRET_ACCESS_KEY"));
    }

    #[test]
    fn test_dangerous_names_stripped_even_if_allowlisted() {
        let env = build_restricted_env(
            &names(&["PATH", "LD_PRELOAD", "LD_FOO"]),
            &provider(),
            &HashMap::from([("LD_FOO".to_string(), "x".to_string())]),
        );
        assert!(env.contains_key("PATH"));
        assert!(!env.contains_key("LD_PRELOAD"));
        assert!(!env.contains_key("LD_FOO"));
    }

    #[test]
    fn test_overrides_limited_to_allowlist() {
        let overrides = HashMap::from([
            ("HOME".to_string(), "/tmp/home".to_string()),
            ("EDITOR".to_string(), "vim".to_string()),
        ]);
        let env = build_restricted_env(&names(&["HOME"]), &provider(), &overrides);
        assert_eq!(env.get("HOME").map(String::as_str), Some("/tmp/home"));
        assert!(!env.contains_key("EDITOR"));
    }

    #[test]
    fn test_is_dangerous_env() {
        assert!(is_dangerous_env("LD_PRELOAD"));
        assert!(is_dangerous_env("ld_preload"));
        assert!(is_dangerous_env("DYLD_INSERT_LIBRARIES"));
        assert!(is_dangerous_env("NODE_OPTIONS"));
        assert!(is_dangerous_env("BASH_ENV"));
        assert!(!is_dangerous_env("PATH"));
        assert!(!is_dangerous_env("CARGO_HOME"));
    }
}
