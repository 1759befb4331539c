//! Options Resolution
//!
//! Options are a flat mapping from option name to string value. They come
//! from three places:
//!
//! - explicit maps handed to `init()`
//! - process environment variables prefixed with `COMMLINK_`
//! - TOML option files (`[options]` table)
//!
//! [`resolve`] merges explicit options with environment overrides. Names and
//! values are passed through untouched; the engine validates them when the
//! worker is built.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::{CommError, Result};

/// Option name → value mapping
pub type Options = BTreeMap<String, String>;

/// Prefix marking environment variables as option overrides
pub const ENV_PREFIX: &str = "COMMLINK_";

/// Merge explicit options with environment overrides
///
/// When `env_takes_precedence` is set, every key present in both maps is
/// dropped from the explicit copy so the environment value wins. Otherwise
/// explicit options are kept as given and the environment only fills keys the
/// caller left out. Neither input is modified.
#[must_use]
pub fn resolve(explicit: &Options, env: &Options, env_takes_precedence: bool) -> Options {
    let mut explicit = explicit.clone();

    if env_takes_precedence {
        explicit.retain(|key, _| !env.contains_key(key));
    }

    let mut resolved = env.clone();
    resolved.extend(explicit);
    resolved
}

/// Collect option overrides from the process environment
#[must_use]
pub fn env_options() -> Options {
    env_options_from(std::env::vars())
}

/// Collect option overrides from an arbitrary variable list
///
/// Only variables starting with [`ENV_PREFIX`] are kept, with the prefix
/// stripped. Variables whose remaining name is empty are skipped.
pub fn env_options_from<I, K, V>(vars: I) -> Options
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: Into<String>,
{
    vars.into_iter()
        .filter_map(|(key, value)| {
            let name = key.as_ref().strip_prefix(ENV_PREFIX)?;
            (!name.is_empty()).then(|| (name.to_string(), value.into()))
        })
        .collect()
}

#[derive(Debug, Default, Deserialize)]
struct OptionsFile {
    #[serde(default)]
    options: BTreeMap<String, toml::Value>,
}

/// Parse options from TOML text
///
/// ```toml
/// [options]
/// TRANSPORT = "tcp"
/// ACCEPT_BATCH = 8
/// TCP_NODELAY = false
/// ```
pub fn parse_options_toml(text: &str) -> std::result::Result<Options, String> {
    let file: OptionsFile = toml::from_str(text).map_err(|e| e.to_string())?;

    file.options
        .into_iter()
        .map(|(key, value)| {
            let value = match value {
                toml::Value::String(s) => s,
                toml::Value::Integer(i) => i.to_string(),
                toml::Value::Boolean(b) => if b { "y" } else { "n" }.to_string(),
                other => {
                    return Err(format!(
                        "option {key} must be a string, integer or boolean, got {}",
                        other.type_str()
                    ))
                }
            };
            Ok((key, value))
        })
        .collect()
}

/// Load options from a TOML file
pub fn load_options_file(path: &Path) -> Result<Options> {
    let text = std::fs::read_to_string(path).map_err(|e| CommError::OptionsFile {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let options = parse_options_toml(&text).map_err(|reason| CommError::OptionsFile {
        path: path.to_path_buf(),
        reason,
    })?;

    tracing::debug!(path = ?path, count = options.len(), "Loaded options file");
    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn opts(pairs: &[(&str, &str)]) -> Options {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_env_precedence_replaces_overlapping_keys() {
        let explicit = opts(&[("TRANSPORT", "inproc"), ("ACCEPT_BATCH", "4")]);
        let env = opts(&[("TRANSPORT", "tcp"), ("TCP_NODELAY", "n")]);

        let resolved = resolve(&explicit, &env, true);

        assert_eq!(
            resolved,
            opts(&[
                ("ACCEPT_BATCH", "4"),
                ("TCP_NODELAY", "n"),
                ("TRANSPORT", "tcp"),
            ])
        );
    }

    #[test]
    fn test_explicit_precedence_keeps_every_explicit_key() {
        let explicit = opts(&[("TRANSPORT", "inproc"), ("ACCEPT_BATCH", "4")]);
        let env = opts(&[("TRANSPORT", "tcp"), ("TCP_NODELAY", "n")]);

        let resolved = resolve(&explicit, &env, false);

        for (key, value) in &explicit {
            assert_eq!(resolved.get(key), Some(value));
        }
        assert_eq!(resolved.get("TCP_NODELAY").map(String::as_str), Some("n"));
    }

    #[test]
    fn test_resolve_does_not_touch_inputs() {
        let explicit = opts(&[("TRANSPORT", "inproc")]);
        let env = opts(&[("TRANSPORT", "tcp")]);

        let _ = resolve(&explicit, &env, true);

        assert_eq!(explicit, opts(&[("TRANSPORT", "inproc")]));
        assert_eq!(env, opts(&[("TRANSPORT", "tcp")]));
    }

    #[test]
    fn test_unknown_keys_pass_through() {
        let explicit = opts(&[("SOMETHING_ELSE", "1")]);
        let resolved = resolve(&explicit, &Options::new(), false);
        assert_eq!(resolved, explicit);
    }

    #[test]
    fn test_env_options_strip_prefix() {
        let vars = vec![
            ("COMMLINK_ACCEPT_BATCH", "2"),
            ("COMMLINK_", "ignored"),
            ("PATH", "/usr/bin"),
        ];
        assert_eq!(env_options_from(vars), opts(&[("ACCEPT_BATCH", "2")]));
    }

    #[test]
    fn test_parse_options_toml() {
        let text = r#"
            [options]
            TRANSPORT = "inproc"
            ACCEPT_BATCH = 8
            TCP_NODELAY = false
        "#;
        let parsed = parse_options_toml(text).unwrap();
        assert_eq!(
            parsed,
            opts(&[
                ("ACCEPT_BATCH", "8"),
                ("TCP_NODELAY", "n"),
                ("TRANSPORT", "inproc"),
            ])
        );
    }

    #[test]
    fn test_parse_options_toml_rejects_tables() {
        let text = "[options]\nNESTED = { a = 1 }\n";
        let err = parse_options_toml(text).unwrap_err();
        assert!(err.contains("NESTED"));
    }

    #[test]
    fn test_parse_options_toml_rejects_floats() {
        let text = "[options]\nACCEPT_BATCH = 1.5\n";
        let err = parse_options_toml(text).unwrap_err();
        assert!(err.contains("ACCEPT_BATCH"));
        assert!(err.contains("float"));
    }

    #[test]
    fn test_load_options_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[options]\nLISTEN_BACKLOG = 64").unwrap();

        let loaded = load_options_file(file.path()).unwrap();
        assert_eq!(loaded, opts(&[("LISTEN_BACKLOG", "64")]));
    }

    #[test]
    fn test_load_options_file_missing() {
        let result = load_options_file(Path::new("/nonexistent/commlink.toml"));
        assert!(matches!(result, Err(CommError::OptionsFile { .. })));
    }
}
