//! `${VAR}` substitution for the router's YAML documents.
//!
//! Shard base URLs usually differ per environment, so the config and route spec may reference
//! environment variables that are rendered before parsing:
//! - `${NAME}`: value of `NAME`; an unset variable is an error.
//! - `${NAME:-fallback}`: value of `NAME`, or `fallback` if unset or empty.
//!
//! `NAME` must match `[A-Za-z_][A-Za-z0-9_]*`.

/// Render `input` using the process environment.
pub fn render_env_template(input: &str) -> anyhow::Result<String> {
    render_env_template_with(input, |name| std::env::var(name).ok())
}

/// Render `input`, resolving placeholders through `lookup`.
pub fn render_env_template_with(
    input: &str,
    mut lookup: impl FnMut(&str) -> Option<String>,
) -> anyhow::Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            anyhow::bail!("unterminated placeholder");
        };

        let placeholder = &after[..end];
        let (name, fallback) = match placeholder.split_once(":-") {
            Some((name, fallback)) => (name, Some(fallback)),
            None => (placeholder, None),
        };
        validate_env_name(name)?;

        match (lookup(name).filter(|v| !v.is_empty()), fallback) {
            (Some(value), _) => out.push_str(&value),
            (None, Some(fallback)) => out.push_str(fallback),
            (None, None) => anyhow::bail!("missing environment variable: {name}"),
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    Ok(out)
}

fn validate_env_name(name: &str) -> anyhow::Result<()> {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        anyhow::bail!("empty placeholder name");
    };
    if !(first.is_ascii_alphabetic() || first == '_')
        || !chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
    {
        anyhow::bail!("invalid placeholder name: {name}");
    }
    Ok(())
}
