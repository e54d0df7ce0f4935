//! Property system client. Reads and writes go through the resident
//! property tooling; only the prop-file parsing lives here.

use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result};

const RESETPROP_BIN: &str = "/sbin/resetprop";

pub fn getprop(name: &str) -> Option<String> {
    let output = Command::new("getprop").arg(name).output().ok()?;
    let value = String::from_utf8(output.stdout).ok()?.trim().to_string();
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

pub fn setprop(name: &str, value: &str) {
    // resetprop can write read-only props; fall back to plain setprop
    let bin = if Path::new(RESETPROP_BIN).exists() {
        RESETPROP_BIN
    } else {
        "setprop"
    };
    match Command::new(bin).arg(name).arg(value).status() {
        Ok(status) if status.success() => {}
        Ok(status) => log::warn!("setprop {name}: exit {status}"),
        Err(e) => log::warn!("setprop {name}: {e}"),
    }
}

/// Parses `key=value` lines; comments and blank lines are skipped, values
/// keep embedded `=` characters.
pub fn parse_prop_file(content: &str) -> Vec<(String, String)> {
    let mut props = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            if !key.is_empty() {
                props.push((key.to_string(), value.trim().to_string()));
            }
        }
    }
    props
}

pub fn load_prop_file<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("read {}", path.display()))?;
    for (key, value) in parse_prop_file(&content) {
        setprop(&key, &value);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_values_with_equals() {
        let props = parse_prop_file("ro.foo=a=b\n");
        assert_eq!(props, vec![("ro.foo".into(), "a=b".into())]);
    }

    #[test]
    fn skips_comments_and_blanks() {
        let content = "# comment\n\n  \nro.a=1\n   ro.b = 2\nbroken-line\n=novalue\n";
        let props = parse_prop_file(content);
        assert_eq!(
            props,
            vec![("ro.a".into(), "1".into()), ("ro.b".into(), "2".into())]
        );
    }
}
