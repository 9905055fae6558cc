//! Invoking the configured external ZIP command safely.
//!
//! `ZIP_COMMAND` is a shell command template with `{input}` and `{output}`
//! placeholders. We tokenise the template with POSIX shell-style quoting
//! *before* substituting the placeholders, so a value with spaces or shell
//! metacharacters in it can never be reinterpreted by the shell.

use std::path::Path;

use crate::error::PackageError;
use crate::prelude::*;

/// Run `command_template` once, appending `input` into `output`. Returns
/// [`PackageError::ArchiveError`] if the process exits non-zero or can't
/// be spawned.
#[instrument(skip(command_template), level = "debug")]
pub async fn append_to_archive(
    command_template: &str,
    input: &Path,
    output: &Path,
) -> Result<()> {
    let tokens = shell_words::split(command_template)
        .with_context(|| format!("could not tokenise zip command {command_template:?}"))?;
    let (program, args) = tokens
        .split_first()
        .ok_or_else(|| format_err!("zip command is empty"))?;

    let substituted: Vec<String> = args
        .iter()
        .map(|arg| substitute(arg, input, output))
        .collect();

    let status = tokio::process::Command::new(program)
        .args(&substituted)
        .status()
        .await
        .map_err(|e| PackageError::ArchiveError(format!("could not spawn {program}: {e}")))?;

    if !status.success() {
        return Err(PackageError::ArchiveError(format!(
            "{program} exited with {status}"
        ))
        .into());
    }
    Ok(())
}

fn substitute(token: &str, input: &Path, output: &Path) -> String {
    token
        .replace("{input}", &input.to_string_lossy())
        .replace("{output}", &output.to_string_lossy())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitute_replaces_both_placeholders() {
        let out = substitute("{input}->{output}", Path::new("/a b/in.csv"), Path::new("/out.zip"));
        assert_eq!(out, "/a b/in.csv->/out.zip");
    }

    #[tokio::test]
    async fn nonzero_exit_is_archive_error() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.csv");
        std::fs::write(&input, b"a,b\n1,2\n").unwrap();
        let output = dir.path().join("out.zip");

        let err = append_to_archive("false {input} {output}", &input, &output)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("archive error"));
    }

    #[tokio::test]
    async fn zero_exit_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.csv");
        std::fs::write(&input, b"a,b\n1,2\n").unwrap();
        let output = dir.path().join("out.zip");

        append_to_archive("true {input} {output}", &input, &output)
            .await
            .unwrap();
    }
}
