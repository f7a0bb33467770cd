//! Output-variable extraction. Steps append `KEY<delim>VALUE` lines to a
//! file on the shared volume; the parser splits on the first delimiter so
//! values may contain it.

use std::collections::HashMap;
use std::path::Path;

use thiserror::Error;
use tracing::warn;

/// Longest accepted line; anything bigger fails the extraction.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

pub const DELIMITER_SPACE: char = ' ';
pub const DELIMITER_EQUALS: char = '=';

#[derive(Error, Debug)]
pub enum OutputError {
    #[error("output variable length is more than {MAX_LINE_BYTES} bytes")]
    TooLarge,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reads `KEY<delim>VALUE` lines. A missing file is not an error; lines
/// without the delimiter are skipped with a warning.
pub fn parse_output_file(
    path: impl AsRef<Path>,
    delimiter: char,
) -> Result<HashMap<String, String>, OutputError> {
    let path = path.as_ref();
    let mut outputs = HashMap::new();
    if !path.exists() {
        return Ok(outputs);
    }

    let content = std::fs::read_to_string(path)?;
    for line in content.lines() {
        if line.len() > MAX_LINE_BYTES {
            return Err(OutputError::TooLarge);
        }
        match line.split_once(delimiter) {
            Some((key, value)) => {
                outputs.insert(key.to_string(), value.to_string());
            }
            None => {
                if !line.is_empty() {
                    warn!(variable = line, "output variable has no value");
                }
            }
        }
    }
    Ok(outputs)
}

/// Lenient env-file parse (comments, quoting, export prefixes) with a
/// fallback to the strict line parser when the file does not survive it.
pub fn parse_env_file(path: impl AsRef<Path>) -> Result<HashMap<String, String>, OutputError> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(HashMap::new());
    }

    match dotenvy::from_path_iter(path) {
        Ok(iter) => {
            let mut outputs = HashMap::new();
            for item in iter {
                match item {
                    Ok((key, value)) => {
                        outputs.insert(key, value);
                    }
                    Err(err) => {
                        warn!(path = %path.display(), error = %err,
                            "env file did not parse cleanly, falling back to line parser");
                        return parse_output_file(path, DELIMITER_EQUALS);
                    }
                }
            }
            Ok(outputs)
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err,
                "could not open env file with the lenient parser");
            parse_output_file(path, DELIMITER_EQUALS)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(content: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("step.out");
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn splits_on_first_delimiter_only() {
        let (_dir, path) = write("K v with spaces\nURL http://host:80/a b\n");
        let outputs = parse_output_file(&path, DELIMITER_SPACE).unwrap();
        assert_eq!(outputs["K"], "v with spaces");
        assert_eq!(outputs["URL"], "http://host:80/a b");
    }

    #[test]
    fn values_may_contain_the_delimiter() {
        let (_dir, path) = write("K=a=b=c\n");
        let outputs = parse_output_file(&path, DELIMITER_EQUALS).unwrap();
        assert_eq!(outputs["K"], "a=b=c");
    }

    #[test]
    fn lines_without_delimiter_are_skipped() {
        let (_dir, path) = write("GOOD=1\nBROKEN\n");
        let outputs = parse_output_file(&path, DELIMITER_EQUALS).unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs["GOOD"], "1");
    }

    #[test]
    fn missing_file_yields_empty_map() {
        let dir = tempfile::tempdir().unwrap();
        let outputs = parse_output_file(dir.path().join("nope"), DELIMITER_SPACE).unwrap();
        assert!(outputs.is_empty());
    }

    #[test]
    fn oversized_lines_fail() {
        let big = format!("K={}\n", "x".repeat(MAX_LINE_BYTES + 1));
        let (_dir, path) = write(&big);
        assert!(matches!(
            parse_output_file(&path, DELIMITER_EQUALS),
            Err(OutputError::TooLarge)
        ));
    }

    #[test]
    fn env_file_supports_comments_and_quotes() {
        let (_dir, path) = write("# produced by plugin\nTOKEN=\"abc def\"\nPLAIN=1\n");
        let outputs = parse_env_file(&path).unwrap();
        assert_eq!(outputs["TOKEN"], "abc def");
        assert_eq!(outputs["PLAIN"], "1");
    }

    #[test]
    fn env_file_falls_back_to_line_parser() {
        // not valid dotenv (space in key), but the line parser accepts it
        let (_dir, path) = write("WEIRD KEY=value\n");
        let outputs = parse_env_file(&path).unwrap();
        assert_eq!(outputs["WEIRD KEY"], "value");
    }
}
