//! Shell-dialect generation for the output-variable suffix appended to a
//! step's command. The suffix makes the step's own shell emit each named
//! variable into the output file on the shared volume.

use crate::output::{DELIMITER_EQUALS, DELIMITER_SPACE};

/// The dialect is inferred from the step entrypoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellKind {
    Posix,
    Powershell,
    Python,
}

impl ShellKind {
    pub fn from_entrypoint(entrypoint: &[String]) -> Self {
        match entrypoint.first().map(String::as_str) {
            Some("powershell") | Some("pwsh") => ShellKind::Powershell,
            Some("python3") => ShellKind::Python,
            _ => ShellKind::Posix,
        }
    }

    fn prelude(&self, output_file: &str) -> String {
        match self {
            ShellKind::Powershell => format!("\nNew-Item {output_file}"),
            ShellKind::Python => "\nimport os\n".to_string(),
            ShellKind::Posix => String::new(),
        }
    }

    fn export(&self, key: &str, env_name: &str, delimiter: char, output_file: &str) -> String {
        match self {
            ShellKind::Posix => {
                format!("\necho \"{key}{delimiter}${env_name}\" >> {output_file}")
            }
            ShellKind::Powershell => format!(
                "\n$val = \"{key}{delimiter}$Env:{env_name}\" \nAdd-Content -Path {output_file} -Value $val"
            ),
            ShellKind::Python => format!(
                "with open('{output_file}', 'a') as out_file:\n\tout_file.write('{key}{delimiter}' + os.getenv('{env_name}') + '\\n')\n"
            ),
        }
    }
}

/// Builds the command suffix that writes `key<delim>$env` lines for every
/// pair. Dot-env mode uses `=` as the delimiter, space otherwise.
pub fn export_commands(
    entrypoint: &[String],
    vars: &[(String, String)],
    output_file: &str,
    dotenv: bool,
) -> String {
    if vars.is_empty() {
        return String::new();
    }
    let shell = ShellKind::from_entrypoint(entrypoint);
    let delimiter = if dotenv {
        DELIMITER_EQUALS
    } else {
        DELIMITER_SPACE
    };

    let mut cmd = shell.prelude(output_file);
    for (key, env_name) in vars {
        cmd.push_str(&shell.export(key, env_name, delimiter, output_file));
    }
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    fn pairs(names: &[&str]) -> Vec<(String, String)> {
        names
            .iter()
            .map(|n| (n.to_string(), n.to_string()))
            .collect()
    }

    #[test]
    fn posix_appends_echo_redirects() {
        let cmd = export_commands(
            &entry(&["/bin/sh", "-c"]),
            &pairs(&["K", "V2"]),
            "/tmp/engine/st1.out",
            false,
        );
        assert_eq!(
            cmd,
            "\necho \"K $K\" >> /tmp/engine/st1.out\necho \"V2 $V2\" >> /tmp/engine/st1.out"
        );
    }

    #[test]
    fn dotenv_mode_switches_the_delimiter() {
        let cmd = export_commands(
            &entry(&["sh"]),
            &pairs(&["K"]),
            "/tmp/engine/st1-output.env",
            true,
        );
        assert!(cmd.contains("\"K=$K\""));
    }

    #[test]
    fn powershell_uses_add_content() {
        let cmd = export_commands(
            &entry(&["powershell"]),
            &pairs(&["K"]),
            "C:\\out.env",
            true,
        );
        assert!(cmd.starts_with("\nNew-Item C:\\out.env"));
        assert!(cmd.contains("Add-Content -Path C:\\out.env -Value $val"));
        assert!(cmd.contains("$Env:K"));
    }

    #[test]
    fn python_writes_with_os_getenv() {
        let cmd = export_commands(&entry(&["python3"]), &pairs(&["K"]), "/tmp/o", false);
        assert!(cmd.starts_with("\nimport os\n"));
        assert!(cmd.contains("os.getenv('K')"));
    }

    #[test]
    fn renamed_outputs_export_under_their_key() {
        let vars = vec![("exposed".to_string(), "INTERNAL".to_string())];
        let cmd = export_commands(&entry(&["sh"]), &vars, "/tmp/o", true);
        assert!(cmd.contains("\"exposed=$INTERNAL\""));
    }

    #[test]
    fn no_vars_is_a_no_op() {
        assert!(export_commands(&entry(&["sh"]), &[], "/tmp/o", false).is_empty());
    }
}
