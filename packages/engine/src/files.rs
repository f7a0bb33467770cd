//! Host-side materialization of declared pipeline/step files.

use std::path::Path;

use crate::spec::File;

/// Creates every declared file (or directory) with its requested mode.
/// Parents are created as needed so containers can write into them.
pub fn create_files(files: &[File]) -> std::io::Result<()> {
    for file in files {
        let path = Path::new(&file.path);
        if file.is_dir {
            std::fs::create_dir_all(path)?;
        } else {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, file.data.as_bytes())?;
        }
        #[cfg(unix)]
        if file.mode != 0 {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(file.mode))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_files_and_directories_with_mode() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("engine/step1.out");
        let files = vec![
            File {
                path: out.to_string_lossy().into_owned(),
                mode: 0o777,
                is_dir: false,
                data: String::new(),
            },
            File {
                path: dir.path().join("ti").to_string_lossy().into_owned(),
                mode: 0o755,
                is_dir: true,
                data: String::new(),
            },
        ];

        create_files(&files).unwrap();

        assert!(out.exists());
        assert!(dir.path().join("ti").is_dir());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&out).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o777);
        }
    }
}
