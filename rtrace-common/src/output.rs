// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Output file naming shared by the pre- and post-processor.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

/// Creates `<dir>/<pid>-<n>.<suffix>` with the smallest `n` that does not
/// exist yet. `create_new` keeps concurrent tools from racing into the
/// same report file.
pub fn create_unique_file(dir: &Path, pid: u32, suffix: &str) -> io::Result<(File, PathBuf)> {
    for n in 0.. {
        let path = dir.join(format!("{pid}-{n}.{suffix}"));
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((file, path)),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(err),
        }
    }
    unreachable!("file index space exhausted");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_names_increment() {
        let dir = std::env::temp_dir().join(format!("rtrace-output-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let (_a, path_a) = create_unique_file(&dir, 42, "rtrace").unwrap();
        let (_b, path_b) = create_unique_file(&dir, 42, "rtrace").unwrap();
        assert!(path_a.ends_with("42-0.rtrace"));
        assert!(path_b.ends_with("42-1.rtrace"));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
