// Output file naming

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, Utc};

/// Container extension for capture output
pub const OUTPUT_EXTENSION: &str = "mkv";

/// Sanitize a camera or scenario name for use in paths.
/// Replaces spaces, slashes, backslashes, and colons with underscores.
pub fn sanitize_name(name: &str) -> String {
    let cleaned = name
        .trim()
        .replace(' ', "_")
        .replace('/', "_")
        .replace('\\', "_")
        .replace(':', "_");

    // "." and ".." would escape the storage folder
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "unnamed".to_string()
    } else {
        cleaned
    }
}

/// Reserve the file one capture launch writes:
/// `<storage>/<camera>/[<scenario>/]<YYYY-MM-DD_HH-MM-SS>_<camera_id>.mkv`,
/// local time.
///
/// The file is created empty with `create_new`, so no other launch (this
/// camera's reconnect or another camera with the same name) can be handed
/// the same path. A `_N` suffix is added until a free name is found.
pub fn reserve_output_path(
    storage: &Path,
    camera_id: &str,
    camera_name: &str,
    scenario_name: Option<&str>,
    now: DateTime<Utc>,
) -> io::Result<PathBuf> {
    let mut dir = storage.join(sanitize_name(camera_name));
    if let Some(scenario) = scenario_name.filter(|s| !s.trim().is_empty()) {
        dir = dir.join(sanitize_name(scenario));
    }
    fs::create_dir_all(&dir)?;

    let stem = format!(
        "{}_{}",
        now.with_timezone(&Local).format("%Y-%m-%d_%H-%M-%S"),
        sanitize_name(camera_id)
    );

    let mut n = 0;
    loop {
        let name = if n == 0 {
            format!("{}.{}", stem, OUTPUT_EXTENSION)
        } else {
            format!("{}_{}.{}", stem, n, OUTPUT_EXTENSION)
        };
        let path = dir.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => return Ok(path),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => n += 1,
            Err(e) => return Err(e),
        }
    }
}
