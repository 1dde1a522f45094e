use crate::pool::StemTask;
use crate::SUPPORTED_EXTENSIONS;
use std::path::Path;
use walkdir::WalkDir;

/// Collect every supported audio file under `data_dir` as a task.
///
/// Stem identifiers are paths relative to `data_dir` with `/` separators, so
/// cache keys survive moving the data root. Output is sorted by identifier.
pub fn collect_stems(data_dir: &Path) -> std::io::Result<Vec<StemTask>> {
    if !data_dir.is_dir() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("data directory {} does not exist", data_dir.display()),
        ));
    }

    let mut tasks = Vec::new();
    for entry in WalkDir::new(data_dir)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| match e {
            Ok(entry) => Some(entry),
            Err(err) => {
                log::warn!("Skipping unreadable entry: {}", err);
                None
            }
        })
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let ext = entry
            .path()
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();
        if !SUPPORTED_EXTENSIONS.contains(&ext.as_str()) {
            continue;
        }

        let Ok(relative) = entry.path().strip_prefix(data_dir) else {
            continue;
        };
        let stem_id = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        tasks.push(StemTask::new(stem_id, entry.path()));
    }

    tasks.sort_by(|a, b| a.stem_id.cmp(&b.stem_id));
    log::info!("Found {} stems under {}", tasks.len(), data_dir.display());
    Ok(tasks)
}
