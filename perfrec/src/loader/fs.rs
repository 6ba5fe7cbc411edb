use crate::config::ConfigErrors;
use globset::GlobBuilder;
use ignore::{DirEntry, WalkBuilder};
use itertools::Itertools;
use once_cell::sync::Lazy;
use std::{
    ffi::OsString,
    fs, io,
    os::unix::prelude::OsStrExt,
    path::{Path, PathBuf},
};
use tracing::debug;

/// Prefix of logs that were merged successfully
pub static DONE_PREFIX: Lazy<OsString> = Lazy::new(|| {
    let mut string = OsString::new();
    string.push("[done]_");
    string
});

pub fn is_done(path: &Path) -> bool {
    path.file_name()
        .map_or(false, |name| name.as_bytes().starts_with(DONE_PREFIX.as_bytes()))
}

/// Path the log is moved to once merged
pub fn done_path(path: &Path) -> Option<PathBuf> {
    let mut done_file_name = DONE_PREFIX.clone();
    done_file_name.push(path.file_name()?);

    Some(path.with_file_name(done_file_name))
}

pub fn mark_done(path: &Path) -> io::Result<PathBuf> {
    let target = done_path(path).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "log path has no file name")
    })?;

    fs::rename(path, &target)?;
    debug!(path = ?path, done_path = ?target, "Marked log as merged");

    Ok(target)
}

/// Pattern with leading `./` components removed, walked paths below `.` carry none either
pub(crate) fn trim_current_dir(pattern: &str) -> &str {
    let mut pattern = pattern;
    while let Some(rest) = pattern.strip_prefix("./") {
        pattern = rest.trim_start_matches('/');
    }

    pattern
}

/// Directory the walk starts from: the literal part of the pattern up to its last separator
fn walk_root(pattern: &str) -> PathBuf {
    let literal = pattern
        .find(|c| matches!(c, '*' | '?' | '[' | '{'))
        .map_or(pattern, |end| &pattern[..end]);

    match literal.rfind('/') {
        Some(0) => PathBuf::from("/"),
        Some(end) => PathBuf::from(&pattern[..end]),
        None => PathBuf::from("."),
    }
}

/// All not yet merged files matching `pattern`, sorted by path.
///
/// `*` does not cross directory separators, so `run.*.log` only finds logs in the working
/// directory while `runs/**/*.log` descends.
pub fn discover(pattern: &str) -> Result<Vec<PathBuf>, ConfigErrors> {
    let pattern = trim_current_dir(pattern);
    let glob = GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()?
        .compile_matcher();
    let root = walk_root(pattern);
    let relative = root == Path::new(".");

    debug!(root = ?root, "Discovering logs with glob: {glob:?}");

    let paths = WalkBuilder::new(&root)
        .standard_filters(false)
        .build()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().map_or(false, |kind| kind.is_file()))
        .map(DirEntry::into_path)
        .map(|path| {
            let stripped = relative
                .then(|| path.strip_prefix(".").ok().map(Path::to_path_buf))
                .flatten();

            stripped.unwrap_or(path)
        })
        .filter(|path| glob.is_match(path) && !is_done(path))
        .sorted()
        .collect_vec();

    debug!(found = paths.len(), "Discovered logs");

    Ok(paths)
}
