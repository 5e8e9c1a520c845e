mod test_config;

use std::io::Write;
use tempfile::NamedTempFile;

/// Write `contents` to a temp file whose name ends in `suffix`.
pub(super) fn temp_file(suffix: &str, contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("create temp file");
    file.write_all(contents.as_bytes()).expect("write temp file");
    file
}

pub(super) fn path(file: &NamedTempFile) -> &str {
    file.path().to_str().expect("utf-8 temp path")
}

pub(super) fn tablet_code(err: &anyhow::Error) -> tablet_error::ErrorCode {
    err.downcast_ref::<tablet_error::TabletError>()
        .expect("a tablet error")
        .code
}
