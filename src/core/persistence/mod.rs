//! RDB-style snapshot persistence: the wire/file codec (`rdb`) and the
//! background auto-save ticker (`saver`).

pub mod rdb;
pub mod saver;

use std::path::PathBuf;

/// Resolves the on-disk RDB path from `--dir`/`--dbfilename`, per §6:
/// "file path is `<dir>/<name>.rdb`".
pub fn rdb_path(dir: &std::path::Path, dbfilename: &str) -> PathBuf {
    dir.join(format!("{dbfilename}.rdb"))
}
