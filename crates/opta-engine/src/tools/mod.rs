pub mod read_file;
pub mod write_file;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::registry::ToolRegistry;

/// Registry with the built-in file tools.
pub fn create_default_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(read_file::ReadFileTool));
    registry.register(Arc::new(write_file::WriteFileTool));
    registry
}

pub(crate) fn resolve_path(file_path: &str, working_dir: &Path) -> PathBuf {
    let path = Path::new(file_path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        working_dir.join(path)
    }
}
