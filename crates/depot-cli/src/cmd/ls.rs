use anyhow::{Context as _, Result};

use crate::ops::Context;
use crate::ui::buffer::OutputBuffer;
use crate::ui::list::print_path_row;

/// List every file stored for the fork's installed content version.
pub fn ls(ctx: &Context, fork: &str) -> Result<()> {
    let store = super::cat::open_fork_store(ctx, fork)?;
    let mut buffer = OutputBuffer::default();
    for path in store.paths() {
        let size = store
            .size_of(path)
            .with_context(|| format!("'{path}' vanished from the manifest"))?;
        print_path_row(&mut buffer, path, size);
    }
    buffer.flush();
    Ok(())
}
