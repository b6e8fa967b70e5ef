use anyhow::Result;

use crate::ops::Context;
use crate::ui::buffer::OutputBuffer;
use crate::ui::list::{print_engine_row, print_list_footer, print_list_header, print_list_row};

/// List installed forks and engines
pub fn list(ctx: &Context) -> Result<()> {
    let state = ctx.state.snapshot();
    let mut buffer = OutputBuffer::default();

    if state.installations.is_empty() && state.engines.is_empty() {
        println!();
        println!("  Nothing installed.");
        println!("  Run 'depot update --fork <id> ...' to get started.");
        return Ok(());
    }

    print_list_header(&mut buffer);
    for installed in state.installations.values() {
        print_list_row(
            &mut buffer,
            &installed.fork_id,
            &installed.current_version,
            installed.current_engine_version.as_str(),
            installed.disk_id,
            installed.content_version_id,
        );
    }

    if !state.engines.is_empty() {
        buffer.write_plain("");
        for version in state.engines.keys() {
            let size = std::fs::metadata(ctx.paths.engine_zip(version))
                .ok()
                .map(|m| m.len());
            let in_use = state
                .installations
                .values()
                .any(|i| &i.current_engine_version == version);
            print_engine_row(&mut buffer, version.as_str(), size, in_use);
        }
    }

    print_list_footer(&mut buffer, state.installations.len(), state.engines.len());
    buffer.flush();
    Ok(())
}
