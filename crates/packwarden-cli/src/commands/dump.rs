//! Dump and render commands, answered by a running operator

use std::path::Path;

use crate::client;
use crate::error::Result;

pub const QUEUES: &str = "/packages/queues/dump";
pub const PACKAGES: &str = "/packages/dump";
pub const SCHEDULER: &str = "/packages/scheduler/dump";

pub fn render_path(name: &str) -> String {
    format!("/packages/render/{}", name)
}

/// Print the YAML body served at `path`
pub fn run(socket: &Path, path: &str) -> Result<()> {
    let body = client::get_ok(socket, path)?;
    print!("{}", body);
    if !body.ends_with('\n') {
        println!();
    }
    Ok(())
}
