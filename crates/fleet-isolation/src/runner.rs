use std::ffi::OsString;
use std::io;
use std::process::Output;

use async_trait::async_trait;

/// Seam between the isolator and the git binary so tests can script outputs.
///
/// Subprocess execution suspends the calling task, never the process.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[OsString]) -> io::Result<Output>;
}

#[derive(Debug, Default)]
pub struct ProcessCommandRunner;

#[async_trait]
impl CommandRunner for ProcessCommandRunner {
    async fn run(&self, program: &str, args: &[OsString]) -> io::Result<Output> {
        tokio::process::Command::new(program)
            .args(args)
            .output()
            .await
    }
}
