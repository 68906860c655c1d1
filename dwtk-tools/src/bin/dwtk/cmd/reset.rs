use crate::util::common_options::{with_session, OnClose};
use crate::Config;

#[derive(clap::Parser)]
pub struct Cmd {}

impl Cmd {
    pub fn run(self, config: &Config) -> anyhow::Result<()> {
        // Closing the session resets and resumes the target.
        with_session(config, OnClose::Resume, |_| Ok(()))
    }
}
