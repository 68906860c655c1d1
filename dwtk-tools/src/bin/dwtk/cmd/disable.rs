use crate::util::common_options::{with_session, OnClose};
use crate::Config;

#[derive(clap::Parser)]
pub struct Cmd {}

impl Cmd {
    pub fn run(self, config: &Config) -> anyhow::Result<()> {
        with_session(config, OnClose::Halt, |dw| Ok(dw.disable()?))?;

        println!("debugWIRE is disabled until the next power cycle. ISP can be used now.");
        Ok(())
    }
}
