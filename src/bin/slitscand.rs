use clap::Parser;

use slitscan::{Cli, Config, Engine};

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let config: Config = cli.into();

    let mut engine = Engine::new(config)?;
    engine.run()?;

    Ok(())
}
