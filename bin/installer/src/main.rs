use colored::Colorize;

use crate::config::{Command, cli_args};

#[macro_use]
extern crate tracing;

mod config;
mod error;
mod helpers;
mod install;
mod uninstall;

async fn app() -> anyhow::Result<()> {
  match &cli_args().command {
    Command::Install(args) => {
      let config = config::init_install_config(args)?;
      logger::init(&config.logging)?;
      install::run(config).await?;
      Ok(())
    }
    Command::Uninstall => {
      logger::init(&Default::default())?;
      uninstall::run().await
    }
  }
}

#[tokio::main]
async fn main() {
  dotenvy::dotenv().ok();

  if let Err(e) = app().await {
    // Final line: a single sentence naming what failed.
    eprintln!("{} {e:#}", "FATAL".red().bold());
    std::process::exit(1);
  }
}
