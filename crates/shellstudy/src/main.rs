use anyhow::Result;
use clap::Parser;

mod cli;
mod commands;

#[tokio::main]
async fn main() -> Result<()> {
    let parsed = cli::Cli::parse();

    match parsed.dispatch().await {
        Ok(()) => Ok(()),
        Err(err) => {
            // Commands that already printed their result signal failure through the exit code
            if let Some(exit) = err.downcast_ref::<commands::ExitCode>() {
                std::process::exit(exit.0);
            }
            Err(err)
        }
    }
}
