pub mod compile;

use crate::cli::args::{Cli, Commands};

pub async fn dispatch(cli: Cli) -> anyhow::Result<i32> {
    match cli.command {
        Commands::Compile(args) => compile::run(args).await,
    }
}
