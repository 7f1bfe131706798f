use clap::Parser;
use std::process::ExitCode;
use warden::cli::output::print_error;
use warden::cli::{Cli, Context, Exit};
use warden::logging::{init_logging, init_logging_simple};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let ctx = match Context::load(&cli.global) {
        Ok(ctx) => ctx,
        Err(e) => {
            init_logging_simple();
            print_error(&format!("{e:#}"));
            return ExitCode::from(Exit::Unhealthy.code());
        }
    };

    if cli.command.is_long_running() {
        init_logging(&ctx.config.logging);
    } else {
        init_logging_simple();
    }

    let exit = match cli.command.run(ctx).await {
        Ok(exit) => exit,
        Err(e) => {
            print_error(&format!("{e:#}"));
            Exit::from_error(&e)
        }
    };
    ExitCode::from(exit.code())
}
