// Copyright 2019 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::process::ExitCode;

use clap::{CommandFactory, Parser, Subcommand};
use tokio::runtime;

use minium::app::AppRegistry;
use minium::config::ServeArgs;
use minium::procs::{Process, Supervisor, Worker, WorkerArgs};
use minium::{exit, Error};

#[derive(Debug, Parser)]
#[command(name = env!("CARGO_PKG_NAME"), version, author, about)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve an application from a pool of worker processes
    #[command(name = "serve")]
    Serve(ServeArgs),
    /// A single worker of the pool, started by `serve`
    #[command(name = "worker", hide = true)]
    Worker(WorkerArgs),
}

fn main() -> ExitCode {
    // values from .env become defaults for the MINIUM_* arguments
    dotenv::dotenv().ok();

    let args = Cli::parse();
    let command = match args.command {
        Some(command) => command,
        None => {
            eprintln!("command required");
            eprintln!("{}", Cli::command().render_usage());
            return ExitCode::from(exit::USAGE);
        }
    };

    // one event loop per process, parallelism comes from the number of workers
    let runtime = match runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to initialize Tokio Runtime: {}", e);
            return ExitCode::from(exit::FAILURE);
        }
    };

    let registry = AppRegistry::builtin();
    let result: Result<(), Error> = runtime.block_on(async move {
        match command {
            Command::Serve(args) => Supervisor::new(registry).run(args).await,
            Command::Worker(args) => Worker::new(registry).run(args).await,
        }
    });

    match result {
        Ok(()) => ExitCode::from(exit::OK),
        Err(e) => {
            eprintln!("{}: {}", env!("CARGO_PKG_NAME"), e);
            ExitCode::from(e.exit_code())
        }
    }
}
