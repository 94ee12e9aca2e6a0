use clap::Parser;
use sigtrader::cli::{Cli, run};
use sigtrader::logging::{init_json_logging, init_logging};

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    if cli.json_logs {
        init_json_logging();
    } else {
        init_logging();
    }
    run(cli)
}
