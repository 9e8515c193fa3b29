use std::process;

use clap::Parser;
use encryptkey_cli::{actions::encryptkey::EncryptKeyAction, error::CliError};
use encryptkey_logger::log_init;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    action: EncryptKeyAction,

    /// Log filter, `RUST_LOG` syntax
    #[arg(long)]
    rust_log: Option<String>,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = i32::from(e.use_stderr());
            if let Err(print_error) = e.print() {
                eprintln!("ERROR: {print_error}");
            }
            process::exit(code);
        }
    };
    if let Some(err) = main_(&cli).err() {
        eprintln!("ERROR: {err}");
        process::exit(1);
    }
}

fn main_(cli: &Cli) -> Result<(), CliError> {
    log_init(cli.rust_log.as_deref());
    cli.action.run()
}
