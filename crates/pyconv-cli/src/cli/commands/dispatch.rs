use super::super::args::{Cli, Command};
use crate::exit_codes::SUCCESS;

pub async fn dispatch(cli: Cli) -> anyhow::Result<i32> {
    let global = cli.global;
    match cli.cmd {
        Command::Convert(args) => super::convert::run(args, &global).await,
        Command::Detect(args) => super::detect::run(args).await,
        Command::Magic(args) => super::magic::run(args, &global),
        Command::Info(args) => super::info::run(args, &global).await,
        Command::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(SUCCESS)
        }
    }
}
