use clap::ArgMatches;

use crate::error::CliError;
use crate::scene::Scene;

/// Handle `busmix create ...`.
pub fn run(args: &ArgMatches) -> Result<i32, CliError> {
    match args.subcommand() {
        Some(("scene-json", _)) => {
            let json = serde_json::to_string_pretty(&Scene::template())?;
            println!("{}", json);
            Ok(0)
        }
        _ => Ok(2),
    }
}
