//! CLI argument definitions for `busmix`.

use clap::{value_parser, Arg, ArgAction, Command};

/// Build the CLI argument parser and command definitions.
pub fn build_cli() -> Command {
    Command::new("busmix")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Render busmix scenes offline")
        .arg_required_else_help(true)
        .subcommand_required(true)
        .subcommand(
            Command::new("render")
                .about("Run a scene through the mix engine and report what happened")
                .arg(
                    Arg::new("SCENE")
                        .help("Path to a scene JSON file")
                        .required(true)
                        .index(1),
                )
                .arg(
                    Arg::new("ticks")
                        .long("ticks")
                        .short('t')
                        .value_name("COUNT")
                        .value_parser(value_parser!(u64))
                        .help("Number of device ticks to run (overrides the scene)"),
                )
                .arg(
                    Arg::new("report")
                        .long("report")
                        .short('r')
                        .value_name("FORMAT")
                        .value_parser(["json", "text"])
                        .default_value("text")
                        .help("Report format"),
                )
                .arg(
                    Arg::new("show-log")
                        .long("show-log")
                        .action(ArgAction::SetTrue)
                        .help("Print the engine log after the report"),
                ),
        )
        .subcommand(
            Command::new("create")
                .about("Emit default JSON payloads")
                .subcommand_required(true)
                .subcommand(
                    Command::new("scene-json").about("Print a template scene JSON payload"),
                ),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_parses_ticks_and_report() {
        let matches = build_cli()
            .try_get_matches_from(["busmix", "render", "scene.json", "--ticks", "12", "--report", "json"])
            .expect("parse");
        let (name, render) = matches.subcommand().expect("subcommand");
        assert_eq!(name, "render");
        assert_eq!(render.get_one::<u64>("ticks"), Some(&12));
        assert_eq!(render.get_one::<String>("report").map(String::as_str), Some("json"));
        assert!(!render.get_flag("show-log"));
    }

    #[test]
    fn unknown_report_formats_are_rejected() {
        assert!(build_cli()
            .try_get_matches_from(["busmix", "render", "scene.json", "--report", "xml"])
            .is_err());
    }
}
