// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    appcontrol_simulate::{
        catalog::CatalogIndex,
        compute_file_hashes,
        error::AppControlSimError,
        policy::PolicyRules,
        simulation::{run_simulation, SimulationRequest},
    },
    clap::{Arg, ArgMatches, Command},
    log::LevelFilter,
    std::path::{Path, PathBuf},
};

fn path_values(args: &ArgMatches, name: &str) -> Vec<PathBuf> {
    args.values_of(name)
        .map(|values| values.map(PathBuf::from).collect())
        .unwrap_or_default()
}

fn command_simulate(args: &ArgMatches) -> Result<(), AppControlSimError> {
    let policy_path = args
        .value_of("policy")
        .ok_or(AppControlSimError::CliBadArgument)?;

    let threads = args
        .value_of("threads")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(2);

    let request = SimulationRequest {
        policy_path: PathBuf::from(policy_path),
        files: path_values(args, "file"),
        folders: path_values(args, "folder"),
        catalog_folders: path_values(args, "cat_root"),
        threads,
        csv_path: args.value_of("csv_output").map(PathBuf::from),
    };

    let progress = |percent: u8| {
        log::info!("progress: {}%", percent);
    };

    let results = run_simulation(&request, Some(&progress), None)?;

    if args.is_present("json") {
        let outputs = results.values().collect::<Vec<_>>();
        println!("{}", serde_json::to_string_pretty(&outputs)?);
    } else {
        let blocked = results.values().filter(|o| !o.is_authorized).count();

        for output in results.values() {
            println!(
                "{}: {} ({})",
                output.file_path.display(),
                if output.is_authorized {
                    "ALLOWED"
                } else {
                    "BLOCKED"
                },
                output.match_criteria
            );
        }

        println!(
            "{} files evaluated, {} allowed, {} blocked",
            results.len(),
            results.len() - blocked,
            blocked
        );
    }

    Ok(())
}

fn command_compute_hashes(args: &ArgMatches) -> Result<(), AppControlSimError> {
    let path = args
        .value_of("path")
        .ok_or(AppControlSimError::CliBadArgument)?;

    let hashes = compute_file_hashes(Path::new(path))?;

    println!("{}", serde_json::to_string_pretty(&hashes)?);

    Ok(())
}

fn command_extract_rules(args: &ArgMatches) -> Result<(), AppControlSimError> {
    let policy_path = args
        .value_of("policy")
        .ok_or(AppControlSimError::CliBadArgument)?;

    let rules = PolicyRules::from_file(Path::new(policy_path))?;

    println!("allow all: {}", rules.allow_all);
    println!("hash rules: {}", rules.hash_records.len());
    println!("file path rules: {}", rules.file_path_rules.len());
    println!("signers: {}", rules.signers.len());

    for signer in &rules.signers {
        println!(
            "  {} ({}) root={} scope={} {}",
            signer.id,
            signer.name,
            signer.cert_root,
            signer.scope.label(),
            if signer.is_allowed { "allow" } else { "deny" },
        );
    }

    Ok(())
}

fn command_scan_catalogs(args: &ArgMatches) -> Result<(), AppControlSimError> {
    let directories = path_values(args, "cat_root");

    let index = CatalogIndex::build(&directories)?;

    println!("{} catalogs indexed", index.catalog_count());

    Ok(())
}

fn main_impl() -> Result<(), AppControlSimError> {
    let app = Command::new("Application control policy simulation")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Evaluate which files an application control policy would allow or block")
        .arg_required_else_help(true)
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .global(true)
                .multiple_occurrences(true)
                .help("Increase logging verbosity. Can be specified multiple times."),
        );

    let app = app.subcommand(
        Command::new("simulate")
            .about("Simulate a policy against a set of files")
            .arg(
                Arg::new("policy")
                    .long("policy")
                    .takes_value(true)
                    .required(true)
                    .help("Path to the policy XML file"),
            )
            .arg(
                Arg::new("file")
                    .long("file")
                    .takes_value(true)
                    .multiple_occurrences(true)
                    .help("Candidate file to evaluate. Can be specified multiple times."),
            )
            .arg(
                Arg::new("folder")
                    .long("folder")
                    .takes_value(true)
                    .multiple_occurrences(true)
                    .help("Folder to scan recursively for candidate files"),
            )
            .arg(
                Arg::new("cat_root")
                    .long("cat-root")
                    .takes_value(true)
                    .multiple_occurrences(true)
                    .help("Directory holding security catalog files"),
            )
            .arg(
                Arg::new("threads")
                    .long("threads")
                    .takes_value(true)
                    .default_value("2")
                    .help("Number of worker threads"),
            )
            .arg(
                Arg::new("csv_output")
                    .long("csv-output")
                    .takes_value(true)
                    .help("Also export the verdicts as CSV to this path"),
            )
            .arg(
                Arg::new("json")
                    .long("json")
                    .help("Emit verdicts as JSON instead of text"),
            ),
    );

    let app = app.subcommand(
        Command::new("compute-hashes")
            .about("Compute the code integrity hashes of a file")
            .arg(
                Arg::new("path")
                    .required(true)
                    .help("Path to the file to hash"),
            ),
    );

    let app = app.subcommand(
        Command::new("extract-rules")
            .about("Print the rules extracted from a policy file")
            .arg(
                Arg::new("policy")
                    .required(true)
                    .help("Path to the policy XML file"),
            ),
    );

    let app = app.subcommand(
        Command::new("scan-catalogs")
            .about("Index security catalog directories and print a summary")
            .arg(
                Arg::new("cat_root")
                    .required(true)
                    .multiple_occurrences(true)
                    .help("Directory holding security catalog files"),
            ),
    );

    let matches = app.get_matches();

    let log_level = match matches.occurrences_of("verbose") {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(log_level.as_str()),
    );

    // Disable log context except at higher log levels.
    if log_level <= LevelFilter::Info {
        builder
            .format_timestamp(None)
            .format_level(false)
            .format_target(false);
    }

    builder.init();

    match matches.subcommand() {
        Some(("simulate", args)) => command_simulate(args),
        Some(("compute-hashes", args)) => command_compute_hashes(args),
        Some(("extract-rules", args)) => command_extract_rules(args),
        Some(("scan-catalogs", args)) => command_scan_catalogs(args),
        _ => Err(AppControlSimError::CliUnknownCommand),
    }
}

fn main() {
    let exit_code = match main_impl() {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("Error: {}", err);
            1
        }
    };

    std::process::exit(exit_code)
}
