// build.rs

use clap::{Arg, ArgAction, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

const DEFAULT_DB_PATH: &str = "/var/lib/pkgtx/pkgtx.db";

fn db_path_arg() -> Arg {
    Arg::new("db_path")
        .short('d')
        .long("db-path")
        .value_name("PATH")
        .default_value(DEFAULT_DB_PATH)
        .help("Database path")
}

fn flag(name: &'static str, help: &'static str) -> Arg {
    Arg::new(name).long(name).action(ArgAction::SetTrue).help(help)
}

fn transaction_args(cmd: Command) -> Command {
    cmd.arg(
        Arg::new("root")
            .short('r')
            .long("root")
            .default_value("/")
            .help("Install root directory"),
    )
    .arg(flag("test", "Check and classify only; change nothing"))
    .arg(flag("noscripts", "Do not run scriptlets"))
    .arg(flag("notriggers", "Do not run triggers"))
    .arg(flag("excludedocs", "Do not install documentation files"))
    .arg(flag("replacefiles", "Ignore file conflicts"))
    .arg(flag("replacepkgs", "Reinstall packages that are already installed"))
    .arg(flag("oldpackage", "Allow installing an older version over a newer one"))
    .arg(flag("ignorearch", "Ignore architecture mismatches"))
    .arg(flag("ignoreos", "Ignore operating system mismatches"))
    .arg(flag("ignoresize", "Skip the disk space check"))
    .arg(flag("rollback", "Undo the applied part of the transaction if any package fails"))
    .arg(flag("repackage", "Save erased packages before removing them"))
    .arg(
        Arg::new("script_log")
            .long("script-log")
            .value_name("PATH")
            .help("Scriptlet output file"),
    )
}

fn build_cli() -> Command {
    Command::new("pkgtx")
        .version(env!("CARGO_PKG_VERSION"))
        .author("pkgtx Contributors")
        .about("Package transaction engine with file conflict resolution and rollback")
        .subcommand_required(false)
        .subcommand(
            Command::new("init")
                .about("Initialize the package database")
                .arg(db_path_arg()),
        )
        .subcommand(transaction_args(
            Command::new("install")
                .about("Install packages (RPM or native format)")
                .arg(
                    Arg::new("packages")
                        .required(true)
                        .num_args(1..)
                        .help("Package files"),
                )
                .arg(
                    Arg::new("upgrade")
                        .short('U')
                        .long("upgrade")
                        .action(ArgAction::SetTrue)
                        .help("Also erase installed versions of the same packages"),
                )
                .arg(
                    Arg::new("relocate")
                        .long("relocate")
                        .value_name("OLD=NEW")
                        .action(ArgAction::Append)
                        .help("Relocate files under OLD to NEW"),
                )
                .arg(db_path_arg()),
        ))
        .subcommand(transaction_args(
            Command::new("erase")
                .about("Erase installed packages")
                .arg(
                    Arg::new("names")
                        .required(true)
                        .num_args(1..)
                        .help("Package names"),
                )
                .arg(db_path_arg()),
        ))
        .subcommand(
            Command::new("query")
                .about("Query installed packages")
                .arg(Arg::new("name").help("Package name (shows all if omitted)"))
                .arg(
                    Arg::new("file")
                        .short('f')
                        .long("file")
                        .help("Show the packages owning a path instead"),
                )
                .arg(db_path_arg()),
        )
        .subcommand(
            Command::new("history")
                .about("Show transaction history")
                .arg(db_path_arg()),
        )
        .subcommand(
            Command::new("completions")
                .about("Generate shell completion scripts")
                .arg(
                    Arg::new("shell")
                        .required(true)
                        .value_parser(["bash", "elvish", "fish", "powershell", "zsh"])
                        .help("Shell type"),
                ),
        )
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let out_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let man_dir = out_dir.join("man");
    fs::create_dir_all(&man_dir).expect("Failed to create man directory");

    let cmd = build_cli();
    let man = Man::new(cmd);
    let mut buffer = Vec::new();
    man.render(&mut buffer)
        .expect("Failed to render man page");

    let man_path = man_dir.join("pkgtx.1");
    fs::write(&man_path, buffer).expect("Failed to write man page");
}
