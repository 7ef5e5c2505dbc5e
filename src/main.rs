// src/main.rs

use anyhow::Result;
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use pkgtx::db::models::{Changeset, InstalledFile, InstalledPackage};
use pkgtx::package::split_path;
use pkgtx::progress::LogCallback;
use pkgtx::transaction::element::Relocation;
use pkgtx::{Transaction, TransactionConfig};
use std::path::PathBuf;
use tracing::info;

const DEFAULT_DB_PATH: &str = "/var/lib/pkgtx/pkgtx.db";

#[derive(Parser)]
#[command(name = "pkgtx")]
#[command(author, version, about = "Package transaction engine with file conflict resolution and rollback", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

/// Options shared by every command that runs a transaction
#[derive(Args, Debug)]
struct TransactionArgs {
    /// Install root directory
    #[arg(short, long, default_value = "/")]
    root: PathBuf,
    /// Check and classify only; change nothing
    #[arg(long)]
    test: bool,
    /// Do not run scriptlets
    #[arg(long)]
    noscripts: bool,
    /// Do not run triggers
    #[arg(long)]
    notriggers: bool,
    /// Do not install documentation files
    #[arg(long)]
    excludedocs: bool,
    /// Ignore file conflicts
    #[arg(long)]
    replacefiles: bool,
    /// Reinstall packages that are already installed
    #[arg(long)]
    replacepkgs: bool,
    /// Allow installing an older version over a newer one
    #[arg(long)]
    oldpackage: bool,
    #[arg(long)]
    ignorearch: bool,
    #[arg(long)]
    ignoreos: bool,
    /// Skip the disk space check
    #[arg(long)]
    ignoresize: bool,
    /// Undo the applied part of the transaction if any package fails
    #[arg(long)]
    rollback: bool,
    /// Save erased packages before removing them
    #[arg(long)]
    repackage: bool,
    /// Scriptlet output file (inherited when unset)
    #[arg(long, value_name = "PATH")]
    script_log: Option<PathBuf>,
}

impl TransactionArgs {
    fn to_config(&self) -> TransactionConfig {
        let mut config = TransactionConfig::with_root(&self.root);
        config.flags.test = self.test;
        config.flags.no_scripts = self.noscripts;
        config.flags.no_triggers = self.notriggers;
        config.flags.no_docs = self.excludedocs;
        config.flags.rollback_on_failure = self.rollback;
        config.flags.repackage = self.repackage;
        config.filter.replace_new_files = self.replacefiles;
        config.filter.replace_old_files = self.replacefiles;
        config.filter.replace_pkg = self.replacepkgs;
        config.filter.old_package = self.oldpackage;
        config.filter.ignore_arch = self.ignorearch;
        config.filter.ignore_os = self.ignoreos;
        config.filter.disk_space = self.ignoresize;
        config.filter.disk_nodes = self.ignoresize;
        config.script_log = self.script_log.clone();
        config
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the package database
    Init {
        /// Database path
        #[arg(short, long, default_value = DEFAULT_DB_PATH)]
        db_path: String,
    },
    /// Install packages (RPM or native format)
    Install {
        /// Package files
        #[arg(required = true)]
        packages: Vec<PathBuf>,
        /// Upgrade: also erase installed versions of the same packages
        #[arg(short = 'U', long)]
        upgrade: bool,
        /// Relocate files under OLD to NEW
        #[arg(long, value_name = "OLD=NEW")]
        relocate: Vec<String>,
        /// Database path
        #[arg(short, long, default_value = DEFAULT_DB_PATH)]
        db_path: String,
        #[command(flatten)]
        options: TransactionArgs,
    },
    /// Erase installed packages
    Erase {
        /// Package names
        #[arg(required = true)]
        names: Vec<String>,
        /// Database path
        #[arg(short, long, default_value = DEFAULT_DB_PATH)]
        db_path: String,
        #[command(flatten)]
        options: TransactionArgs,
    },
    /// Query installed packages
    Query {
        /// Package name (shows all if omitted)
        name: Option<String>,
        /// Show the packages owning a path instead
        #[arg(short, long)]
        file: Option<String>,
        /// Database path
        #[arg(short, long, default_value = DEFAULT_DB_PATH)]
        db_path: String,
    },
    /// Show transaction history
    History {
        /// Database path
        #[arg(short, long, default_value = DEFAULT_DB_PATH)]
        db_path: String,
    },
    /// Generate shell completion scripts
    Completions {
        /// Shell type
        shell: Shell,
    },
}

/// Run a prepared transaction and print its outcome
fn run_transaction(mut tx: Transaction, db_path: &str) -> Result<()> {
    let mut conn = pkgtx::db::open(db_path)?;
    let report = tx.run(&mut conn, &mut LogCallback)?;

    for problem in &report.problems {
        eprintln!("  {}", problem);
    }
    if report.aborted {
        return Err(anyhow::anyhow!(
            "Transaction aborted: {} problem(s) found",
            report.problems.len()
        ));
    }

    println!(
        "{} element(s) completed, {} failed, {} skipped",
        report.completed, report.failed, report.linked_skipped
    );
    if report.rolled_back {
        println!("Applied elements were rolled back");
    }
    if !report.success() {
        return Err(anyhow::anyhow!("Transaction {} did not complete", tx.tid()));
    }
    Ok(())
}

fn main() -> Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Init { db_path }) => {
            info!("Initializing package database at: {}", db_path);
            pkgtx::db::init(&db_path)?;
            println!("Database initialized successfully at: {}", db_path);
            Ok(())
        }
        Some(Commands::Install {
            packages,
            upgrade,
            relocate,
            db_path,
            options,
        }) => {
            let relocations = relocate
                .iter()
                .map(|arg| {
                    Relocation::parse(arg)
                        .ok_or_else(|| anyhow::anyhow!("Invalid relocation '{}', expected OLD=NEW", arg))
                })
                .collect::<Result<Vec<_>>>()?;

            let conn = pkgtx::db::open(&db_path)?;
            let mut tx = Transaction::new(options.to_config());
            for path in &packages {
                info!("Adding package: {}", path.display());
                let id = if upgrade {
                    tx.add_upgrade(&conn, path)?
                } else {
                    tx.add_install(path)?
                };
                if let Some(element) = tx.element_mut(id) {
                    element.relocations.extend(relocations.iter().cloned());
                }
            }
            drop(conn);

            run_transaction(tx, &db_path)
        }
        Some(Commands::Erase {
            names,
            db_path,
            options,
        }) => {
            let conn = pkgtx::db::open(&db_path)?;
            let mut tx = Transaction::new(options.to_config());
            for name in &names {
                tx.add_erase_name(&conn, name)?;
            }
            drop(conn);

            run_transaction(tx, &db_path)
        }
        Some(Commands::Query { name, file, db_path }) => {
            let conn = pkgtx::db::open(&db_path)?;

            if let Some(path) = file {
                let (dirname, basename) = split_path(&path);
                let owners = InstalledFile::find_by_path(&conn, &dirname, &basename)?;
                if owners.is_empty() {
                    println!("{} is not owned by any package", path);
                }
                for owner in &owners {
                    if let Some(package) = InstalledPackage::find_by_instance(&conn, owner.instance)? {
                        println!("{} ({:?})", package.header.nevra(), owner.state);
                    }
                }
                return Ok(());
            }

            let packages = match name {
                Some(name) => InstalledPackage::find_by_name(&conn, &name)?,
                None => InstalledPackage::list_all(&conn)?,
            };
            if packages.is_empty() {
                println!("No packages found.");
            } else {
                println!("Installed packages:");
                for package in &packages {
                    println!(
                        "  {} ({} files, transaction {})",
                        package.header.nevra(),
                        package.header.files.len(),
                        package.install_tid
                    );
                }
                println!("\nTotal: {} package(s)", packages.len());
            }
            Ok(())
        }
        Some(Commands::History { db_path }) => {
            let conn = pkgtx::db::open(&db_path)?;
            let changesets = Changeset::list_all(&conn)?;

            if changesets.is_empty() {
                println!("No transaction history.");
            } else {
                println!("Transaction history:");
                for changeset in &changesets {
                    let timestamp = changeset
                        .finished_at
                        .as_ref()
                        .or(changeset.created_at.as_ref())
                        .map(|s| s.as_str())
                        .unwrap_or("pending");
                    println!(
                        "  [{}] {} tid {} - {} ({}, {} failed)",
                        changeset.id.unwrap_or_default(),
                        timestamp,
                        changeset.tid,
                        changeset.description,
                        changeset.status.as_str(),
                        changeset.failed_count
                    );
                }
                println!("\nTotal: {} transaction(s)", changesets.len());
            }
            Ok(())
        }
        Some(Commands::Completions { shell }) => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "pkgtx", &mut std::io::stdout());
            Ok(())
        }
        None => {
            println!("pkgtx - run `pkgtx --help` for usage");
            Ok(())
        }
    }
}
