use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "tarn",
    about = "Inspect and maintain Tarn store files",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Log at debug level (RUST_LOG overrides).
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// TOML file with `[store]` and `[signal]` settings.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Show the file's version, schema and space usage
    Info(InfoArgs),
    /// Print the objects of one or every table
    Dump(DumpArgs),
    /// Show retained transaction logs, newest first
    History(HistoryArgs),
    /// Summarize what changed between two versions
    Diff(DiffArgs),
    /// Write a compacted copy of the latest version
    Compact(CompactArgs),
    /// Print change notifications for a table as commits arrive
    Watch(WatchArgs),
}

#[derive(Args)]
pub struct InfoArgs {
    pub path: PathBuf,
}

#[derive(Args)]
pub struct DumpArgs {
    pub path: PathBuf,
    #[arg(short, long)]
    pub table: Option<String>,
    /// Read this version instead of the latest.
    #[arg(long)]
    pub version: Option<u64>,
}

#[derive(Args)]
pub struct HistoryArgs {
    pub path: PathBuf,
    #[arg(short = 'n', long, default_value = "20")]
    pub limit: usize,
    /// Print every record, not just counts.
    #[arg(long)]
    pub records: bool,
}

#[derive(Args)]
pub struct DiffArgs {
    pub path: PathBuf,
    pub from: u64,
    /// Defaults to the latest version.
    pub to: Option<u64>,
}

#[derive(Args)]
pub struct CompactArgs {
    pub path: PathBuf,
    pub dest: PathBuf,
}

#[derive(Args)]
pub struct WatchArgs {
    pub path: PathBuf,
    pub table: String,
    /// Stop after this many events.
    #[arg(long)]
    pub count: Option<usize>,
    /// Stop after this many seconds.
    #[arg(long)]
    pub timeout: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_flags_follow_the_subcommand() {
        let cli = Cli::try_parse_from([
            "tarn", "diff", "db.tarn", "3", "--format", "json", "-v",
        ])
        .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.format, OutputFormat::Json);
        match cli.command {
            Command::Diff(args) => {
                assert_eq!(args.from, 3);
                assert_eq!(args.to, None);
            }
            _ => panic!("expected diff"),
        }
    }
}
