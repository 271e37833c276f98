//! Command-line flags and search path precedence.

use crate::config::Config;
use clap::Parser;
use clap_complete::Shell;
use std::ffi::OsStr;
use std::num::NonZeroUsize;
use std::path::PathBuf;

const AFTER_LONG_HELP: &str = "\
ENVIRONMENT VARIABLES

JSONNET_PATH is a colon- (semicolon on Windows) separated list of directories
added in reverse order before the paths specified by --jpath (i.e. left-most
wins). The following three invocations are equivalent:
    JSONNET_PATH=a:b jty -J c -J d
    JSONNET_PATH=d:c:a:b jty
    jty -J b -J a -J c -J d

EXAMPLE USES

Evaluate in.jsonnet and save the resulting YAML as out.yaml:
    jty in.jsonnet out.yaml

Evaluate multiple .jsonnet files and save the resulting YAML in specific locations:
    jty in1.jsonnet out/1.yaml conf.jsonnet conf.yaml

Evaluate each .jsonnet file under the current directory,
and save the .yml file adjacent to the .jsonnet file:
    find . -name '*.jsonnet' \\
      -exec bash -c 'for p in \"$@\"; do
        printf \"%s\\n%s.yml\\n\" \"$p\" \"${p%.jsonnet}\"
        done' _ {} + |
      jty -i
";

#[derive(Parser, Debug)]
#[command(name = "jty", version)]
#[command(about = "Render Jsonnet files to YAML", long_about = None)]
#[command(override_usage = "jty [OPTIONS] [INPUT_JSONNET OUTPUT_YAML]...")]
#[command(after_long_help = AFTER_LONG_HELP)]
pub struct Cli {
    /// Alternating input Jsonnet and output YAML paths
    #[arg(value_name = "FILE")]
    pub files: Vec<String>,

    /// Print to stdout what processing would be done, without touching any files on disk
    #[arg(short = 'n', long)]
    pub dry_run: bool,

    /// Read the input-output pairs of files from stdin
    #[arg(short = 'i', long = "stdin")]
    pub stdin: bool,

    /// Expect NUL-separated input-output pairs from stdin. Implies -i
    #[arg(short = 'z', long)]
    pub zero: bool,

    /// Add a library search directory (rightmost wins). May be repeated
    #[arg(short = 'J', long = "jpath", value_name = "DIR")]
    pub jpath: Vec<PathBuf>,

    /// Number of read and write workers (default: available parallelism)
    #[arg(short = 'j', long, value_name = "N")]
    pub jobs: Option<NonZeroUsize>,

    /// Verbose output (debug logging on stderr)
    #[arg(short, long)]
    pub verbose: bool,

    /// Path to config file (default: ~/.config/jty/config.toml)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Print shell completions and exit
    #[arg(long, value_name = "SHELL", exclusive = true)]
    pub completions: Option<Shell>,

    /// Print a man page and exit
    #[arg(long, exclusive = true)]
    pub manpage: bool,
}

impl Cli {
    /// Resolve the run options from parsed flags, the config file and the
    /// value of `JSONNET_PATH`.
    pub fn into_flags(self, config: &Config, jsonnet_path: Option<&OsStr>) -> Flags {
        let mut jpaths = config.defaults.jpaths.clone();
        jpaths.extend(self.jpath);

        let mut flags = Flags {
            args: self.files,
            dry_run: self.dry_run,
            from_stdin: self.stdin,
            zero: self.zero,
            jpaths,
            jobs: self.jobs.or(config.defaults.jobs),
        };
        flags.finish_parse(jsonnet_path);
        flags
    }
}

/// The options a run of [`Command`](crate::command::Command) consumes.
#[derive(Debug, Clone, Default)]
pub struct Flags {
    /// Positional input/output paths.
    pub args: Vec<String>,

    pub dry_run: bool,
    pub from_stdin: bool,
    pub zero: bool,

    /// Library search paths, lowest priority first.
    pub jpaths: Vec<PathBuf>,

    /// Read/write worker count; `None` means available parallelism.
    pub jobs: Option<NonZeroUsize>,
}

impl Flags {
    /// Apply implied options and merge `JSONNET_PATH` into the search paths.
    ///
    /// Environment entries are reversed (left-most wins among them) and
    /// placed before every explicitly configured path.
    pub fn finish_parse(&mut self, jsonnet_path: Option<&OsStr>) {
        if self.zero {
            self.from_stdin = true;
        }

        if let Some(value) = jsonnet_path.filter(|v| !v.is_empty()) {
            let mut jpaths: Vec<PathBuf> = std::env::split_paths(value)
                .filter(|p| !p.as_os_str().is_empty())
                .collect();
            jpaths.reverse();
            jpaths.append(&mut self.jpaths);
            self.jpaths = jpaths;
        }
    }

    /// Number of read workers and of write workers.
    pub fn workers(&self) -> usize {
        self.jobs
            .or_else(|| std::thread::available_parallelism().ok())
            .map_or(1, NonZeroUsize::get)
    }
}
