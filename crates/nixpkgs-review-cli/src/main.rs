//! nixpkgs-review - build and report on a set of nixpkgs attributes
//!
//! ## Commands
//!
//! - `build`: evaluate, build, verify and write a review report
//! - `eval`: evaluate only and print the records as JSON

mod config;
mod review;
mod telemetry;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::{
    allowed_features, default_cache_dir, parse_systems, split_build_args, AllowOption,
    ReviewConfig,
};
use nixpkgs_review_github::GITHUB_TOKEN_ENV;
use nixpkgs_review_nix::{current_system, PreBuildFilter, PRE_BUILD_FILTER_ENV};
use nixpkgs_review_report::Checkout;
use std::collections::BTreeSet;
use std::path::PathBuf;
use tracing::debug;

#[derive(Parser)]
#[command(name = "nixpkgs-review")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Build and review nixpkgs attributes", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate and build packages, then write a report
    Build {
        #[command(flatten)]
        args: ReviewArgs,

        /// Build tool, `nix` or `nom`
        #[arg(long, env = "NIXPKGS_REVIEW_BUILD_GRAPH", default_value = "nix")]
        build_graph: String,

        /// Extra arguments for the build tool
        #[arg(long, default_value = "", allow_hyphen_values = true)]
        build_args: String,

        /// Checkout mode the reviewed tree was created with
        #[arg(long, default_value = "merge")]
        checkout: Checkout,

        /// Omit the title and command line from report.md
        #[arg(long)]
        no_headers: bool,

        /// Maximum number of packages listed per section in report.md
        #[arg(long)]
        display_limit: Option<usize>,

        /// Keep only the last N bytes of each log written to logs/
        #[arg(long, value_name = "BYTES")]
        error_log_tail: Option<usize>,

        /// Upload logs of failed builds as gists
        #[arg(long)]
        post_logs: bool,

        /// GitHub API token
        #[arg(long, env = GITHUB_TOKEN_ENV, hide_env_values = true)]
        token: Option<String>,

        /// Repository the reviewed change belongs to
        #[arg(long, default_value = "https://github.com/NixOS/nixpkgs")]
        remote: String,

        /// Directory for report.md, report.json, results and logs (default: cache dir)
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Run the build inside a bubblewrap sandbox (Linux only)
        #[arg(long)]
        sandbox: bool,
    },

    /// Evaluate packages and print the records as JSON
    Eval {
        #[command(flatten)]
        args: ReviewArgs,
    },
}

/// Options shared by `build` and `eval`
#[derive(clap::Args)]
struct ReviewArgs {
    /// Attribute to review; repeat for several
    #[arg(short, long = "package", required = true)]
    packages: Vec<String>,

    /// Systems to review: names, `current` or `all`
    #[arg(long, env = "NIXPKGS_REVIEW_SYSTEMS", default_value = "current")]
    systems: String,

    /// nixpkgs tree to review
    #[arg(long, default_value = ".")]
    nixpkgs: PathBuf,

    /// Pull request number, used for naming and links
    #[arg(long)]
    pr: Option<u64>,

    /// Working directory of the review
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Extra nixpkgs config merged into the default one
    #[arg(long, default_value = "{ }")]
    extra_nixpkgs_config: String,

    /// Nix features to allow during evaluation
    #[arg(long, value_enum, value_delimiter = ',')]
    allow: Vec<AllowOption>,

    /// Maximum number of concurrent evaluations (default: number of systems)
    #[arg(long, env = "NIXPKGS_REVIEW_EVAL_THREADS")]
    num_parallel_evals: Option<usize>,

    /// Colon separated pre-build filter executables
    #[arg(long, env = PRE_BUILD_FILTER_ENV, default_value = "")]
    pre_build_filter: String,
}

impl ReviewArgs {
    fn into_config(self) -> Result<ReviewConfig> {
        let local_system = current_system();
        let systems = parse_systems(&self.systems, &local_system)?;
        let cache_dir = match self.cache_dir {
            Some(dir) => dir,
            None => default_cache_dir(self.pr)?,
        };
        let eval_threads = self.num_parallel_evals.unwrap_or(systems.len()).max(1);

        Ok(ReviewConfig {
            packages: self.packages.into_iter().collect::<BTreeSet<_>>(),
            systems,
            local_system,
            nixpkgs: self.nixpkgs,
            output_dir: cache_dir.clone(),
            cache_dir,
            pr: self.pr,
            build_graph: "nix".to_string(),
            build_args: Vec::new(),
            allow: allowed_features(&self.allow),
            extra_nixpkgs_config: self.extra_nixpkgs_config,
            checkout: Checkout::Merge,
            show_header: true,
            display_limit: None,
            error_log_tail: None,
            post_logs: false,
            token: None,
            remote: String::new(),
            eval_threads,
            sandbox: false,
            pre_build_filter: PreBuildFilter::parse(&self.pre_build_filter),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init_tracing(cli.json_logs, telemetry::level_for(cli.verbose));

    match cli.command {
        Commands::Build {
            args,
            build_graph,
            build_args,
            checkout,
            no_headers,
            display_limit,
            error_log_tail,
            post_logs,
            token,
            remote,
            output_dir,
            sandbox,
        } => {
            let mut config = args.into_config()?;
            config.build_graph = build_graph;
            config.build_args = split_build_args(&build_args);
            config.checkout = checkout;
            config.show_header = !no_headers;
            config.display_limit = display_limit;
            config.error_log_tail = error_log_tail;
            config.post_logs = post_logs;
            config.token = token;
            config.remote = remote;
            config.sandbox = sandbox;
            if let Some(dir) = output_dir {
                config.output_dir = dir;
            }
            debug!(
                systems = ?config.systems,
                packages = config.packages.len(),
                cache_dir = %config.cache_dir.display(),
                "Starting review"
            );

            let succeeded = review::run_build(&config).await?;
            if !succeeded {
                std::process::exit(1);
            }
        }
        Commands::Eval { args } => {
            let config = args.into_config()?;
            let attrs = review::run_eval(&config).await?;
            let json = serde_json::to_string_pretty(&attrs).context("Failed to serialize records")?;
            println!("{json}");
        }
    }

    Ok(())
}
