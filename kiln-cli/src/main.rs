//! kiln command line interface.
//!
//! Parses flags, sets up logging and the execution context, and hands off
//! to the command orchestrators in `kiln-core`. Diagnostic logs go to
//! stderr so the structured event stream on stdout stays parseable.

use std::collections::HashMap;

use anyhow::Result;
use clap::builder::PossibleValuesParser;
use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use kiln_core::context::output::no_color;
use kiln_core::engine::{
    default_build_arch, BuildParams, GenericParams, AMD64_ARCH, ARM64_ARCH, DEFAULT_CONTEXT_DIR,
    DEFAULT_DOCKERFILE_PATH, DEFAULT_ENGINE, DEFAULT_IMAGE_ARCHIVE_FILE, DEFAULT_IMAGE_NAME,
    DOCKER_RUNTIME, NONE_RUNTIME, PODMAN_RUNTIME,
};
use kiln_core::{build, paths, push, version};
use kiln_core::{ExecutionContext, ExitCause, ExitCode, OutputFormat};

mod provider;

use provider::DefaultClientProvider;

#[derive(Parser)]
#[command(name = "kiln")]
#[command(version, about = "Build and publish container images", long_about = None)]
struct Cli {
    /// Console output format: text, json or subscription
    #[arg(long, global = true, default_value = "text", env = "KILN_OUTPUT_FORMAT")]
    output_format: String,

    /// Suppress console output
    #[arg(long, global = true, env = "KILN_QUIET")]
    quiet: bool,

    /// Disable colorized output
    #[arg(long, global = true, env = "KILN_NO_COLOR")]
    no_color: bool,

    /// Enable debug logs and diagnostic version info
    #[arg(long, global = true, env = "KILN_DEBUG")]
    debug: bool,

    /// Run report file location ("off" to disable)
    #[arg(long, global = true, env = "KILN_REPORT")]
    report: Option<String>,

    /// Check for newer releases while the command runs
    #[arg(
        long,
        global = true,
        env = "KILN_CHECK_VERSION",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    check_version: bool,

    /// Indicates kiln is running inside a container
    #[arg(long, global = true, env = "KILN_IN_CONTAINER", hide = true)]
    in_container: bool,

    /// Indicates kiln is running inside its official distribution image
    #[arg(long, global = true, env = "KILN_IS_KILN_IMAGE", hide = true)]
    is_kiln_image: bool,

    /// Explicit container runtime connection URI (Podman)
    #[arg(long, global = true, env = "KILN_RUNTIME_CONNECTION")]
    runtime_connection: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a container image
    Build {
        /// Build engine: docker, buildkit, depot, podman or simple
        #[arg(long, default_value = DEFAULT_ENGINE)]
        engine: String,

        /// Build engine endpoint address
        #[arg(long, default_value = "")]
        engine_endpoint: String,

        /// Build engine API token
        #[arg(long, default_value = "")]
        engine_token: String,

        /// Build engine namespace (e.g. the depot project)
        #[arg(long, default_value = "")]
        engine_namespace: String,

        /// Name and tag for the built image
        #[arg(short, long, default_value = DEFAULT_IMAGE_NAME)]
        tag: String,

        /// Where to write the produced image archive
        #[arg(long, default_value = DEFAULT_IMAGE_ARCHIVE_FILE)]
        image_archive: String,

        /// Dockerfile location relative to the build context
        #[arg(short = 'f', long, default_value = DEFAULT_DOCKERFILE_PATH)]
        dockerfile: String,

        /// Build-time variables (KEY=VALUE)
        #[arg(long = "build-arg", value_parser = parse_key_val)]
        build_args: Vec<(String, String)>,

        /// Image labels (KEY=VALUE)
        #[arg(long = "label", value_parser = parse_key_val)]
        labels: Vec<(String, String)>,

        /// Target build architecture
        #[arg(
            long,
            default_value_t = default_build_arch().to_string(),
            value_parser = PossibleValuesParser::new([AMD64_ARCH, ARM64_ARCH])
        )]
        arch: String,

        /// Base image reference (simple engine)
        #[arg(long, default_value = "")]
        base_image: String,

        /// Base image archive file (simple engine)
        #[arg(long, default_value = "")]
        base_tar: String,

        /// Use a minimal CA-certificates base (simple engine)
        #[arg(long)]
        base_with_certs: bool,

        /// Executable to place at the image root (simple engine)
        #[arg(long, default_value = "")]
        exe_path: String,

        /// Load the built image into a local runtime (repeatable)
        #[arg(
            long = "load",
            value_parser = PossibleValuesParser::new([NONE_RUNTIME, DOCKER_RUNTIME, PODMAN_RUNTIME])
        )]
        load: Vec<String>,

        /// Push the built image to its registry
        #[arg(long)]
        push: bool,

        /// Use Docker CLI stored registry credentials
        #[arg(long)]
        use_docker_creds: bool,

        /// Registry account name
        #[arg(long, default_value = "", env = "KILN_CREDS_ACCOUNT")]
        creds_account: String,

        /// Registry account secret
        #[arg(long, default_value = "", env = "KILN_CREDS_SECRET")]
        creds_secret: String,

        /// Build context directory
        #[arg(default_value = DEFAULT_CONTEXT_DIR)]
        context_dir: String,
    },

    /// Push an existing image to a registry
    Push {
        /// Source image reference
        target: String,

        /// Tag to push under (defaults to the source reference)
        #[arg(long, default_value = "")]
        as_tag: String,

        /// Use Docker CLI stored registry credentials
        #[arg(long)]
        use_docker_creds: bool,

        /// Registry account name
        #[arg(long, default_value = "", env = "KILN_CREDS_ACCOUNT")]
        creds_account: String,

        /// Registry account secret
        #[arg(long, default_value = "", env = "KILN_CREDS_SECRET")]
        creds_secret: String,
    },

    /// Show version information
    Version,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", s)),
    }
}

fn init_tracing(debug: bool) {
    let default_level = if debug { Level::DEBUG } else { Level::WARN };
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(default_level.into()))
        .with(
            tracing_subscriber::fmt::layer().with_target(true).with_writer(std::io::stderr),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);
    if cli.no_color {
        no_color();
    }

    let cmd_name = match &cli.command {
        Commands::Build { .. } => build::COMMAND_NAME,
        Commands::Push { .. } => push::COMMAND_NAME,
        Commands::Version => "version",
    };

    let format = match cli.output_format.parse::<OutputFormat>() {
        Ok(format) => format,
        Err(err) => {
            let xc = ExecutionContext::new(cmd_name, cli.quiet, OutputFormat::Text, HashMap::new());
            xc.out().error("param.output.format", &err.to_string());
            xc.exit(ExitCode::common(ExitCause::UnsupportedOutputFormat));
        }
    };

    let xc = ExecutionContext::new(cmd_name, cli.quiet, format, HashMap::new());

    let gparams = GenericParams {
        check_version: cli.check_version,
        debug: cli.debug,
        in_container: cli.in_container,
        is_kiln_image: cli.is_kiln_image,
        report_location: cli
            .report
            .clone()
            .unwrap_or_else(|| paths::default_report_path(cmd_name)),
        runtime_connection: cli.runtime_connection.clone(),
    };
    let provider = DefaultClientProvider::new(cli.runtime_connection.clone());

    match cli.command {
        Commands::Build {
            engine,
            engine_endpoint,
            engine_token,
            engine_namespace,
            tag,
            image_archive,
            dockerfile,
            build_args,
            labels,
            arch,
            base_image,
            base_tar,
            base_with_certs,
            exe_path,
            load,
            push,
            use_docker_creds,
            creds_account,
            creds_secret,
            context_dir,
        } => {
            let cparams = BuildParams {
                engine,
                engine_endpoint,
                engine_token,
                engine_namespace,
                image_name: tag,
                image_archive_file: image_archive,
                dockerfile,
                context_dir,
                build_args: build_args.into_iter().collect(),
                labels: labels.into_iter().collect(),
                architecture: arch,
                base_image,
                base_tar,
                base_with_certs,
                exe_path,
                load_runtimes: load,
                registry_push: push,
                use_docker_creds,
                creds_account,
                creds_secret,
            };
            build::run(&xc, &gparams, &cparams, &provider).await;
        }
        Commands::Push { target, as_tag, use_docker_creds, creds_account, creds_secret } => {
            let cparams = push::PushParams {
                target_ref: target,
                as_tag,
                use_docker_creds,
                creds_account,
                creds_secret,
            };
            push::run(&xc, &gparams, &cparams, &provider).await;
        }
        Commands::Version => {
            version::print_version_info(&xc, cli.in_container, cli.is_kiln_image);
        }
    }

    xc.out().shutdown().await;
    xc.exit(ExitCode::SUCCESS)
}
